use crate::services::error::BillingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Describes one configurable field an extension exposes to the admin UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingField {
    pub display_name: String,
    pub name: String,
    pub placeholder: String,
    /// Input kind, e.g. `text`, `number`, `select`.
    pub kind: String,
    /// Choices for `select` fields.
    pub values: Vec<String>,
    pub description: String,
    pub regex: String,
}

impl SettingField {
    pub fn text(name: &str, display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            name: name.to_string(),
            kind: "text".to_string(),
            ..Default::default()
        }
    }
}

/// A provisioning backend. Implementations drive an external system (a
/// hypervisor, a panel) and must tolerate an action being re-run after a crash.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Per-product settings schema, given the values entered so far.
    async fn product_settings(
        &self,
        inputs: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<SettingField>>;

    async fn server_settings(&self) -> anyhow::Result<Vec<SettingField>>;

    async fn action(&self, service_id: i32, action: &str) -> anyhow::Result<()>;

    /// Actions a customer may invoke on the service in its current state.
    async fn client_actions(&self, service_id: i32) -> anyhow::Result<Vec<String>>;

    async fn admin_actions(&self, service_id: i32) -> anyhow::Result<Vec<String>>;
}

/// Extensions by name, built once at startup and shared.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        self.extensions
            .insert(extension.name().to_string(), extension);
    }

    pub fn with(mut self, extension: Arc<dyn Extension>) -> Self {
        self.register(extension);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Extension>, BillingError> {
        self.extensions
            .get(name)
            .cloned()
            .ok_or_else(|| BillingError::ExtensionNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.extensions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn init_all(&self) -> Result<(), BillingError> {
        for name in self.names() {
            let extension = self.get(&name)?;
            extension.init().await.map_err(|e| {
                tracing::error!(extension = %name, error = %e, "Extension init failed");
                BillingError::Internal(e.context(format!("init extension {}", name)))
            })?;
            tracing::info!(extension = %name, "Extension initialised");
        }
        Ok(())
    }
}

/// Task queue carrying actions for one extension.
pub fn queue_name(extension: &str) -> String {
    format!("extension_action_{}", extension.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::NoneExtension;

    #[test]
    fn queue_name_is_lowercased() {
        assert_eq!(queue_name("Proxmox"), "extension_action_proxmox");
    }

    #[tokio::test]
    async fn unknown_extension_is_reported_by_name() {
        let registry = ExtensionRegistry::new().with(Arc::new(NoneExtension));
        assert!(registry.get("None").is_ok());
        match registry.get("Proxmox") {
            Err(BillingError::ExtensionNotFound(name)) => assert_eq!(name, "Proxmox"),
            other => panic!("unexpected: {:?}", other.map(|e| e.name().to_string())),
        }
        registry.init_all().await.unwrap();
    }
}
