use crate::provisioning::extension::{Extension, SettingField};
use async_trait::async_trait;
use std::collections::HashMap;

/// Backend for services with nothing to provision. Accepts every action and
/// offers none.
pub struct NoneExtension;

#[async_trait]
impl Extension for NoneExtension {
    fn name(&self) -> &str {
        "None"
    }

    async fn product_settings(
        &self,
        _inputs: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<SettingField>> {
        Ok(Vec::new())
    }

    async fn server_settings(&self) -> anyhow::Result<Vec<SettingField>> {
        Ok(Vec::new())
    }

    async fn action(&self, service_id: i32, action: &str) -> anyhow::Result<()> {
        tracing::debug!(service_id = service_id, action = action, "No-op extension action");
        Ok(())
    }

    async fn client_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn admin_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}
