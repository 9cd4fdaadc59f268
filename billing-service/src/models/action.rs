//! Provisioning action payloads and the per-service lock record.

use crate::models::ServiceStatus;
use serde::{Deserialize, Serialize};

/// Arguments of an extension action task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTaskArgs {
    pub service_id: i32,
    pub action: String,
    #[serde(default)]
    pub new_status: Option<ServiceStatus>,
}

/// Value held under `service_<id>_action_lock` while an action is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLock {
    /// Human readable, e.g. `Pending action: CREATE`.
    pub description: String,
    /// Unix seconds when the lock was taken.
    pub acquired_at: i64,
}

/// Progress of actions on a service, as shown to a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub pending: Option<String>,
    pub info: Option<String>,
    pub error: Option<String>,
}
