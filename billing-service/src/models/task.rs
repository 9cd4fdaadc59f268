//! Queued unit of work.

use serde::{Deserialize, Serialize};

/// A task as stored on a broker list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unix seconds at first enqueue; preserved across retries.
    pub created_at: i64,
    pub args: serde_json::Value,
    pub description: String,
    /// Attempts remaining. Decremented by the worker before the handler runs.
    pub attempts: u32,
}
