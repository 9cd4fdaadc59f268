//! Service model.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;

/// Service lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
    Unpaid,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "PENDING",
            ServiceStatus::Active => "ACTIVE",
            ServiceStatus::Suspended => "SUSPENDED",
            ServiceStatus::Cancelled => "CANCELLED",
            ServiceStatus::Unpaid => "UNPAID",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ServiceStatus::Pending),
            "ACTIVE" => Some(ServiceStatus::Active),
            "SUSPENDED" => Some(ServiceStatus::Suspended),
            "CANCELLED" => Some(ServiceStatus::Cancelled),
            "UNPAID" => Some(ServiceStatus::Unpaid),
            _ => None,
        }
    }

    /// The extension action that brings a service into this status, if any.
    pub fn transition_action(&self) -> Option<&'static str> {
        match self {
            ServiceStatus::Suspended => Some("suspend"),
            ServiceStatus::Cancelled => Some("terminate"),
            ServiceStatus::Active => Some("create"),
            ServiceStatus::Pending | ServiceStatus::Unpaid => None,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned, billable resource.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: i32,
    pub label: String,
    pub user_id: i32,
    pub status: String,
    /// Billing cycle length in seconds.
    pub billing_cycle: i64,
    pub price: Decimal,
    pub expires_at: DateTime<Utc>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub extension: String,
    pub settings: Json<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn status(&self) -> Option<ServiceStatus> {
        ServiceStatus::from_string(&self.status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == Some(ServiceStatus::Cancelled)
    }

    pub fn billing_cycle_duration(&self) -> Duration {
        Duration::seconds(self.billing_cycle)
    }
}

/// Input for creating a service at purchase time.
#[derive(Debug, Clone)]
pub struct CreateService {
    pub label: String,
    pub user_id: i32,
    pub status: ServiceStatus,
    pub billing_cycle: i64,
    pub price: Decimal,
    pub expires_at: DateTime<Utc>,
    pub extension: String,
    pub settings: HashMap<String, String>,
}
