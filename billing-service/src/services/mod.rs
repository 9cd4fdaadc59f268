//! Services module for billing-service.

pub mod broker;
pub mod database;
pub mod error;
pub mod ledger;
pub mod metrics;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use database::Database;
pub use error::BillingError;
pub use ledger::{Ledger, LedgerSettings};
pub use metrics::{get_metrics, init_metrics};
