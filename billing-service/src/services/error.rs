use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("another action is running for this service")]
    ActionAlreadyRunning,

    #[error("service is cancelled")]
    ServiceCancelled,

    #[error("an unpaid invoice already exists for this service")]
    UnpaidInvoiceExists,

    #[error("action {action} on service #{service_id} failed: {source}")]
    BackendActionFailed {
        service_id: i32,
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service {0} not found")]
    ServiceNotFound(i32),

    #[error("invoice {0} not found")]
    InvoiceNotFound(i32),

    #[error("extension {0} not found")]
    ExtensionNotFound(String),

    #[error("gateway {0} not found")]
    GatewayNotFound(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invoice {0} is not payable")]
    InvoiceNotPayable(i32),

    #[error("forbidden")]
    Forbidden,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::ActionAlreadyRunning => {
                AppError::Conflict(anyhow::anyhow!("another action is running for this service"))
            }
            BillingError::ServiceCancelled => {
                AppError::BadRequest(anyhow::anyhow!("service is cancelled"))
            }
            BillingError::UnpaidInvoiceExists => AppError::Conflict(anyhow::anyhow!(
                "an unpaid invoice already exists for this service"
            )),
            e @ BillingError::BackendActionFailed { .. } => AppError::BadGateway(e.to_string()),
            e @ (BillingError::ServiceNotFound(_)
            | BillingError::InvoiceNotFound(_)
            | BillingError::ExtensionNotFound(_)
            | BillingError::GatewayNotFound(_)) => AppError::NotFound(anyhow::anyhow!(e.to_string())),
            e @ (BillingError::InvalidAction(_)
            | BillingError::InvoiceNotPayable(_)
            | BillingError::Validation(_)) => AppError::BadRequest(anyhow::anyhow!(e.to_string())),
            BillingError::Forbidden => AppError::Forbidden(anyhow::anyhow!("forbidden")),
            BillingError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            BillingError::Redis(e) => AppError::RedisError(e),
            BillingError::Encoding(e) => AppError::InternalError(anyhow::Error::new(e)),
            BillingError::Internal(e) => AppError::InternalError(e),
        }
    }
}
