use crate::models::{Service, ServiceStatus};
use crate::provisioning::dispatcher::Dispatcher;
use crate::provisioning::extension::Extension;
use crate::services::database::Database;
use crate::services::error::BillingError;
use chrono::Utc;
use std::sync::Arc;

/// Admin and customer operations on a single service.
#[derive(Clone)]
pub struct ServiceActions {
    db: Database,
    dispatcher: Dispatcher,
}

impl ServiceActions {
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Load an actionable service and its extension.
    async fn load(&self, service_id: i32) -> Result<(Service, Arc<dyn Extension>), BillingError> {
        let service = self
            .db
            .find_service(self.db.pool(), service_id)
            .await?
            .ok_or(BillingError::ServiceNotFound(service_id))?;

        if service.is_cancelled() {
            return Err(BillingError::ServiceCancelled);
        }

        let extension = self.dispatcher.extensions().get(&service.extension)?;
        Ok((service, extension))
    }

    pub async fn admin_actions(&self, service_id: i32) -> Result<Vec<String>, BillingError> {
        let (_, extension) = self.load(service_id).await?;
        Ok(extension.admin_actions(service_id).await?)
    }

    pub async fn client_actions(&self, service_id: i32) -> Result<Vec<String>, BillingError> {
        let (_, extension) = self.load(service_id).await?;
        Ok(extension.client_actions(service_id).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn perform_admin_action(
        &self,
        service_id: i32,
        action: &str,
    ) -> Result<(), BillingError> {
        let (service, extension) = self.load(service_id).await?;

        let offered = extension.admin_actions(service_id).await?;
        if !offered.iter().any(|a| a == action) {
            return Err(BillingError::InvalidAction(action.to_string()));
        }

        self.dispatcher
            .do_action_async(&service.extension, service_id, action, None)
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn perform_client_action(
        &self,
        user_id: i32,
        service_id: i32,
        action: &str,
    ) -> Result<(), BillingError> {
        let (service, extension) = self.load(service_id).await?;

        if service.user_id != user_id {
            return Err(BillingError::Forbidden);
        }

        let offered = extension.client_actions(service_id).await?;
        if !offered.iter().any(|a| a == action) {
            return Err(BillingError::InvalidAction(action.to_string()));
        }

        self.dispatcher
            .do_action_async(&service.extension, service_id, action, None)
            .await
    }

    /// Change a service's status, optionally through the extension action that
    /// brings the backend into that state. Runs under the service's row lock so a
    /// concurrent cancellation is never overwritten.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        service_id: i32,
        status: ServiceStatus,
        run_action: bool,
        cancellation_reason: Option<&str>,
    ) -> Result<(), BillingError> {
        let mut tx = self.db.pool().begin().await?;

        let service = self
            .db
            .find_service_for_update(&mut *tx, service_id)
            .await?
            .ok_or(BillingError::ServiceNotFound(service_id))?;

        if service.is_cancelled() {
            return Err(BillingError::ServiceCancelled);
        }

        match status.transition_action() {
            Some(action) if run_action => {
                if status == ServiceStatus::Cancelled {
                    self.db
                        .record_service_cancellation(
                            &mut *tx,
                            service_id,
                            cancellation_reason,
                            Utc::now(),
                        )
                        .await?;
                }

                // A rejected dispatch drops the transaction, so no reason is left behind.
                self.dispatcher
                    .do_action_async(&service.extension, service_id, action, Some(status))
                    .await?;
            }
            _ if status == ServiceStatus::Cancelled => {
                tracing::info!(service_id = service_id, "Admin cancelling service");
                self.db
                    .update_service_cancelled(&mut *tx, service_id, cancellation_reason, Utc::now())
                    .await?;
            }
            _ => {
                self.db
                    .update_service_status(&mut *tx, service_id, status)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
