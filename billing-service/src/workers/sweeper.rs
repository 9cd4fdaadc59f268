use crate::models::{InvoiceItem, ServiceStatus};
use crate::provisioning::Dispatcher;
use crate::services::database::Database;
use crate::services::error::BillingError;
use crate::services::metrics::record_sweep_run;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub initial_delay: Duration,
    /// Action locks older than this are released. `None` disables lock reaping.
    pub stale_lock_threshold: Option<Duration>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(5),
            stale_lock_threshold: Some(Duration::from_secs(7200)),
        }
    }
}

/// Periodic reconciliation of invoices and services that missed their deadline.
/// Every pass re-scans the overdue predicates, so a skipped or failed pass only
/// delays cleanup.
#[derive(Clone)]
pub struct OverdueSweeper {
    db: Database,
    dispatcher: Dispatcher,
    settings: SweepSettings,
}

impl OverdueSweeper {
    pub fn new(db: Database, dispatcher: Dispatcher, settings: SweepSettings) -> Self {
        Self {
            db,
            dispatcher,
            settings,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            "Starting overdue sweeper"
        );

        let mut ticker = interval_at(
            Instant::now() + self.settings.initial_delay,
            self.settings.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Overdue sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// One full pass. Each sweep's failure is logged and does not stop the others.
    pub async fn run_once(&self) {
        match self.close_overdue_invoices().await {
            Ok(count) => {
                record_sweep_run("close_overdue_invoices", "ok");
                if count > 0 {
                    info!(count = count, "Closed overdue invoices");
                }
            }
            Err(e) => {
                record_sweep_run("close_overdue_invoices", "error");
                error!(error = %e, "Failed to close overdue invoices");
            }
        }

        match self.cancel_overdue_services().await {
            Ok(count) => {
                record_sweep_run("cancel_overdue_services", "ok");
                if count > 0 {
                    info!(count = count, "Requested termination of expired services");
                }
            }
            Err(e) => {
                record_sweep_run("cancel_overdue_services", "error");
                error!(error = %e, "Failed to cancel overdue services");
            }
        }

        if let Some(threshold) = self.settings.stale_lock_threshold {
            match self.dispatcher.release_stale_locks(threshold).await {
                Ok(count) => {
                    record_sweep_run("release_stale_locks", "ok");
                    if count > 0 {
                        warn!(count = count, "Released stale action locks");
                    }
                }
                Err(e) => {
                    record_sweep_run("release_stale_locks", "error");
                    error!(error = %e, "Failed to release stale action locks");
                }
            }
        }
    }

    /// Cancel UNPAID invoices past their due date, and the UNPAID services they bill.
    #[instrument(skip(self))]
    pub async fn close_overdue_invoices(&self) -> Result<usize, BillingError> {
        let now = Utc::now();
        let invoices = self.db.find_overdue_invoices(self.db.pool(), now).await?;

        let mut closed = 0;
        for invoice in invoices {
            if self.close_invoice(invoice.id, now).await? {
                closed += 1;
            }
        }

        Ok(closed)
    }

    async fn close_invoice(&self, invoice_id: i32, now: DateTime<Utc>) -> Result<bool, BillingError> {
        let mut tx = self.db.pool().begin().await?;

        let Some(invoice) = self.db.find_invoice_for_update(&mut *tx, invoice_id).await? else {
            return Ok(false);
        };

        // A payment may have settled it since the scan.
        if !invoice.is_unpaid() || !invoice.is_overdue_at(now) {
            return Ok(false);
        }

        info!(invoice_id = invoice_id, "Cancelling overdue invoice");
        self.db
            .update_invoice_cancelled(&mut *tx, invoice_id, "overdue")
            .await?;

        let items = self.db.list_invoice_items(&mut *tx, invoice_id).await?;
        for service_id in items.iter().filter_map(InvoiceItem::service_id) {
            let Some(service) = self.db.find_service_for_update(&mut *tx, service_id).await? else {
                warn!(invoice_id = invoice_id, service_id = service_id, "Invoice references missing service");
                continue;
            };

            if service.status() != Some(ServiceStatus::Unpaid) {
                continue;
            }

            info!(invoice_id = invoice_id, service_id = service_id, "Cancelling overdue unpaid service");
            self.db
                .update_service_cancelled(&mut *tx, service_id, Some("invoice overdue"), now)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Request termination of every expired, not yet cancelled service.
    #[instrument(skip(self))]
    pub async fn cancel_overdue_services(&self) -> Result<usize, BillingError> {
        let services = self
            .db
            .find_overdue_services(self.db.pool(), Utc::now())
            .await?;

        let mut requested = 0;
        for service in services {
            match self
                .dispatcher
                .do_action_async(
                    &service.extension,
                    service.id,
                    "terminate",
                    Some(ServiceStatus::Cancelled),
                )
                .await
            {
                Ok(()) => {
                    info!(service_id = service.id, expires_at = %service.expires_at, "Expired service termination requested");
                    requested += 1;
                }
                Err(BillingError::ActionAlreadyRunning) => {
                    warn!(service_id = service.id, "Action already running, retrying next sweep");
                }
                Err(e @ BillingError::ExtensionNotFound(_)) => {
                    warn!(service_id = service.id, error = %e, "Skipping expired service");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(requested)
    }
}
