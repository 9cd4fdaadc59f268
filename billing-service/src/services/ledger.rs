//! Invoice ledger: renewal invoices, payments and the effects of an invoice
//! becoming PAID.

use crate::gateways::GatewayRegistry;
use crate::models::{
    CreateInvoice, CreateInvoiceItem, CreatePayment, CreateService, Invoice, InvoiceItem,
    InvoiceItemType, InvoiceStatus, Payment, Service, ServiceStatus,
};
use crate::provisioning::Dispatcher;
use crate::services::database::Database;
use crate::services::error::BillingError;
use crate::services::metrics::record_ledger_event;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Time from invoice creation to its due date.
    pub invoice_due: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            invoice_due: Duration::hours(168),
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: Database,
    dispatcher: Dispatcher,
    gateways: Arc<GatewayRegistry>,
    settings: LedgerSettings,
}

impl Ledger {
    pub fn new(
        db: Database,
        dispatcher: Dispatcher,
        gateways: Arc<GatewayRegistry>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            db,
            dispatcher,
            gateways,
            settings,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    #[instrument(skip(self, input), fields(label = %input.label))]
    pub async fn create_service(&self, input: CreateService) -> Result<Service, BillingError> {
        if input.price.is_sign_negative() {
            return Err(BillingError::Validation(
                "price must not be negative".to_string(),
            ));
        }
        self.db.create_service(self.db.pool(), &input).await
    }

    /// Create the next renewal invoice for a service in its own transaction.
    pub async fn create_renewal_invoice(
        &self,
        service_id: i32,
        setup_fee: Decimal,
    ) -> Result<Invoice, BillingError> {
        let mut tx = self.db.pool().begin().await?;
        let invoice = self
            .create_renewal_invoice_in(&mut tx, service_id, setup_fee)
            .await?;
        tx.commit().await?;

        record_ledger_event("invoice_created");
        Ok(invoice)
    }

    /// Create the next renewal invoice on a caller-owned transaction, which is
    /// left uncommitted. The service row stays locked until it ends.
    #[instrument(skip(self, conn))]
    pub async fn create_renewal_invoice_in(
        &self,
        conn: &mut PgConnection,
        service_id: i32,
        setup_fee: Decimal,
    ) -> Result<Invoice, BillingError> {
        if setup_fee.is_sign_negative() {
            return Err(BillingError::Validation(
                "setup fee must not be negative".to_string(),
            ));
        }

        let service = self
            .db
            .find_service_for_update(&mut *conn, service_id)
            .await?
            .ok_or(BillingError::ServiceNotFound(service_id))?;

        if service.is_cancelled() {
            return Err(BillingError::ServiceCancelled);
        }

        let existing = self
            .db
            .count_unpaid_invoices_for_service(&mut *conn, service_id)
            .await?;
        if existing > 0 {
            return Err(BillingError::UnpaidInvoiceExists);
        }

        let invoice = self
            .db
            .create_invoice(
                &mut *conn,
                &CreateInvoice {
                    user_id: service.user_id,
                    amount: service.price + setup_fee,
                    due_at: Utc::now() + self.settings.invoice_due,
                },
            )
            .await?;

        let period_end = service.expires_at + service.billing_cycle_duration();
        self.db
            .create_invoice_item(
                &mut *conn,
                &CreateInvoiceItem {
                    invoice_id: invoice.id,
                    description: format!(
                        "#{} - {} ({} - {})",
                        service.id,
                        service.label,
                        service.expires_at.format("%Y-%m-%d %Z"),
                        period_end.format("%Y-%m-%d %Z"),
                    ),
                    amount: service.price,
                    item_type: InvoiceItemType::Service,
                    item_id: Some(service.id),
                },
            )
            .await?;

        if setup_fee > Decimal::ZERO {
            self.db
                .create_invoice_item(
                    &mut *conn,
                    &CreateInvoiceItem {
                        invoice_id: invoice.id,
                        description: format!("#{} - {} - Setup Fee", service.id, service.label),
                        amount: setup_fee,
                        item_type: InvoiceItemType::None,
                        item_id: None,
                    },
                )
                .await?;
        }

        info!(
            invoice_id = invoice.id,
            service_id = service.id,
            user_id = service.user_id,
            price = %service.price,
            setup_fee = %setup_fee,
            due_at = %invoice.due_at,
            "Renewal invoice created"
        );

        Ok(invoice)
    }

    /// Record a payment and settle the invoice once payments cover it.
    /// Returns whether this payment moved the invoice to PAID.
    #[instrument(skip(self, description, reference_id), fields(amount = %amount))]
    pub async fn invoice_add_payment(
        &self,
        invoice_id: i32,
        description: &str,
        amount: Decimal,
        reference_id: &str,
        gateway: &str,
    ) -> Result<bool, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "payment amount must be positive".to_string(),
            ));
        }

        let mut tx = self.db.pool().begin().await?;

        // The row lock serialises concurrent payments on one invoice.
        let invoice = self
            .db
            .find_invoice_for_update(&mut *tx, invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        self.db
            .add_invoice_payment(
                &mut *tx,
                &CreatePayment {
                    invoice_id,
                    description: description.to_string(),
                    amount,
                    reference_id: reference_id.to_string(),
                    gateway: gateway.to_string(),
                },
            )
            .await?;

        let total = self.db.total_invoice_payment(&mut *tx, invoice_id).await?;

        let now = Utc::now();
        let settles = total >= invoice.amount && invoice.is_unpaid() && invoice.due_at > now;
        let paid = settles && self.db.update_invoice_paid(&mut *tx, invoice_id, now).await?;

        tx.commit().await?;
        record_ledger_event("payment_recorded");

        info!(
            invoice_id = invoice_id,
            total_payment = %total,
            invoice_amount = %invoice.amount,
            paid = paid,
            "Payment recorded"
        );

        if paid {
            record_ledger_event("invoice_paid");
            if let Err(e) = self.on_invoice_paid(invoice_id).await {
                error!(invoice_id = invoice_id, error = %e, "Failed to apply paid invoice");
            }
        }

        Ok(paid)
    }

    /// Extend and activate every service on a PAID invoice. Does nothing if the
    /// invoice is not PAID. One item failing does not stop the others.
    ///
    /// Must only run right after the invoice's UNPAID to PAID transition: a second
    /// call would extend the services again.
    #[instrument(skip(self))]
    pub(crate) async fn on_invoice_paid(&self, invoice_id: i32) -> Result<(), BillingError> {
        let mut tx = self.db.pool().begin().await?;

        let invoice = self
            .db
            .find_invoice_for_update(&mut *tx, invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if invoice.status() != Some(InvoiceStatus::Paid) {
            warn!(invoice_id = invoice_id, status = %invoice.status, "Invoice not paid, skipping");
            return Ok(());
        }

        let items = self.db.list_invoice_items(&mut *tx, invoice_id).await?;
        let mut to_create = Vec::new();

        for service_id in items.iter().filter_map(InvoiceItem::service_id) {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match self.apply_paid_service(&mut savepoint, service_id).await {
                Ok(Some(extension)) => {
                    savepoint.commit().await?;
                    to_create.push((service_id, extension));
                }
                Ok(None) => {
                    savepoint.commit().await?;
                }
                Err(e) => {
                    error!(invoice_id = invoice_id, service_id = service_id, error = %e, "Failed to apply paid service");
                    savepoint.rollback().await?;
                }
            }
        }

        tx.commit().await?;

        // Actions only go out once the new expiry and status are durable.
        for (service_id, extension) in to_create {
            self.request_create(service_id, &extension).await;
        }

        Ok(())
    }

    /// Returns the service's extension when it should be offered a `create` action.
    async fn apply_paid_service(
        &self,
        conn: &mut PgConnection,
        service_id: i32,
    ) -> Result<Option<String>, BillingError> {
        let service = self
            .db
            .find_service_for_update(&mut *conn, service_id)
            .await?
            .ok_or(BillingError::ServiceNotFound(service_id))?;

        if service.is_cancelled() {
            return Ok(None);
        }

        let expires_at = service.expires_at + service.billing_cycle_duration();
        self.db
            .update_service_expiry(&mut *conn, service_id, expires_at)
            .await?;
        info!(service_id = service_id, expires_at = %expires_at, "Service expiry extended");

        if service.status() == Some(ServiceStatus::Unpaid) {
            self.db
                .update_service_status(&mut *conn, service_id, ServiceStatus::Pending)
                .await?;
            info!(service_id = service_id, "Service pending");
        }

        Ok(Some(service.extension))
    }

    async fn request_create(&self, service_id: i32, extension: &str) {
        let offered = match self.dispatcher.extensions().get(extension) {
            Ok(ext) => ext.admin_actions(service_id).await,
            Err(e) => {
                error!(service_id = service_id, error = %e, "Invalid extension on service");
                return;
            }
        };

        match offered {
            Ok(actions) if actions.iter().any(|a| a == "create") => {
                if let Err(e) = self
                    .dispatcher
                    .do_action_async(extension, service_id, "create", Some(ServiceStatus::Active))
                    .await
                {
                    error!(service_id = service_id, error = %e, "Failed to dispatch create action");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(service_id = service_id, extension = extension, error = %e, "Failed to list admin actions");
            }
        }
    }

    /// Start a gateway payment for an invoice the user owns. Returns the
    /// gateway's redirect URL.
    #[instrument(skip(self))]
    pub async fn pay_invoice(
        &self,
        invoice_id: i32,
        user_id: i32,
        gateway_name: &str,
    ) -> Result<String, BillingError> {
        let (gateway, fee) = self.gateways.payable(gateway_name)?;

        let invoice = self.get_invoice(invoice_id).await?;
        if invoice.user_id != user_id {
            return Err(BillingError::Forbidden);
        }
        if !invoice.is_unpaid() || invoice.is_overdue_at(Utc::now()) {
            return Err(BillingError::InvoiceNotPayable(invoice_id));
        }

        let total = fee.total(invoice.amount);
        let url = gateway.pay(&invoice, user_id, total).await?;

        info!(
            invoice_id = invoice_id,
            user_id = user_id,
            gateway = gateway_name,
            total = %total,
            "Payment started"
        );

        Ok(url)
    }

    pub async fn get_invoice(&self, invoice_id: i32) -> Result<Invoice, BillingError> {
        self.db
            .find_invoice(self.db.pool(), invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    pub async fn list_invoice_items(&self, invoice_id: i32) -> Result<Vec<InvoiceItem>, BillingError> {
        self.db.list_invoice_items(self.db.pool(), invoice_id).await
    }

    pub async fn list_invoice_payments(
        &self,
        invoice_id: i32,
    ) -> Result<Vec<Payment>, BillingError> {
        self.db.list_invoice_payments(self.db.pool(), invoice_id).await
    }
}
