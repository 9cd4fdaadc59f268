//! Database service for billing-service.
//!
//! Query methods take an explicit executor so the same statement can run on the pool
//! or inside a caller's transaction.

use crate::models::{
    CreateInvoice, CreateInvoiceItem, CreatePayment, CreateService, Invoice, InvoiceItem,
    InvoiceItemType, InvoiceStatus, Payment, Service, ServiceStatus,
};
use crate::services::error::BillingError;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgExecutor;
use std::time::Duration;
use tracing::{info, instrument};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Service Operations
    // =========================================================================

    /// Insert a service at purchase time.
    #[instrument(skip(self, executor, input), fields(user_id = input.user_id))]
    pub async fn create_service<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        input: &CreateService,
    ) -> Result<Service, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_service"])
            .start_timer();

        let service = sqlx::query_as::<_, Service>(
            r#"
            INSERT INTO services (label, user_id, status, billing_cycle, price, expires_at, extension, settings)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, label, user_id, status, billing_cycle, price, expires_at, cancellation_reason, cancelled_at, extension, settings, created_at
            "#,
        )
        .bind(&input.label)
        .bind(input.user_id)
        .bind(input.status.as_str())
        .bind(input.billing_cycle)
        .bind(input.price)
        .bind(input.expires_at)
        .bind(&input.extension)
        .bind(Json(&input.settings))
        .fetch_one(executor)
        .await?;

        timer.observe_duration();
        info!(service_id = service.id, label = %service.label, "Service created");

        Ok(service)
    }

    /// Get a service by ID.
    #[instrument(skip(self, executor))]
    pub async fn find_service<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
    ) -> Result<Option<Service>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_service"])
            .start_timer();

        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT id, label, user_id, status, billing_cycle, price, expires_at, cancellation_reason, cancelled_at, extension, settings, created_at
            FROM services
            WHERE id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(executor)
        .await?;

        timer.observe_duration();

        Ok(service)
    }

    /// Get a service by ID and lock its row until the transaction ends.
    #[instrument(skip(self, executor))]
    pub async fn find_service_for_update<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
    ) -> Result<Option<Service>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_service_for_update"])
            .start_timer();

        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT id, label, user_id, status, billing_cycle, price, expires_at, cancellation_reason, cancelled_at, extension, settings, created_at
            FROM services
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(service_id)
        .fetch_optional(executor)
        .await?;

        timer.observe_duration();

        Ok(service)
    }

    /// Set the status column of a service. A CANCELLED service is never moved,
    /// so this returns false for it as well as for a missing row.
    #[instrument(skip(self, executor), fields(status = %status))]
    pub async fn update_service_status<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
        status: ServiceStatus,
    ) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_service_status"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE services SET status = $2 WHERE id = $1 AND status <> 'CANCELLED'",
        )
            .bind(service_id)
            .bind(status.as_str())
            .execute(executor)
            .await?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, executor))]
    pub async fn update_service_expiry<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_service_expiry"])
            .start_timer();

        sqlx::query("UPDATE services SET expires_at = $2 WHERE id = $1")
            .bind(service_id)
            .bind(expires_at)
            .execute(executor)
            .await?;

        timer.observe_duration();

        Ok(())
    }

    /// Mark a service CANCELLED with a reason and timestamp.
    #[instrument(skip(self, executor))]
    pub async fn update_service_cancelled<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
        reason: Option<&str>,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_service_cancelled"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE services
            SET status = $2, cancellation_reason = $3, cancelled_at = $4
            WHERE id = $1
            "#,
        )
        .bind(service_id)
        .bind(ServiceStatus::Cancelled.as_str())
        .bind(reason)
        .bind(cancelled_at)
        .execute(executor)
        .await?;

        timer.observe_duration();
        info!(service_id = service_id, reason = ?reason, "Service cancelled");

        Ok(())
    }

    /// Record why and when a service was cancelled without touching its status,
    /// which the terminate action sets once the backend has finished.
    #[instrument(skip(self, executor))]
    pub async fn record_service_cancellation<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
        reason: Option<&str>,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_service_cancellation"])
            .start_timer();

        sqlx::query(
            "UPDATE services SET cancellation_reason = $2, cancelled_at = $3 WHERE id = $1",
        )
        .bind(service_id)
        .bind(reason)
        .bind(cancelled_at)
        .execute(executor)
        .await?;

        timer.observe_duration();

        Ok(())
    }

    /// Services past their expiry that are not yet cancelled.
    #[instrument(skip(self, executor))]
    pub async fn find_overdue_services<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        now: DateTime<Utc>,
    ) -> Result<Vec<Service>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_overdue_services"])
            .start_timer();

        let services = sqlx::query_as::<_, Service>(
            r#"
            SELECT id, label, user_id, status, billing_cycle, price, expires_at, cancellation_reason, cancelled_at, extension, settings, created_at
            FROM services
            WHERE expires_at < $1 AND status <> $2
            ORDER BY id
            "#,
        )
        .bind(now)
        .bind(ServiceStatus::Cancelled.as_str())
        .fetch_all(executor)
        .await?;

        timer.observe_duration();

        Ok(services)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Count UNPAID invoices that carry a service item for `service_id`.
    #[instrument(skip(self, executor))]
    pub async fn count_unpaid_invoices_for_service<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        service_id: i32,
    ) -> Result<i64, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_unpaid_invoices_for_service"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT i.id)
            FROM invoices i
            JOIN invoice_items it ON it.invoice_id = i.id
            WHERE i.status = $1 AND it.item_type = $2 AND it.item_id = $3
            "#,
        )
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(InvoiceItemType::Service.as_str())
        .bind(service_id)
        .fetch_one(executor)
        .await?;

        timer.observe_duration();

        Ok(count)
    }

    #[instrument(skip(self, executor, input), fields(user_id = input.user_id, amount = %input.amount))]
    pub async fn create_invoice<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        input: &CreateInvoice,
    ) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (user_id, status, amount, due_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, status, amount, due_at, paid_at, cancellation_reason, created_at
            "#,
        )
        .bind(input.user_id)
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(input.amount)
        .bind(input.due_at)
        .fetch_one(executor)
        .await?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self, executor, input), fields(invoice_id = input.invoice_id))]
    pub async fn create_invoice_item<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        input: &CreateInvoiceItem,
    ) -> Result<InvoiceItem, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice_item"])
            .start_timer();

        let item = sqlx::query_as::<_, InvoiceItem>(
            r#"
            INSERT INTO invoice_items (invoice_id, description, amount, item_type, item_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, invoice_id, description, amount, item_type, item_id
            "#,
        )
        .bind(input.invoice_id)
        .bind(&input.description)
        .bind(input.amount)
        .bind(input.item_type.as_str())
        .bind(input.item_id)
        .fetch_one(executor)
        .await?;

        timer.observe_duration();

        Ok(item)
    }

    #[instrument(skip(self, executor))]
    pub async fn find_invoice<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, status, amount, due_at, paid_at, cancellation_reason, created_at
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(executor)
        .await?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Get an invoice by ID and lock its row until the transaction ends.
    #[instrument(skip(self, executor))]
    pub async fn find_invoice_for_update<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_for_update"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, status, amount, due_at, paid_at, cancellation_reason, created_at
            FROM invoices
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(executor)
        .await?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self, executor))]
    pub async fn list_invoice_items<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
    ) -> Result<Vec<InvoiceItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT id, invoice_id, description, amount, item_type, item_id
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(executor)
        .await?;

        timer.observe_duration();

        Ok(items)
    }

    /// Move an UNPAID invoice to PAID. Returns false if the invoice was not UNPAID.
    #[instrument(skip(self, executor))]
    pub async fn update_invoice_paid<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
        paid_at: DateTime<Utc>,
    ) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_paid"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE invoices SET status = $2, paid_at = $3 WHERE id = $1 AND status = $4",
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Paid.as_str())
        .bind(paid_at)
        .bind(InvoiceStatus::Unpaid.as_str())
        .execute(executor)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    /// Move an UNPAID invoice to CANCELLED. Returns false if the invoice was not UNPAID.
    #[instrument(skip(self, executor))]
    pub async fn update_invoice_cancelled<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
        reason: &str,
    ) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_cancelled"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, cancellation_reason = $3
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Cancelled.as_str())
        .bind(reason)
        .bind(InvoiceStatus::Unpaid.as_str())
        .execute(executor)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    /// UNPAID invoices whose due date has passed.
    #[instrument(skip(self, executor))]
    pub async fn find_overdue_invoices<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_overdue_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, user_id, status, amount, due_at, paid_at, cancellation_reason, created_at
            FROM invoices
            WHERE status = $1 AND due_at < $2
            ORDER BY id
            "#,
        )
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(now)
        .fetch_all(executor)
        .await?;

        timer.observe_duration();

        Ok(invoices)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    #[instrument(skip(self, executor, input), fields(invoice_id = input.invoice_id, amount = %input.amount, gateway = %input.gateway))]
    pub async fn add_invoice_payment<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        input: &CreatePayment,
    ) -> Result<Payment, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_invoice_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO invoice_payments (invoice_id, description, amount, reference_id, gateway)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, invoice_id, description, amount, reference_id, gateway, created_at
            "#,
        )
        .bind(input.invoice_id)
        .bind(&input.description)
        .bind(input.amount)
        .bind(&input.reference_id)
        .bind(&input.gateway)
        .fetch_one(executor)
        .await?;

        timer.observe_duration();

        Ok(payment)
    }

    /// Sum of all payments recorded against an invoice.
    #[instrument(skip(self, executor))]
    pub async fn total_invoice_payment<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
    ) -> Result<Decimal, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["total_invoice_payment"])
            .start_timer();

        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM invoice_payments WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_one(executor)
        .await?;

        timer.observe_duration();

        Ok(total)
    }

    #[instrument(skip(self, executor))]
    pub async fn list_invoice_payments<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        invoice_id: i32,
    ) -> Result<Vec<Payment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, invoice_id, description, amount, reference_id, gateway, created_at
            FROM invoice_payments
            WHERE invoice_id = $1
            ORDER BY id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(executor)
        .await?;

        timer.observe_duration();

        Ok(payments)
    }
}
