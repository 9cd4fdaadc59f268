//! Common test utilities for billing-service integration tests.

use async_trait::async_trait;
use billing_service::gateways::{Gateway, GatewayFee, GatewayRegistry};
use billing_service::models::{CreateService, Invoice, Service, ServiceStatus, Task};
use billing_service::provisioning::{
    DispatchSettings, Dispatcher, Extension, ExtensionRegistry, SettingField,
};
use billing_service::services::{Broker, Database, Ledger, LedgerSettings, MemoryBroker};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};

static INIT: Once = Once::new();

pub const EXTENSION: &str = "Recording";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,billing_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Extension that records every action it is asked to run.
#[derive(Default)]
pub struct RecordingExtension {
    pub calls: Mutex<Vec<(i32, String)>>,
}

#[allow(dead_code)]
impl RecordingExtension {
    pub fn calls_for(&self, service_id: i32) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == service_id)
            .map(|(_, action)| action.clone())
            .collect()
    }
}

#[async_trait]
impl Extension for RecordingExtension {
    fn name(&self) -> &str {
        EXTENSION
    }

    async fn product_settings(
        &self,
        _inputs: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<SettingField>> {
        Ok(vec![SettingField::text("node", "Node")])
    }

    async fn server_settings(&self) -> anyhow::Result<Vec<SettingField>> {
        Ok(Vec::new())
    }

    async fn action(&self, service_id: i32, action: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((service_id, action.to_string()));
        Ok(())
    }

    async fn client_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
        Ok(vec!["reboot".to_string()])
    }

    async fn admin_actions(&self, _service_id: i32) -> anyhow::Result<Vec<String>> {
        Ok(vec![
            "create".to_string(),
            "suspend".to_string(),
            "terminate".to_string(),
        ])
    }
}

pub struct TestGateway;

#[async_trait]
impl Gateway for TestGateway {
    fn name(&self) -> &str {
        "test"
    }

    fn settings(&self) -> Vec<SettingField> {
        Vec::new()
    }

    async fn pay(
        &self,
        invoice: &Invoice,
        _user_id: i32,
        total: Decimal,
    ) -> anyhow::Result<String> {
        Ok(format!(
            "https://pay.example/invoice/{}?total={}",
            invoice.id, total
        ))
    }
}

pub const OWNER: i32 = 42;

pub struct TestContext {
    pub db: Database,
    pub broker: Arc<MemoryBroker>,
    pub dispatcher: Dispatcher,
    pub ledger: Ledger,
    pub extension: Arc<RecordingExtension>,
}

/// Build a ledger over the test database and an in-memory broker.
/// Returns `None` when `TEST_DATABASE_URL` is not set.
pub async fn setup() -> Option<TestContext> {
    init_tracing();

    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let db = Database::new(&database_url, 5, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let broker = Arc::new(MemoryBroker::new());
    let extension = Arc::new(RecordingExtension::default());
    let extensions = ExtensionRegistry::new().with(extension.clone());
    let dispatcher = Dispatcher::new(
        broker.clone(),
        Arc::new(extensions),
        DispatchSettings::default(),
    );

    let mut gateways = GatewayRegistry::new();
    gateways.register(
        Arc::new(TestGateway),
        true,
        Some(GatewayFee::from_str("2.5%").unwrap()),
    );

    let ledger = Ledger::new(
        db.clone(),
        dispatcher.clone(),
        Arc::new(gateways),
        LedgerSettings::default(),
    );

    Some(TestContext {
        db,
        broker,
        dispatcher,
        ledger,
        extension,
    })
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[allow(dead_code)]
impl TestContext {
    pub async fn create_service(&self, status: ServiceStatus, price: &str) -> Service {
        self.create_service_expiring(status, price, Utc::now() + Duration::days(30))
            .await
    }

    pub async fn create_service_expiring(
        &self,
        status: ServiceStatus,
        price: &str,
        expires_at: DateTime<Utc>,
    ) -> Service {
        self.ledger
            .create_service(CreateService {
                label: "vps-small".to_string(),
                user_id: OWNER,
                status,
                billing_cycle: 30 * 24 * 3600,
                price: dec(price),
                expires_at,
                extension: EXTENSION.to_string(),
                settings: HashMap::new(),
            })
            .await
            .expect("Failed to create service")
    }

    pub async fn service(&self, service_id: i32) -> Service {
        self.db
            .find_service(self.db.pool(), service_id)
            .await
            .unwrap()
            .expect("service exists")
    }

    /// Move an invoice's due date into the past.
    pub async fn make_overdue(&self, invoice_id: i32) {
        sqlx::query("UPDATE invoices SET due_at = now() - interval '1 hour' WHERE id = $1")
            .bind(invoice_id)
            .execute(self.db.pool())
            .await
            .unwrap();
    }

    /// Queued action tasks for one service, newest first.
    pub fn queued_actions_for(&self, service_id: i32) -> Vec<Task> {
        self.broker
            .list_items(&self.dispatcher.queue(EXTENSION).list_key())
            .iter()
            .map(|raw| serde_json::from_str::<Task>(raw).unwrap())
            .filter(|task| task.args["service_id"] == service_id)
            .collect()
    }

    pub async fn lock_held(&self, service_id: i32) -> bool {
        self.broker
            .get(&format!("service_{}_action_lock", service_id))
            .await
            .unwrap()
            .is_some()
    }
}
