//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::gateways::GatewayRegistry;
use crate::provisioning::{Dispatcher, ExtensionRegistry, NoneExtension, ServiceActions};
use crate::services::{get_metrics, init_metrics, Broker, Database, Ledger, RedisBroker};
use crate::workers::{OverdueSweeper, QueueSupervisor};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Database,
    pub broker: Arc<dyn Broker>,
    pub dispatcher: Dispatcher,
    pub ledger: Ledger,
    pub actions: ServiceActions,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Database,
    broker: Arc<dyn Broker>,
}

impl HealthState {
    async fn check(&self) -> Result<(), String> {
        self.db.health_check().await.map_err(|e| e.to_string())?;
        self.broker.health_check().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(()) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-service",
                    "error": e
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server and background worker lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    supervisor: QueueSupervisor,
}

impl Application {
    /// Build the application with the built-in `None` extension and no gateways.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        let extensions = ExtensionRegistry::new().with(Arc::new(NoneExtension));
        Self::build_with(config, extensions, GatewayRegistry::new(), true).await
    }

    /// Build the application with caller-provided extensions and gateways.
    pub async fn build_with(
        config: BillingConfig,
        extensions: ExtensionRegistry,
        gateways: GatewayRegistry,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(&config.redis.url).await?);

        extensions.init_all().await?;

        let dispatcher = Dispatcher::new(
            Arc::clone(&broker),
            Arc::new(extensions),
            config.dispatch_settings(),
        );
        let ledger = Ledger::new(
            db.clone(),
            dispatcher.clone(),
            Arc::new(gateways),
            config.ledger_settings(),
        );
        let actions = ServiceActions::new(db.clone(), dispatcher.clone());

        let state = AppState {
            config: config.clone(),
            db,
            broker,
            dispatcher,
            ledger,
            actions,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Billing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            supervisor: QueueSupervisor::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Start one worker pool per extension queue plus the overdue sweeper.
    async fn start_workers(&self) {
        let config = &self.state.config;
        let dispatcher = &self.state.dispatcher;
        let store = Arc::new(self.state.db.clone());

        for name in dispatcher.extensions().names() {
            let extension = match dispatcher.extensions().get(&name) {
                Ok(extension) => extension,
                Err(e) => {
                    tracing::error!(extension = %name, error = %e, "Extension vanished from registry");
                    continue;
                }
            };
            let handler = Arc::new(dispatcher.handler(extension, store.clone()));
            self.supervisor
                .spawn_queue(
                    &dispatcher.queue(&name),
                    config.queue.workers,
                    handler,
                    config.poll_timeout(),
                )
                .await;
        }

        let sweeper = OverdueSweeper::new(
            self.state.db.clone(),
            dispatcher.clone(),
            config.sweep_settings(),
        );
        let token = self.supervisor.token();
        self.supervisor
            .track(tokio::spawn(sweeper.run(token)))
            .await;
    }

    /// Run the HTTP server and background workers until `shutdown` resolves,
    /// then wait for the workers to stop.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start_workers().await;

        let health_state = HealthState {
            db: self.state.db.clone(),
            broker: Arc::clone(&self.state.broker),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(shutdown)
            .await;

        self.supervisor.shutdown().await;

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }

        Ok(())
    }
}
