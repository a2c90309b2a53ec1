//! Application startup and lifecycle management.

use crate::config::AllocationConfig;
use crate::services::{
    get_metrics, init_metrics, AllocationEngine, Database, DriftScheduler, DriftThresholds,
    FeatureFlagManager, FlagStore, ReconciliationService,
};
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
    pub config: AllocationConfig,
    pub db: Arc<Database>,
    pub flags: Arc<FeatureFlagManager>,
    pub engine: AllocationEngine<Database>,
    pub reconciliation: Arc<ReconciliationService<Database>>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness checks.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "allocation-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "allocation-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness checks.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
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

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    scheduler: DriftScheduler<Database>,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AllocationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: AllocationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: AllocationConfig, run_migrations: bool) -> Result<Self, AppError> {
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

        let db = Arc::new(db);

        let flag_store: Arc<dyn FlagStore> = db.clone();
        let flags = Arc::new(FeatureFlagManager::new(Some(flag_store)));
        let loaded = flags.hydrate().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to load feature flags");
            e
        })?;
        tracing::info!(loaded = loaded, "Feature flags hydrated");

        let thresholds =
            DriftThresholds::new(config.drift.warn_threshold, config.drift.fail_threshold)?;
        let engine = AllocationEngine::new(db.clone(), flags.clone());
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            flags.clone(),
            thresholds,
        ));
        let scheduler = DriftScheduler::new(reconciliation.clone(), config.drift.interval());

        let state = AppState {
            config: config.clone(),
            db,
            flags,
            engine,
            reconciliation,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Allocation service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            scheduler,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn scheduler(&self) -> &DriftScheduler<Database> {
        &self.scheduler
    }

    /// Serve until `shutdown` resolves, then stop the drift scheduler and wait for any
    /// in-progress run to finish.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        let scheduler_handle = if self.state.config.drift.scheduler_enabled {
            Some(self.scheduler.start())
        } else {
            tracing::info!("Drift scheduler disabled by configuration");
            None
        };

        tracing::info!(
            service = "allocation-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(shutdown)
            .await;

        self.scheduler.stop();
        if let Some(handle) = scheduler_handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Drift scheduler task ended abnormally");
            }
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
