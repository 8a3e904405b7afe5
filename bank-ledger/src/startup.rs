//! Process bootstrap: pool, transfer engine and the ops listener.

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::services::{get_metrics, init_metrics, Database, TransferEngine};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct OpsState {
    db: Database,
}

fn pool_snapshot(db: &Database) -> serde_json::Value {
    let pool = db.pool();
    json!({
        "size": pool.size(),
        "idle": pool.num_idle(),
    })
}

/// `/health`: process is up and PostgreSQL answers `SELECT 1`.
async fn liveness(State(ops): State<OpsState>) -> impl IntoResponse {
    match ops.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "bank-ledger",
                "version": env!("CARGO_PKG_VERSION"),
                "pool": pool_snapshot(&ops.db),
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Ledger store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "bank-ledger",
                    "error": e.to_string(),
                    "pool": pool_snapshot(&ops.db),
                })),
            )
        }
    }
}

/// `/ready`: transfers can open a unit of work.
async fn readiness(State(ops): State<OpsState>) -> StatusCode {
    if let Err(e) = ops.db.health_check().await {
        tracing::warn!(error = %e, "Not ready: ledger store unreachable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        get_metrics(),
    )
}

/// Application container: connection pool, transfer engine and the ops listener.
pub struct Application {
    port: u16,
    listener: TcpListener,
    db: Database,
    engine: TransferEngine<Database>,
}

impl Application {
    /// Connect the pool and bind the ops listener.
    pub async fn build(config: LedgerConfig) -> Result<Self, LedgerError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            config.database.acquire_timeout(),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        let engine = TransferEngine::new(db.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            LedgerError::ConfigError(anyhow::anyhow!("Failed to bind {}: {}", addr, e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                LedgerError::ConfigError(anyhow::anyhow!("Listener has no address: {}", e))
            })?
            .port();

        tracing::info!(port = port, "Bank ledger listener bound");

        Ok(Self {
            port,
            listener,
            db,
            engine,
        })
    }

    /// Get the port the ops listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transfer engine for in-process callers.
    pub fn engine(&self) -> &TransferEngine<Database> {
        &self.engine
    }

    /// Serve `/health`, `/ready` and `/metrics` until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(liveness))
            .route("/ready", get(readiness))
            .route("/metrics", get(prometheus_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(OpsState { db: self.db });

        tracing::info!(
            service = "bank-ledger",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Serving ops endpoints"
        );

        axum::serve(self.listener, router).await
    }
}
