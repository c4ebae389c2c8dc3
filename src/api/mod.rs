//! HTTP API: read access for dashboards and the execution layer, plus the
//! administrative overrides.
//!
//! All endpoints speak JSON. CORS is open for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::AppState;

/// Bind the API port and serve in a background task until `shutdown` flips.
pub async fn spawn_api(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    tokio::spawn(async move {
        let graceful = async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
            error!(error = %e, "API server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/champion", get(routes::get_champion))
        .route("/api/recommendations", get(routes::get_recommendations))
        .route("/api/adjustments", get(routes::get_adjustments))
        .route("/api/snapshots", get(routes::get_snapshots))
        .route("/api/control", get(routes::get_control))
        .route("/api/admin/force-apply/:id", post(routes::force_apply))
        .route("/api/admin/rollback/:id", post(routes::rollback))
        .route("/api/admin/emergency-stop", post(routes::emergency_stop))
        .route("/api/admin/resume", post(routes::resume))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
