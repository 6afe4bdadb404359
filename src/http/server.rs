//! HTTP server implementation.

use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{gateway_middleware, GatewayState};
use crate::error::{GatewayError, Result};
use crate::sync::SyncState;

/// Path of the gateway's own health route. Never gated or charged.
pub const HEALTH_PATH: &str = "/_gateway/health";

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    cached_tokens: usize,
    last_refresh_at: Option<DateTime<Utc>>,
    sync_state: SyncState,
    pending_tokens: usize,
}

async fn health(State(state): State<GatewayState>) -> Json<HealthReport> {
    let sync = state.usage.stats();
    Json(HealthReport {
        status: "ok",
        cached_tokens: state.cache.len(),
        last_refresh_at: state.cache.last_refresh_at(),
        sync_state: sync.state,
        pending_tokens: sync.pending_tokens,
    })
}

/// Wrap `app` in the gateway stage and add the ungated health route.
pub fn gateway_router(app: Router, state: GatewayState) -> Router {
    let gated = app.layer(from_fn_with_state(state.clone(), gateway_middleware));
    let internal = Router::new().route(HEALTH_PATH, get(health)).with_state(state);
    gated.merge(internal)
}

/// HTTP server for the gateway.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Fully assembled router
    router: Router,
}

impl HttpServer {
    /// Create a new server for an assembled router.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatewayError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP gateway with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatewayError::Io(e)
        })
    }
}
