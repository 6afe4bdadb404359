use axum::Router;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use creditgate::config::GatewayConfig;
use creditgate::entitlement::{EntitlementCache, HttpSourceOfTruth, SourceOfTruth};
use creditgate::http::{gateway_router, proxy_handler, GatewayState, HttpServer, UpstreamProxy};
use creditgate::ledger::{CreditLedger, RouteCostTable};
use creditgate::ratelimit::AdmissionController;
use creditgate::sync::BatchSyncManager;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Credit-metered API gateway.
#[derive(Debug, Parser)]
#[command(name = "creditgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Creditgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(args.config.as_deref())?;
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let source: Arc<dyn SourceOfTruth> = Arc::new(HttpSourceOfTruth::new(&config.billing)?);
    let cache = Arc::new(EntitlementCache::new(source.clone(), &config.entitlements));

    // Serve known tokens from the first request on
    match cache.force_refresh().await {
        Ok(tokens) => info!(tokens, "Entitlement cache primed"),
        Err(e) => warn!(error = %e, "Initial entitlement load failed, starting with an empty cache"),
    }

    let usage = BatchSyncManager::new(
        source,
        cache.clone(),
        &config.sync,
        config.billing.request_timeout(),
    );
    let admission = Arc::new(AdmissionController::new(cache.clone(), &config.rate_limiting));
    let ledger = Arc::new(CreditLedger::new(
        cache.clone(),
        RouteCostTable::new(&config.costs),
        usage.clone(),
    ));

    let periodic = config
        .sync
        .periodic_interval_secs
        .map(|secs| usage.spawn_periodic(Duration::from_secs(secs)));
    let pruner = spawn_pruner(
        admission.clone(),
        Duration::from_secs(config.rate_limiting.prune_interval_secs),
    );

    let state = GatewayState {
        admission,
        ledger,
        cache,
        usage: usage.clone(),
        trust_forwarded_for: config.server.trust_forwarded_for,
    };

    let app = match UpstreamProxy::from_config(&config.server)? {
        Some(proxy) => Router::new()
            .fallback(proxy_handler)
            .with_state(Arc::new(proxy)),
        None => {
            warn!("No upstream configured, only gateway routes are served");
            Router::new()
        }
    };

    let server = HttpServer::new(config.server.http_addr, gateway_router(app, state));
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(periodic) = periodic {
        periodic.abort();
    }
    pruner.abort();

    info!(pending = ?usage.stats(), "Flushing pending usage");
    usage.drain().await;

    info!("Creditgate stopped");
    Ok(())
}

/// Periodically drop rate limit windows that have aged out.
fn spawn_pruner(admission: Arc<AdmissionController>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            admission.prune_expired();
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
