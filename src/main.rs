//! Density Scanner
//!
//! Connects the configured venue feeds, runs the analytics pipeline and
//! serves health, metrics and feed status over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use density_scanner::feed::default_adapter;
use density_scanner::{
    AlertPublisher, AppState, Config, ConfigResolver, DetectionSettings, FeedSupervisor, Pipeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting density scanner");

    let config = Arc::new(Config::load()?);
    info!(
        feeds = ?config.feeds,
        symbols = config.symbols.len(),
        "Configuration loaded"
    );

    let detection = Arc::new(DetectionSettings::load(config.detection_config_path.as_deref())?);
    let resolver: Arc<dyn ConfigResolver> = detection;

    let pipeline = Arc::new(Pipeline::new(config.pipeline_settings(), resolver.clone()));
    pipeline.start();

    if let Some(path) = &config.ipc_socket_path {
        let publisher = AlertPublisher::new(path).await;
        tokio::spawn(publisher.run(pipeline.subscribe_alerts()));
    } else {
        info!("No IPC socket configured, alerts are only logged");
    }

    let supervisor = Arc::new(FeedSupervisor::from_config(
        &config,
        resolver.as_ref(),
        pipeline.feed_sink(),
        pipeline.volume().clone(),
        default_adapter,
    )?);
    if supervisor.connections().is_empty() {
        warn!("No enabled feeds configured");
    }
    supervisor.start(config.status_interval());

    let state = Arc::new(AppState {
        pipeline: pipeline.clone(),
        supervisor: supervisor.clone(),
        config: config.clone(),
    });

    let server = tokio::spawn(async move {
        if let Err(e) = start_health_server(state).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    supervisor.shutdown(config.shutdown_grace()).await;
    pipeline.shutdown();
    server.abort();

    info!("Density scanner stopped");
    Ok(())
}

/// Start HTTP server for health checks, metrics and feed status
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let connected = state.supervisor.connected_count();
    Json(serde_json::json!({
        "status": if connected > 0 { "healthy" } else { "degraded" },
        "component": "density-scanner",
        "connected_feeds": connected,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let supervisor = &state.supervisor;
    let pipeline = &state.pipeline;
    Json(serde_json::json!({
        "connections": supervisor.statuses(),
        "connected": supervisor.connected_count(),
        "feeds": supervisor.connections().len(),
        "subscribed_symbols": supervisor.total_subscribed(),
        "books": pipeline.store().book_count(),
        "tracked_densities": pipeline.density_count(),
        "volume_instruments": pipeline.volume().tracked_count(),
        "active_cooldowns": pipeline.detector().cooldown_count(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> Result<String, StatusCode> {
    use prometheus::{Encoder, TextEncoder};

    // Touch the registry so every metric is exported even before first use
    density_scanner::telemetry::metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
