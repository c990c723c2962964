//! Relay Outbox Processor
//!
//! Leader-elected polling worker that drains per-database outbox tables,
//! groups items into FIFO-ordered, bounded-concurrency batches, and
//! delivers them to the Relay HTTP API (`/api/events/batch`,
//! `/api/dispatch/jobs/batch`).
//!
//! ## Configuration
//!
//! Reads `relay.toml` (or `RELAY_*` environment overrides, see
//! `relay-config`) for `[outbox]` and `[leader]` settings. The database
//! connection itself is environment-only (it is not part of the
//! configuration surface): `RELAY_OUTBOX_DB_TYPE` (`sqlite`, `postgres`,
//! `mongo`; default `postgres`), `RELAY_OUTBOX_DB_URL`, and for mongo,
//! `RELAY_OUTBOX_MONGO_DB`.

use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::Result;
use tracing::info;
use tokio::signal;

use relay_config::AppConfig;
use relay_outbox::repository::OutboxRepository;
use relay_outbox::{EnhancedOutboxProcessor, EnhancedProcessorConfig, LeaderElectionConfig as OutboxLeaderConfig};
use relay_outbox::http_dispatcher::HttpDispatcherConfig;
use relay_standby::{LeaderElection, LeaderElectionConfig as StandbyLeaderConfig};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::postgres::PgPoolOptions;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    relay_common::logging::init_logging("relay-outbox-processor");
    let metrics_handle = relay_common::metrics::install();

    info!("Starting Relay Outbox Processor");

    let config = AppConfig::load()?;

    if !config.outbox.enabled {
        info!("outbox.enabled = false; outbox processor will not start its pipeline");
        health_only_server(metrics_handle).await?;
        return Ok(());
    }

    let db_type = env_or("RELAY_OUTBOX_DB_TYPE", "postgres");
    let outbox_repo = create_outbox_repository(&db_type).await?;
    info!(db_type = %db_type, "Outbox repository initialized");

    let processor_config = EnhancedProcessorConfig {
        poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
        poll_batch_size: config.outbox.poll_batch_size,
        api_batch_size: config.outbox.api_batch_size as usize,
        max_concurrent_groups: config.outbox.max_concurrent_groups as usize,
        global_buffer_size: config.outbox.buffer_size,
        max_in_flight: config.outbox.buffer_size as u64,
        max_retries: config.outbox.max_retries,
        processing_timeout_seconds: config.outbox.recovery_timeout_sec,
        http_config: HttpDispatcherConfig {
            api_base_url: config.outbox.api_base_url.clone(),
            api_token: config.outbox.api_token.clone(),
            ..HttpDispatcherConfig::default()
        },
        leader_election: OutboxLeaderConfig {
            enabled: true,
            redis_url: config.leader.redis_url.clone(),
            lock_key: config.leader.lock_key.clone(),
            lock_ttl_seconds: config.leader.ttl_ms / 1000,
            heartbeat_interval_seconds: config.leader.refresh_interval_ms / 1000,
        },
        ..EnhancedProcessorConfig::default()
    };

    let processor = Arc::new(EnhancedOutboxProcessor::new(processor_config, outbox_repo)?);

    let leader_election = Arc::new(
        LeaderElection::new(StandbyLeaderConfig {
            redis_url: config.leader.redis_url.clone(),
            lock_key: config.leader.lock_key.clone(),
            lock_ttl_seconds: config.leader.ttl_ms / 1000,
            heartbeat_interval_seconds: config.leader.refresh_interval_ms / 1000,
            instance_id: config.leader.instance_id.clone(),
        })
        .await?,
    );
    leader_election.clone().start().await?;

    let processor_for_run = processor.clone();
    let leader_for_run = leader_election.clone();
    let processor_handle = tokio::spawn(async move {
        processor_for_run.start_with_standby(leader_for_run).await;
    });

    // Health/metrics HTTP surface
    let metrics_port: u16 = std::env::var("RELAY_OUTBOX_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let metrics_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(AppState { processor: processor.clone(), metrics_handle });
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(port = metrics_port, "Health/ready server listening");
    let metrics_server_handle = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app).await.ok();
    });

    info!("Relay Outbox Processor started. Press Ctrl+C to shutdown.");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    processor.stop();
    metrics_server_handle.abort();

    let _ = tokio::time::timeout(Duration::from_secs(30), processor_handle).await;

    info!("Relay Outbox Processor shutdown complete");
    Ok(())
}

async fn create_outbox_repository(db_type: &str) -> Result<Arc<dyn OutboxRepository>> {
    match db_type {
        "sqlite" => {
            let url = env_required("RELAY_OUTBOX_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let repo = relay_outbox::sqlite::SqliteOutboxRepository::new(pool);
            repo.init_schema().await?;
            info!("Using SQLite outbox: {}", url);
            Ok(Arc::new(repo))
        }
        "postgres" => {
            let url = env_required("RELAY_OUTBOX_DB_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let repo = relay_outbox::postgres::PostgresOutboxRepository::new(pool);
            repo.init_schema().await?;
            info!("Using PostgreSQL outbox");
            Ok(Arc::new(repo))
        }
        "mongo" => {
            let url = env_required("RELAY_OUTBOX_DB_URL")?;
            let db_name = env_or("RELAY_OUTBOX_MONGO_DB", "relay");
            let client = mongodb::Client::with_uri_str(&url).await?;
            let repo = relay_outbox::mongo::MongoOutboxRepository::new(client, &db_name);
            info!("Using MongoDB outbox: {} (collections: outbox_events, outbox_dispatch_jobs)", db_name);
            Ok(Arc::new(repo))
        }
        other => {
            Err(anyhow::anyhow!("Unknown database type: {}. Use sqlite, postgres, or mongo", other))
        }
    }
}

#[derive(Clone)]
struct AppState {
    processor: Arc<EnhancedOutboxProcessor>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    let metrics = state.processor.metrics().await;
    axum::Json(serde_json::json!({
        "status": "READY",
        "isLeader": state.processor.is_primary(),
        "bufferDepth": metrics.buffer_size,
        "inFlight": metrics.current_in_flight,
    }))
}

async fn metrics_handler(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    state.metrics_handle.render()
}

/// Serve just the health endpoint when outbox processing is disabled on this host.
async fn health_only_server(metrics_handle: metrics_exporter_prometheus::PrometheusHandle) -> Result<()> {
    let port: u16 = std::env::var("RELAY_OUTBOX_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async {
            axum::Json(serde_json::json!({ "status": "UP", "outbox": "disabled" }))
        }))
        .route("/metrics", axum::routing::get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "Health-only server listening (outbox disabled)");

    tokio::select! {
        res = axum::serve(listener, app) => { res?; }
        _ = shutdown_signal() => { info!("Shutdown signal received"); }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
