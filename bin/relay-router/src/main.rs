//! Relay Message Router
//!
//! Consumes inbound message pointers from external queues, deduplicates them,
//! routes each to a named processing pool, and dispatches to an HTTP mediation
//! target while preserving per-group FIFO order.
//!
//! ## Configuration
//!
//! Reads `relay.toml` (or `RELAY_*` environment overrides, see `relay-config`)
//! for queues, pools, mediator timeouts, and circuit breaker thresholds.
//! Set `messageRouter.enabled = false` to run the binary without starting the
//! consumer/pool pipeline (useful when only the outbox processor should run
//! on a given host).

use std::sync::Arc;
use std::net::SocketAddr;
use anyhow::Result;
use tracing::{info, warn, error};
use tokio::signal;

use relay_config::AppConfig;
use relay_router::{
    QueueManager, HttpMediator, HttpMediatorConfig, HttpVersion,
    LifecycleManager, LifecycleConfig,
    WarningService, WarningServiceConfig,
    HealthService, HealthServiceConfig,
    QueueHealthMonitor, QueueHealthConfig, spawn_queue_health_monitor,
};
use relay_common::{RouterConfig, PoolConfig as RouterPoolConfig, QueueConfig as RouterQueueConfig};
use relay_queue::sqs::SqsQueueConsumer;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    relay_common::logging::init_logging("relay-router");
    let metrics_handle = relay_common::metrics::install();

    info!("Starting Relay Message Router");

    let config = AppConfig::load()?;

    if !config.message_router.enabled {
        info!("messageRouter.enabled = false; router will not start its pipeline");
        health_only_server(metrics_handle).await?;
        return Ok(());
    }

    if config.queues.is_empty() {
        return Err(anyhow::anyhow!("no queues configured under [[queues]]"));
    }

    // 1. Warning and health services
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    // 2. Mediator built from [mediator] section
    let mediator_config = HttpMediatorConfig {
        timeout: std::time::Duration::from_millis(config.mediator.request_timeout_ms),
        connect_timeout: std::time::Duration::from_millis(config.mediator.connect_timeout_ms),
        circuit_breaker_threshold: config.mediator.circuit_breaker.threshold,
        circuit_breaker_timeout: std::time::Duration::from_millis(config.mediator.circuit_breaker.cooldown_ms),
        http_version: HttpVersion::Http2,
        ..HttpMediatorConfig::default()
    };
    let mediator = Arc::new(HttpMediator::with_config(mediator_config));

    // 3. QueueManager with pool warning service wired in
    let mut queue_manager = QueueManager::new(mediator.clone());
    queue_manager.set_warning_service(warning_service.clone());
    queue_manager.set_health_service(health_service.clone());
    let queue_manager = Arc::new(queue_manager);

    let router_config = to_router_config(&config);
    queue_manager.apply_config(router_config.clone()).await?;

    // 4. Consumers per configured queue
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);

    for queue in &config.queues {
        match queue.queue_type.as_str() {
            "sqs" => {
                let visibility_timeout = queue.visibility_timeout_sec.unwrap_or(120) as i32;
                info!(queue_uri = %queue.queue_uri, visibility_timeout, "Starting SQS consumer");
                let consumer = Arc::new(SqsQueueConsumer::from_queue_url(
                    sqs_client.clone(),
                    queue.queue_uri.clone(),
                    visibility_timeout,
                ).await);
                queue_manager.add_consumer(consumer).await;
            }
            other => {
                return Err(anyhow::anyhow!(
                    "unsupported queueType '{}' for queue {} (expected 'sqs')",
                    other,
                    queue.queue_uri
                ));
            }
        }
    }

    // 5. Lifecycle background tasks (visibility extension, health checks, cleanup)
    let lifecycle = LifecycleManager::start(
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
    );

    // Queue backlog/growth warnings
    let (queue_health_shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let queue_health_monitor = Arc::new(QueueHealthMonitor::new(
        QueueHealthConfig::default(),
        warning_service.clone(),
    ));
    let queue_health_handle = spawn_queue_health_monitor(
        queue_health_monitor,
        queue_manager.clone(),
        queue_health_shutdown_tx.clone(),
    );

    // 6. Minimal health/ready HTTP surface
    let metrics_port: u16 = std::env::var("RELAY_ROUTER_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let health_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let health_app = build_health_router(queue_manager.clone(), health_service.clone(), metrics_handle);
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!(port = metrics_port, "Health/ready server listening");
    let health_server = tokio::spawn(async move {
        axum::serve(health_listener, health_app).await.ok();
    });

    // 7. Run the manager loop
    let manager_for_loop = queue_manager.clone();
    let manager_handle = tokio::spawn(async move {
        if let Err(e) = manager_for_loop.start().await {
            error!(error = %e, "QueueManager exited with error");
        }
    });

    info!("Relay Message Router started. Press Ctrl+C to shutdown.");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    lifecycle.shutdown().await;
    let _ = queue_health_shutdown_tx.send(());
    queue_health_handle.abort();
    queue_manager.shutdown().await;
    health_server.abort();

    match tokio::time::timeout(std::time::Duration::from_secs(30), manager_handle).await {
        Ok(_) => info!("Manager task completed gracefully"),
        Err(_) => warn!("Manager task did not complete within 30s timeout"),
    }

    info!("Relay Message Router shutdown complete");
    Ok(())
}

fn to_router_config(config: &AppConfig) -> RouterConfig {
    RouterConfig {
        processing_pools: config.pools.iter().map(|p| RouterPoolConfig {
            code: p.code.clone(),
            concurrency: p.concurrency,
            rate_limit_per_minute: p.rate_limit_per_minute,
            buffer_size: p.buffer_size,
        }).collect(),
        queues: config.queues.iter().map(|q| RouterQueueConfig {
            name: q.queue_uri.clone(),
            uri: q.queue_uri.clone(),
            connections: 1,
            visibility_timeout: q.visibility_timeout_sec.unwrap_or(120),
        }).collect(),
    }
}

fn build_health_router(
    queue_manager: Arc<QueueManager>,
    health_service: Arc<HealthService>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> axum::Router {
    use axum::{routing::get, Json, extract::State, Router};

    #[derive(Clone)]
    struct AppState {
        queue_manager: Arc<QueueManager>,
        health_service: Arc<HealthService>,
        metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    }

    async fn health_handler() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "status": "UP", "version": env!("CARGO_PKG_VERSION") }))
    }

    async fn ready_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
        let stats = state.queue_manager.get_pool_stats();
        let report = state.health_service.get_health_report(&stats);
        Json(serde_json::json!({ "status": format!("{:?}", report.status), "issues": report.issues }))
    }

    async fn metrics_handler(State(state): State<AppState>) -> String {
        state.metrics_handle.render()
    }

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { queue_manager, health_service, metrics_handle })
}

/// Serve just the health endpoint when messageRouter is disabled on this host.
async fn health_only_server(metrics_handle: metrics_exporter_prometheus::PrometheusHandle) -> Result<()> {
    let port: u16 = std::env::var("RELAY_ROUTER_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async {
            axum::Json(serde_json::json!({ "status": "UP", "messageRouter": "disabled" }))
        }))
        .route("/metrics", axum::routing::get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "Health-only server listening (messageRouter disabled)");

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
