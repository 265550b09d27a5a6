//! chat-sync binary - Discord chat relay with etcd fleet coordination
//!
//! Wires the pieces together:
//! - Claims a shard id through the coordination store (self-healing, no
//!   central allocator)
//! - Opens a partitioned Discord gateway connection, serialized fleet-wide
//!   through the connection lock
//! - Mirrors chat in both directions over the platform bus
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use chat_sync::bus::ChatBus;
use chat_sync::config::SyncConfig;
use chat_sync::coordination::etcd::EtcdStore;
use chat_sync::coordination::{ConnectionLock, LockConfig, Sharding, ShardingConfig};
use chat_sync::health::{self, AppState};
use chat_sync::metrics::SyncMetrics;
use chat_sync::relay::matcher::StaticMatcher;
use chat_sync::relay::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = SyncConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("chat_sync={}", config.log_level).parse()?)
                .add_directive("twilight_gateway=info".parse()?)
                .add_directive("async_nats=warn".parse()?)
                .add_directive("etcd_client=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.etcd_namespace,
        "Starting chat-sync"
    );

    // Initialize metrics
    let metrics = Arc::new(SyncMetrics::new());
    info!("Prometheus metrics initialized");

    // Connect to the coordination store
    let store = Arc::new(
        EtcdStore::connect(&config.etcd_endpoints, &config.etcd_namespace).await?,
    );
    info!(endpoints = ?config.etcd_endpoints, "Connected to coordination store");

    // Connect to the platform chat bus
    let chat_bus = ChatBus::connect(&config.nats_url).await?;
    info!(url = %config.nats_url, "Connected to chat bus");

    // Fleet coordination: shard slots and the connection lock
    let (sharding, sharding_handle) = Sharding::start(
        Arc::clone(&store),
        ShardingConfig {
            lease_ttl: config.shard_lease_ttl,
            resync_delay: config.shard_resync_delay,
        },
    )
    .await?;

    let lock = ConnectionLock::start(
        Arc::clone(&store),
        LockConfig {
            ttl: config.lock_ttl,
        },
    )
    .await?;

    // Channel/identity matcher
    let matcher = Arc::new(StaticMatcher::from_links(&config.channel_links)?);

    let relay = Relay::new(
        &config,
        Arc::clone(&chat_bus),
        matcher,
        lock,
        sharding_handle.assignments(),
        Arc::clone(&metrics),
    );

    // Start health server
    let app_state = AppState {
        sharding: sharding_handle.clone(),
        bus: Arc::clone(&chat_bus),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    // The coordinator runs as its own task so shutdown can stop it (and
    // revoke the lease) even when the select below exits for another reason.
    let mut sharding_task = tokio::spawn(sharding.run());
    let mut coordinator_done = false;

    // Run everything concurrently
    tokio::select! {
        result = &mut sharding_task => {
            coordinator_done = true;
            match result {
                Ok(Err(e)) => {
                    metrics.record_error(e.error_type_label());
                    error!(error = %e, "Shard coordinator error");
                }
                Err(e) => error!(error = %e, "Shard coordinator task panicked"),
                Ok(Ok(())) => {}
            }
        }
        result = relay.run() => {
            if let Err(e) = result {
                metrics.record_error(e.error_type_label());
                error!(error = %e, "Relay error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown: revoking the lease frees our shard slot promptly
    // instead of after the TTL.
    info!("Shutting down relay...");
    if !coordinator_done {
        sharding_handle.stop().await;
        let _ = sharding_task.await;
    }
    chat_bus.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
