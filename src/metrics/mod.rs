//! Prometheus metrics module

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Relay metrics collector
#[derive(Clone)]
pub struct SyncMetrics {
    handle: Arc<PrometheusHandle>,
}

impl SyncMetrics {
    /// Initialize metrics and return handle
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        Self::register_metrics();

        Self {
            handle: Arc::new(handle),
        }
    }

    fn register_metrics() {
        describe_gauge!(
            "discord_shard_count",
            Unit::Count,
            "Discord total shard count"
        );
        describe_gauge!(
            "discord_active_connections",
            Unit::Count,
            "Discord gateway active connections"
        );
        describe_counter!(
            "discord_connection_attempts",
            Unit::Count,
            "Discord gateway connection attempts"
        );
        describe_counter!(
            "discord_authentication_failures",
            Unit::Count,
            "Discord gateway authentication failures"
        );
        describe_counter!(
            "discord_disconnections",
            Unit::Count,
            "Discord gateway disconnections"
        );
        describe_counter!(
            "discord_messages_from_discord",
            Unit::Count,
            "Messages relayed from Discord to platform chat"
        );
        describe_counter!(
            "discord_messages_from_platform",
            Unit::Count,
            "Messages relayed from platform chat to Discord"
        );
        describe_counter!("sync_errors_total", Unit::Count, "Total relay errors");
    }

    /// Set the fleet-wide shard count
    pub fn set_shard_count(&self, count: u64) {
        gauge!("discord_shard_count").set(count as f64);
    }

    /// Set the number of live gateway connections (0 or 1 per process)
    pub fn set_active_connections(&self, count: u64) {
        gauge!("discord_active_connections").set(count as f64);
    }

    /// Record a gateway connection attempt
    pub fn record_connection_attempt(&self) {
        counter!("discord_connection_attempts").increment(1);
    }

    /// Record a rejected gateway session
    pub fn record_authentication_failure(&self) {
        counter!("discord_authentication_failures").increment(1);
    }

    /// Record a gateway disconnection
    pub fn record_disconnection(&self) {
        counter!("discord_disconnections").increment(1);
    }

    /// Record a message relayed from Discord into platform chat
    pub fn record_message_from_discord(&self) {
        counter!("discord_messages_from_discord").increment(1);
    }

    /// Record a message relayed from platform chat into Discord
    pub fn record_message_from_platform(&self) {
        counter!("discord_messages_from_platform").increment(1);
    }

    /// Record a relay error by taxonomy label
    pub fn record_error(&self, error_type: &'static str) {
        counter!("sync_errors_total", "error_type" => error_type).increment(1);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}
