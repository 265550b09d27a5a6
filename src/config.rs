//! Configuration module
//!
//! Handles loading configuration from environment variables.

use crate::error::SyncError;
use std::env;
use std::time::Duration;
use twilight_gateway::Intents;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Discord bot token
    pub discord_token: String,

    /// etcd endpoints - comma-separated for multiple servers
    pub etcd_endpoints: Vec<String>,

    /// Key namespace under which shard slots and locks live
    pub etcd_namespace: String,

    /// NATS server URL(s) for the platform chat bus - comma-separated
    pub nats_url: String,

    /// Static channel link table, `platform:discord` pairs separated by
    /// commas. Empty when links come from elsewhere.
    pub channel_links: String,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Relay platform chat into Discord channels
    pub relay_to_discord: bool,

    /// Relay Discord messages into platform chat
    pub relay_from_discord: bool,

    /// TTL of the shard membership lease
    pub shard_lease_ttl: Duration,

    /// Delay before reacting to shard slot deletions
    pub shard_resync_delay: Duration,

    /// TTL of the connection lock (Discord identify rate limit window)
    pub lock_ttl: Duration,
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SyncError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| {
                SyncError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let etcd_endpoints: Vec<String> = env::var("ETCD_ENDPOINTS")
            .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if etcd_endpoints.is_empty() {
            return Err(SyncError::Config(
                "ETCD_ENDPOINTS must contain at least one endpoint".to_string(),
            ));
        }

        let etcd_namespace =
            env::var("ETCD_NAMESPACE").unwrap_or_else(|_| "/chat-sync".to_string());

        let nats_url =
            env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());

        let channel_links = env::var("CHANNEL_LINKS").unwrap_or_default();

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| SyncError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let relay_to_discord = parse_bool("RELAY_TO_DISCORD", true)?;
        let relay_from_discord = parse_bool("RELAY_FROM_DISCORD", true)?;

        let shard_lease_ttl = parse_secs("SHARD_LEASE_TTL_SECS", 5)?;
        let shard_resync_delay = parse_secs("SHARD_RESYNC_DELAY_SECS", 15)?;
        let lock_ttl = parse_secs("CONNECTION_LOCK_TTL_SECS", 6)?;

        Ok(Self {
            discord_token,
            etcd_endpoints,
            etcd_namespace,
            nats_url,
            channel_links,
            http_port,
            log_level,
            relay_to_discord,
            relay_from_discord,
            shard_lease_ttl,
            shard_resync_delay,
            lock_ttl,
        })
    }

    /// Gateway intents for the relay.
    ///
    /// GUILDS for channel lifecycle, GUILD_MESSAGES + MESSAGE_CONTENT to
    /// receive the messages being mirrored into platform chat.
    pub fn intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT
    }
}

fn parse_bool(var: &str, default: bool) -> Result<bool, SyncError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(SyncError::Config(format!(
                "{var} must be a boolean, got '{other}'"
            ))),
        },
    }
}

fn parse_secs(var: &str, default: u64) -> Result<Duration, SyncError> {
    let secs = match env::var(var) {
        Err(_) => default,
        Ok(raw) => raw
            .parse()
            .map_err(|e| SyncError::Config(format!("{var} must be a number of seconds: {e}")))?,
    };
    if secs == 0 {
        return Err(SyncError::Config(format!("{var} must be non-zero")));
    }
    Ok(Duration::from_secs(secs))
}
