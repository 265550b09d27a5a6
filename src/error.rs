//! Domain error types for chat-sync.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All application code returns Result<T, SyncError>.
//!
//! Contention is not an error anywhere in this crate: a lost claim race or an
//! already-held lock is reported through `bool` returns and retried locally.
//! The variants below are the failures that remain once contention is
//! filtered out, and every one of them is fatal to the operation in progress.

use thiserror::Error;

/// chat-sync domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Coordination store request failed (transport, quota or permission)
    #[error("coordination store request failed")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Coordination store watch stream closed and was not re-established
    #[error("coordination store watch stream closed")]
    WatchClosed,

    /// Chat bus connection failed
    #[error("chat bus connection failed")]
    BusConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Chat bus publish failed for a specific subject
    #[error("chat bus publish failed for subject '{subject}'")]
    BusPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Discord REST request failed
    #[error("discord request failed: {context}")]
    DiscordRequestFailed {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Packet serialization failed
    #[error("packet serialization failed for subject '{subject}'")]
    SerializationFailed {
        subject: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard ID overflow: u64 value exceeds u32::MAX (Twilight API boundary)
    #[error("shard ID overflow: {value} exceeds u32::MAX")]
    ShardIdOverflow { value: u64 },
}

impl SyncError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `sync_errors_total`, enabling
    /// per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::WatchClosed => "watch_closed",
            Self::BusConnectionFailed(_) => "bus_connection",
            Self::BusPublishFailed { .. } => "bus_publish",
            Self::DiscordRequestFailed { .. } => "discord_request",
            Self::SerializationFailed { .. } => "serialization",
            Self::Config(_) => "config",
            Self::ShardIdOverflow { .. } => "shard_overflow",
        }
    }
}

impl From<etcd_client::Error> for SyncError {
    fn from(err: etcd_client::Error) -> Self {
        SyncError::Store(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            SyncError::Store(test_error()).error_type_label(),
            SyncError::WatchClosed.error_type_label(),
            SyncError::BusConnectionFailed(test_error()).error_type_label(),
            SyncError::BusPublishFailed {
                subject: "chat.1.message".to_string(),
                source: test_error(),
            }
            .error_type_label(),
            SyncError::DiscordRequestFailed {
                context: "create message",
                source: test_error(),
            }
            .error_type_label(),
            SyncError::SerializationFailed {
                subject: "chat.1.message".to_string(),
                source: serde_json::from_str::<()>("invalid").unwrap_err(),
            }
            .error_type_label(),
            SyncError::Config("test".to_string()).error_type_label(),
            SyncError::ShardIdOverflow { value: u64::MAX }.error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn error_messages_contain_context() {
        let err = SyncError::BusPublishFailed {
            subject: "chat.123.message".to_string(),
            source: test_error(),
        };
        assert!(err.to_string().contains("chat.123.message"));

        let err = SyncError::ShardIdOverflow { value: u64::MAX };
        assert!(err.to_string().contains(&u64::MAX.to_string()));
    }

    #[test]
    fn config_error_preserves_message() {
        let err = SyncError::Config("DISCORD_TOKEN must be set".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: DISCORD_TOKEN must be set"
        );
    }
}
