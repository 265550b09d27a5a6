//! Platform chat bus client.
//!
//! The platform fans chat out over NATS subjects of the form
//! `chat.{channel}.{kind}`. The relay subscribes to the whole tree and
//! publishes mirrored Discord messages back onto the message subject.
//! Delivery is fire-and-forget pub/sub; a dropped chat line is preferable
//! to a duplicated one.

use crate::error::SyncError;
use crate::events::{ChatMessage, DeleteMessage, PurgeMessage, UserRoleChange, UserTimeout};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subject tokens for the chat tree.
pub mod subjects {
    /// Subscription covering every chat channel and kind.
    pub const WILDCARD: &str = "chat.>";

    pub const MESSAGE: &str = "message";
    pub const MESSAGE_DELETE: &str = "message_delete";
    pub const USER_TIMEOUT: &str = "user_timeout";
    pub const PURGE: &str = "purge";
    pub const ROLE_CHANGE: &str = "role_change";

    /// Subject carrying chat lines for one channel.
    pub fn chat_message(channel: u64) -> String {
        format!("chat.{channel}.{MESSAGE}")
    }
}

/// A decoded bus command addressed at the relay.
#[derive(Debug, Clone)]
pub enum BusCommand {
    Chat(u64, ChatMessage),
    Delete(u64, DeleteMessage),
    Timeout(u64, UserTimeout),
    Purge(u64, PurgeMessage),
    /// Role changes may target one channel or, with a `*` channel token,
    /// every channel.
    RoleChange(Option<u64>, UserRoleChange),
}

/// NATS-backed chat bus connection.
pub struct ChatBus {
    client: async_nats::Client,
    connected: AtomicBool,
    messages_published: AtomicU64,
}

impl ChatBus {
    /// Connect to the platform bus.
    pub async fn connect(servers: &str) -> Result<Arc<Self>, SyncError> {
        info!(servers, "Connecting to chat bus");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| SyncError::BusConnectionFailed(Box::new(e)))?;

        info!("Connected to chat bus");

        Ok(Arc::new(Self {
            client,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Subscribe to the whole chat tree.
    pub async fn subscribe(&self) -> Result<async_nats::Subscriber, SyncError> {
        self.client
            .subscribe(subjects::WILDCARD)
            .await
            .map_err(|e| SyncError::BusConnectionFailed(Box::new(e)))
    }

    /// Publish a mirrored chat line onto its channel's message subject.
    pub async fn publish_chat(&self, message: &ChatMessage) -> Result<(), SyncError> {
        let subject = subjects::chat_message(message.channel);
        let payload = serde_json::to_vec(message).map_err(|e| SyncError::SerializationFailed {
            subject: subject.clone(),
            source: e,
        })?;

        debug!(subject, message_id = %message.id, "Publishing chat line");

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| SyncError::BusPublishFailed {
                subject,
                source: Box::new(e),
            })?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing chat bus connection");
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.client.flush().await;
    }
}

/// Decode a raw bus message into a relay command. Unknown kinds and
/// malformed payloads are logged and dropped; the bus carries traffic for
/// consumers beyond the relay.
pub fn decode(subject: &str, payload: &[u8]) -> Option<BusCommand> {
    let mut parts = subject.split('.');
    let (Some("chat"), Some(channel), Some(kind), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    let channel_id = match channel {
        "*" => None,
        raw => match raw.parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(subject, "Ignoring bus message with malformed channel");
                return None;
            }
        },
    };

    let decoded = match (kind, channel_id) {
        (subjects::MESSAGE, Some(id)) => {
            serde_json::from_slice(payload).map(|m| BusCommand::Chat(id, m))
        }
        (subjects::MESSAGE_DELETE, Some(id)) => {
            serde_json::from_slice(payload).map(|m| BusCommand::Delete(id, m))
        }
        (subjects::USER_TIMEOUT, Some(id)) => {
            serde_json::from_slice(payload).map(|m| BusCommand::Timeout(id, m))
        }
        (subjects::PURGE, Some(id)) => {
            serde_json::from_slice(payload).map(|m| BusCommand::Purge(id, m))
        }
        (subjects::ROLE_CHANGE, id) => {
            serde_json::from_slice(payload).map(|m| BusCommand::RoleChange(id, m))
        }
        _ => return None,
    };

    match decoded {
        Ok(command) => Some(command),
        Err(e) => {
            warn!(subject, error = %e, "Ignoring malformed bus payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_message() {
        let packet = ChatMessage::from_discord(42, 7, "ember", vec![], "hi");
        let payload = serde_json::to_vec(&packet).unwrap();

        match decode("chat.42.message", &payload) {
            Some(BusCommand::Chat(42, message)) => assert_eq!(message.flat_text(), "hi"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_global_role_change() {
        let payload = br#"{"user_id": 9}"#;
        match decode("chat.*.role_change", payload) {
            Some(BusCommand::RoleChange(None, change)) => assert_eq!(change.user_id, 9),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(decode("chat.42.unknown", b"{}").is_none());
        assert!(decode("chat.abc.message", b"{}").is_none());
        assert!(decode("commands.42.message", b"{}").is_none());
        assert!(decode("chat.42.message.extra", b"{}").is_none());
        assert!(decode("chat.42.message", b"not-json").is_none());
    }

    #[test]
    fn subject_for_channel() {
        assert_eq!(subjects::chat_message(7), "chat.7.message");
    }
}
