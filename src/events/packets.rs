//! Chat bus packet payloads.
//!
//! These structs are the JSON contract shared with the platform's chat
//! services; field names must not drift. `tests/wire_format.rs` locks the
//! shapes down.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as carried on `chat.{channel}.message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel: u64,
    pub user_name: String,
    pub user_id: u64,
    pub user_roles: Vec<String>,
    pub user_avatar: Option<String>,
    pub message: MessageBody,
    /// Present when the message targets a subset of viewers; such messages
    /// are never mirrored to Discord.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_filter: Option<RecipientFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: Vec<MessageComponent>,
    pub meta: MessageMeta,
    /// Set when a chat filter held the message back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageComponent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    /// True when the message originated on Discord; stops echo loops.
    #[serde(default)]
    pub discord: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientFilter {
    pub roles: Vec<String>,
}

impl ChatMessage {
    /// Wrap a Discord message for publication into platform chat. The
    /// packet is flagged as Discord-originated so the relay's own
    /// subscription skips it.
    pub fn from_discord(
        channel: u64,
        user_id: u64,
        user_name: &str,
        user_roles: Vec<String>,
        content: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel,
            user_name: user_name.to_string(),
            user_id,
            user_roles,
            user_avatar: None,
            message: MessageBody {
                message: vec![MessageComponent {
                    kind: "text".to_string(),
                    data: content.to_string(),
                    text: content.to_string(),
                }],
                meta: MessageMeta { discord: true },
                filter_id: None,
            },
            recipient_filter: None,
        }
    }

    /// Flatten the component list into the plain text sent to Discord.
    pub fn flat_text(&self) -> String {
        self.message
            .message
            .iter()
            .map(|c| if c.text.is_empty() { c.data.as_str() } else { c.text.as_str() })
            .collect()
    }

    /// Whether this packet should be mirrored into Discord at all.
    pub fn mirrorable(&self) -> bool {
        self.recipient_filter.is_none()
            && self.message.filter_id.is_none()
            && !self.message.meta.discord
    }
}

/// `chat.{channel}.message_delete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub id: String,
}

/// `chat.{channel}.user_timeout`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTimeout {
    pub user: u64,
}

/// `chat.{channel}.purge`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeMessage {
    pub user_id: u64,
}

/// `chat.{channel}.role_change`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRoleChange {
    pub user_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_origin_is_not_mirrorable() {
        let packet = ChatMessage::from_discord(42, 7, "ember", vec!["Mod".into()], "hi");
        assert!(packet.message.meta.discord);
        assert!(!packet.mirrorable());
    }

    #[test]
    fn filtered_messages_are_not_mirrorable() {
        let mut packet = ChatMessage::from_discord(42, 7, "ember", vec![], "hi");
        packet.message.meta.discord = false;
        assert!(packet.mirrorable());

        packet.message.filter_id = Some(3);
        assert!(!packet.mirrorable());

        packet.message.filter_id = None;
        packet.recipient_filter = Some(RecipientFilter {
            roles: vec!["Subscriber".into()],
        });
        assert!(!packet.mirrorable());
    }

    #[test]
    fn flat_text_joins_components() {
        let mut packet = ChatMessage::from_discord(1, 1, "a", vec![], "hello ");
        packet.message.message.push(MessageComponent {
            kind: "emoticon".to_string(),
            data: ":)".to_string(),
            text: String::new(),
        });
        assert_eq!(packet.flat_text(), "hello :)");
    }
}
