//! Wire types for the platform chat bus.

pub mod packets;

pub use packets::{
    ChatMessage, DeleteMessage, MessageBody, MessageComponent, MessageMeta, PurgeMessage,
    RecipientFilter, UserRoleChange, UserTimeout,
};
