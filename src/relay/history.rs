//! Relayed-message history.
//!
//! Keeps a bounded record of platform messages and the Discord messages
//! they were mirrored to, so platform-side deletes, timeouts and purges can
//! be mirrored as Discord deletions.

use crate::events::ChatMessage;
use std::collections::VecDeque;
use twilight_model::id::marker::{ChannelMarker, MessageMarker};
use twilight_model::id::Id;

/// One relayed message pair.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub message: ChatMessage,
    pub discord_channel: Id<ChannelMarker>,
    pub discord_message: Id<MessageMarker>,
}

/// Predicate over history records; all set fields must match.
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub id: Option<String>,
    pub user_id: Option<u64>,
}

impl PurgeFilter {
    pub fn by_id(id: String) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_user(user_id: u64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    fn matches(&self, message: &ChatMessage) -> bool {
        if let Some(id) = &self.id {
            if &message.id != id {
                return false;
            }
        }
        if let Some(user_id) = self.user_id {
            if message.user_id != user_id {
                return false;
            }
        }
        true
    }
}

/// Bounded record of relayed messages, oldest first.
#[derive(Debug)]
pub struct History {
    records: VecDeque<HistoryRecord>,
    cap: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            records: VecDeque::new(),
            cap,
        }
    }

    /// Insert a record. Trimming is amortized: the buffer grows to 1.5×
    /// capacity before being cut back to the newest `cap` records.
    pub fn add(&mut self, record: HistoryRecord) {
        self.records.push_back(record);
        if self.records.len() > self.cap * 3 / 2 {
            let excess = self.records.len() - self.cap;
            self.records.drain(..excess);
        }
    }

    /// Remove and return the records in `channel` matching `filter`.
    pub fn purge(&mut self, channel: u64, filter: &PurgeFilter) -> Vec<HistoryRecord> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.records.len());

        for record in self.records.drain(..) {
            if record.message.channel == channel && filter.matches(&record.message) {
                removed.push(record);
            } else {
                kept.push_back(record);
            }
        }

        self.records = kept;
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
