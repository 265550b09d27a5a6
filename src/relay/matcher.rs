//! Channel and identity matching.
//!
//! The relay needs to know which Discord channel mirrors which platform
//! channel, and which platform identity a Discord author maps to. The
//! production deployment answers these from the platform's identity
//! database; that backend lives behind the [`Matcher`] trait.
//! [`StaticMatcher`] is the in-memory implementation used by tests and
//! single-node runs, configured from a link table.

use crate::error::SyncError;
use async_trait::async_trait;
use dashmap::DashMap;
use twilight_model::id::marker::{ChannelMarker, UserMarker};
use twilight_model::id::Id;

/// A platform chat identity resolved for one channel.
#[derive(Debug, Clone)]
pub struct PlatformUser {
    pub id: u64,
    pub username: String,
    pub roles: Vec<String>,
}

impl PlatformUser {
    pub fn is_banned(&self) -> bool {
        self.roles.iter().any(|role| role == "Banned")
    }
}

/// Identity and permission lookups the relay depends on.
#[async_trait]
pub trait Matcher: Send + Sync + 'static {
    /// Discord channel mirroring the given platform channel, if linked.
    async fn discord_channel(
        &self,
        channel: u64,
    ) -> Result<Option<Id<ChannelMarker>>, SyncError>;

    /// Platform channel mirrored by the given Discord channel, if linked.
    async fn platform_channel(
        &self,
        channel: Id<ChannelMarker>,
    ) -> Result<Option<u64>, SyncError>;

    /// Platform identity of a Discord author within a platform channel.
    async fn platform_user(
        &self,
        user: Id<UserMarker>,
        channel: u64,
    ) -> Result<Option<PlatformUser>, SyncError>;

    /// Remove a stale link (the Discord channel is gone or forbidden).
    async fn unlink(&self, channel: u64) -> Result<(), SyncError>;

    /// Drop cached role data for a user, in one channel or everywhere.
    async fn purge_user_roles(&self, user_id: u64, channel: Option<u64>)
        -> Result<(), SyncError>;
}

/// In-memory matcher backed by a fixed link table.
#[derive(Debug, Default)]
pub struct StaticMatcher {
    links: DashMap<u64, Id<ChannelMarker>>,
    reverse: DashMap<Id<ChannelMarker>, u64>,
    users: DashMap<(u64, u64), PlatformUser>,
}

impl StaticMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a link table of the form `platform:discord,platform:discord`.
    pub fn from_links(raw: &str) -> Result<Self, SyncError> {
        let matcher = Self::new();
        for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
            let (platform, discord) = entry.trim().split_once(':').ok_or_else(|| {
                SyncError::Config(format!("channel link '{entry}' is not platform:discord"))
            })?;
            let platform: u64 = platform.parse().map_err(|e| {
                SyncError::Config(format!("bad platform channel in link '{entry}': {e}"))
            })?;
            let discord: u64 = discord.parse().map_err(|e| {
                SyncError::Config(format!("bad discord channel in link '{entry}': {e}"))
            })?;
            matcher.link(platform, Id::new(discord));
        }
        Ok(matcher)
    }

    pub fn link(&self, platform: u64, discord: Id<ChannelMarker>) {
        self.links.insert(platform, discord);
        self.reverse.insert(discord, platform);
    }

    pub fn add_user(&self, discord_user: Id<UserMarker>, channel: u64, user: PlatformUser) {
        self.users.insert((discord_user.get(), channel), user);
    }
}

#[async_trait]
impl Matcher for StaticMatcher {
    async fn discord_channel(
        &self,
        channel: u64,
    ) -> Result<Option<Id<ChannelMarker>>, SyncError> {
        Ok(self.links.get(&channel).map(|entry| *entry.value()))
    }

    async fn platform_channel(
        &self,
        channel: Id<ChannelMarker>,
    ) -> Result<Option<u64>, SyncError> {
        Ok(self.reverse.get(&channel).map(|entry| *entry.value()))
    }

    async fn platform_user(
        &self,
        user: Id<UserMarker>,
        channel: u64,
    ) -> Result<Option<PlatformUser>, SyncError> {
        Ok(self
            .users
            .get(&(user.get(), channel))
            .map(|entry| entry.value().clone()))
    }

    async fn unlink(&self, channel: u64) -> Result<(), SyncError> {
        if let Some((_, discord)) = self.links.remove(&channel) {
            self.reverse.remove(&discord);
        }
        Ok(())
    }

    async fn purge_user_roles(
        &self,
        user_id: u64,
        channel: Option<u64>,
    ) -> Result<(), SyncError> {
        match channel {
            Some(channel) => {
                self.users
                    .retain(|(user, ch), _| *user != user_id || *ch != channel);
            }
            None => {
                self.users.retain(|(user, _), _| *user != user_id);
            }
        }
        Ok(())
    }
}
