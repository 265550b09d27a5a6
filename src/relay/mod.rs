//! The relay: consumes coordination decisions and moves chat.
//!
//! One task owns the Discord connection lifecycle and all message plumbing.
//! It reacts to shard assignment changes by reconnecting (guarded by the
//! fleet connection lock), mirrors platform chat into Discord and Discord
//! messages back into platform chat, and replays platform-side deletions
//! against Discord.

pub mod gateway;
pub mod history;
pub mod matcher;
pub mod retry;

use crate::bus::{self, BusCommand, ChatBus};
use crate::config::SyncConfig;
use crate::coordination::{Assignment, ConnectionLock, CoordinationStore};
use crate::error::SyncError;
use crate::events::ChatMessage;
use crate::metrics::SyncMetrics;
use futures::StreamExt;
use gateway::{GatewayConnection, GatewayNotice};
use history::{History, HistoryRecord, PurgeFilter};
use matcher::Matcher;
use retry::RetryHandler;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use twilight_model::id::marker::MessageMarker;
use twilight_model::id::Id;

/// Outgoing platform messages are sent by shard zero only; every shard
/// would otherwise mirror the same line.
fn is_outgoing_shard(assignment: Assignment) -> bool {
    assignment.shard_id() == Some(0)
}

/// The chat relay task.
pub struct Relay<S> {
    token: String,
    relay_to_discord: bool,
    relay_from_discord: bool,
    bus: Arc<ChatBus>,
    http: Arc<twilight_http::Client>,
    matcher: Arc<dyn Matcher>,
    history: History,
    retries: RetryHandler,
    lock: ConnectionLock<S>,
    assignments: watch::Receiver<Assignment>,
    metrics: Arc<SyncMetrics>,
}

impl<S: CoordinationStore> Relay<S> {
    pub fn new(
        config: &SyncConfig,
        bus: Arc<ChatBus>,
        matcher: Arc<dyn Matcher>,
        lock: ConnectionLock<S>,
        assignments: watch::Receiver<Assignment>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let http = Arc::new(twilight_http::Client::new(config.discord_token.clone()));

        Self {
            token: config.discord_token.clone(),
            relay_to_discord: config.relay_to_discord,
            relay_from_discord: config.relay_from_discord,
            bus,
            http,
            matcher,
            history: History::default(),
            retries: RetryHandler::new(),
            lock,
            assignments,
            metrics,
        }
    }

    /// Drive the relay until a fatal error.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let mut subscriber = self.bus.subscribe().await?;
        let mut connection: Option<GatewayConnection> = None;
        let mut reconnect_at: Option<Instant> = None;

        // Catch up with whatever the coordinator decided before we started.
        let initial = *self.assignments.borrow_and_update();
        if initial.is_assigned() {
            self.reconnect(initial, &mut connection).await?;
        }

        loop {
            let retry_at = reconnect_at;

            tokio::select! {
                changed = self.assignments.changed() => {
                    if changed.is_err() {
                        // Coordinator gone; nothing sane left to relay for.
                        return Err(SyncError::WatchClosed);
                    }
                    let assignment = *self.assignments.borrow_and_update();
                    if let Some(total) = assignment.shard_count() {
                        self.metrics.set_shard_count(total);
                    }
                    self.retries.reset();
                    reconnect_at = None;
                    self.reconnect(assignment, &mut connection).await?;
                }

                notice = next_notice(&mut connection), if connection.is_some() => {
                    match notice {
                        Some(GatewayNotice::Ready { guilds }) => {
                            debug!(guilds, "Connected to chat gateway");
                            self.metrics.set_active_connections(1);
                            self.retries.reset();
                            // Hold the lock one more TTL while Discord's
                            // identify rate limit window clears.
                            self.lock.renew();

                            // If the sharding info changed while we were
                            // identifying, reconnect with the fresh values.
                            let assignment = *self.assignments.borrow_and_update();
                            let stale = match (&connection, assignment) {
                                (Some(conn), Assignment::Assigned { id, total }) => {
                                    !conn.matches(id, total)
                                }
                                (Some(_), Assignment::Unassigned) => true,
                                (None, _) => false,
                            };
                            if stale {
                                self.reconnect(assignment, &mut connection).await?;
                            }
                        }
                        Some(GatewayNotice::Message(message)) => {
                            if let Err(e) = self.mirror_from_discord(&message).await {
                                self.metrics.record_error(e.error_type_label());
                                warn!(error = %e, "Failed to mirror Discord message");
                            }
                        }
                        Some(GatewayNotice::Closed) | None => {
                            warn!("Disconnected from Discord");
                            connection = None;
                            self.metrics.record_disconnection();
                            self.metrics.set_active_connections(0);
                            reconnect_at = Some(Instant::now() + self.retries.next_delay());
                        }
                    }
                }

                _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                    reconnect_at = None;
                    let assignment = *self.assignments.borrow_and_update();
                    self.reconnect(assignment, &mut connection).await?;
                }

                message = subscriber.next() => {
                    match message {
                        Some(message) => {
                            let connected = connection.is_some();
                            self.handle_bus(&message.subject, &message.payload, connected).await;
                        }
                        None => {
                            return Err(SyncError::BusConnectionFailed(
                                "chat bus subscription ended".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Tear down the current connection and, if assigned, open a new one
    /// under the fleet connection lock.
    async fn reconnect(
        &mut self,
        assignment: Assignment,
        connection: &mut Option<GatewayConnection>,
    ) -> Result<(), SyncError> {
        if connection.take().is_some() {
            info!("Disconnecting from Discord");
            self.metrics.set_active_connections(0);
        }

        if !assignment.is_assigned() {
            // Unassigned: stay offline until the coordinator hands us a slot.
            return Ok(());
        }

        debug!("Waiting for connection lock");
        self.lock.acquire().await?;

        // The assignment may have moved while we waited for the lock;
        // connect with the freshest value.
        let assignment = *self.assignments.borrow_and_update();
        let Assignment::Assigned { id, total } = assignment else {
            return Ok(());
        };

        info!(shard_id = id, shard_count = total, "Connecting to Discord");
        self.metrics.record_connection_attempt();
        *connection = Some(GatewayConnection::open(
            self.token.clone(),
            SyncConfig::intents(),
            id,
            total,
            Arc::clone(&self.metrics),
        )?);
        Ok(())
    }

    /// Dispatch one platform bus message.
    async fn handle_bus(&mut self, subject: &str, payload: &[u8], connected: bool) {
        let Some(command) = bus::decode(subject, payload) else {
            return;
        };

        match command {
            BusCommand::Chat(channel, packet) => {
                if !connected || !is_outgoing_shard(*self.assignments.borrow()) {
                    return;
                }
                if let Err(e) = self.send_to_discord(channel, packet).await {
                    self.metrics.record_error(e.error_type_label());
                    warn!(channel, error = %e, "Failed to relay chat line to Discord");
                }
            }
            BusCommand::Delete(channel, delete) => {
                self.purge(channel, PurgeFilter::by_id(delete.id)).await;
            }
            BusCommand::Timeout(channel, timeout) => {
                self.purge(channel, PurgeFilter::by_user(timeout.user)).await;
            }
            BusCommand::Purge(channel, purge) => {
                self.purge(channel, PurgeFilter::by_user(purge.user_id)).await;
            }
            BusCommand::RoleChange(channel, change) => {
                if let Err(e) = self.matcher.purge_user_roles(change.user_id, channel).await {
                    warn!(user_id = change.user_id, error = %e, "Role cache purge failed");
                }
            }
        }
    }

    /// Post a platform chat line into its linked Discord channel.
    async fn send_to_discord(
        &mut self,
        channel: u64,
        packet: ChatMessage,
    ) -> Result<(), SyncError> {
        if !packet.mirrorable() {
            return Ok(());
        }

        self.metrics.record_message_from_platform();

        if !self.relay_to_discord {
            return Ok(());
        }

        let Some(discord_channel) = self.matcher.discord_channel(channel).await? else {
            return Ok(());
        };

        let content = format!("**<{}>:** {}", packet.user_name, packet.flat_text());

        match self.http.create_message(discord_channel).content(&content).await {
            Ok(response) => {
                let created = response.model().await.map_err(|e| {
                    SyncError::DiscordRequestFailed {
                        context: "read created message",
                        source: Box::new(e),
                    }
                })?;
                self.history.add(HistoryRecord {
                    message: packet,
                    discord_channel,
                    discord_message: created.id,
                });
                Ok(())
            }
            Err(e) => {
                if let twilight_http::error::ErrorType::Response { status, .. } = e.kind() {
                    // Forbidden or missing channel: the link is stale.
                    if status.get() == 403 || status.get() == 404 {
                        info!(channel, "Unlinking dead Discord channel");
                        self.matcher.unlink(channel).await?;
                        return Ok(());
                    }
                }
                Err(SyncError::DiscordRequestFailed {
                    context: "create message",
                    source: Box::new(e),
                })
            }
        }
    }

    /// Publish a Discord message into its linked platform channel.
    async fn mirror_from_discord(
        &mut self,
        message: &twilight_model::gateway::payload::incoming::MessageCreate,
    ) -> Result<(), SyncError> {
        if message.author.bot {
            return Ok(());
        }

        let Some(channel) = self.matcher.platform_channel(message.channel_id).await? else {
            return Ok(());
        };

        self.metrics.record_message_from_discord();

        if !self.relay_from_discord {
            return Ok(());
        }

        let Some(user) = self.matcher.platform_user(message.author.id, channel).await? else {
            return Ok(());
        };
        if user.is_banned() {
            return Ok(());
        }

        let packet = ChatMessage::from_discord(
            channel,
            user.id,
            &user.username,
            user.roles,
            &message.content,
        );
        self.history.add(HistoryRecord {
            message: packet.clone(),
            discord_channel: message.channel_id,
            discord_message: message.id,
        });
        self.bus.publish_chat(&packet).await
    }

    /// Mirror a platform-side deletion: drop matching history records and
    /// delete the corresponding Discord messages. Failures are logged, not
    /// fatal; the messages age out of Discord's view regardless.
    async fn purge(&mut self, channel: u64, filter: PurgeFilter) {
        debug!(channel, ?filter, "Purging mirrored messages");

        let records = self.history.purge(channel, &filter);
        let Some(last) = records.last() else {
            return;
        };
        let discord_channel = last.discord_channel;
        let ids: Vec<Id<MessageMarker>> = records.iter().map(|r| r.discord_message).collect();

        // Bulk delete takes at most 100 ids and at least 2.
        for chunk in ids.chunks(100) {
            let result = match chunk {
                [only] => self
                    .http
                    .delete_message(discord_channel, *only)
                    .await
                    .map(|_| ()),
                many => self
                    .http
                    .delete_messages(discord_channel, many)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(channel, error = %e, "Failed to delete mirrored messages");
            }
        }
    }
}

async fn next_notice(connection: &mut Option<GatewayConnection>) -> Option<GatewayNotice> {
    match connection {
        Some(conn) => conn.next_notice().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shard_zero_forwards_outgoing_chat() {
        assert!(is_outgoing_shard(Assignment::Assigned { id: 0, total: 3 }));
        assert!(!is_outgoing_shard(Assignment::Assigned { id: 1, total: 3 }));
        assert!(!is_outgoing_shard(Assignment::Unassigned));
    }
}
