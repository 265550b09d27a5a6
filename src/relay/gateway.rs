//! One Discord gateway connection.
//!
//! Wraps a Twilight shard for the relay: the event loop runs in its own
//! task and forwards the few events the relay cares about over a channel.
//! Everything lifecycle-related (when to connect, with which shard id,
//! under which lock) is decided by the relay loop, not here.

use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use twilight_gateway::{
    Config, EventTypeFlags, Intents, Shard, ShardId, StreamExt as _,
};
use twilight_model::gateway::event::Event;
use twilight_model::gateway::payload::incoming::MessageCreate;

/// Consecutive receive errors before a connection is declared dead.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Events forwarded from the gateway task to the relay loop.
#[derive(Debug)]
pub enum GatewayNotice {
    /// Identify completed and the session is live.
    Ready { guilds: usize },
    /// A guild message to mirror into platform chat.
    Message(Box<MessageCreate>),
    /// The connection is gone and will not come back by itself.
    Closed,
}

/// A live gateway connection for one `(shard_id, shard_count)` pair.
#[derive(Debug)]
pub struct GatewayConnection {
    pub shard_id: u64,
    pub shard_count: u64,
    notices: mpsc::Receiver<GatewayNotice>,
    task: JoinHandle<()>,
}

impl GatewayConnection {
    /// Open a partitioned gateway connection. The caller must hold the
    /// fleet connection lock; identify happens as soon as the task runs.
    pub fn open(
        token: String,
        intents: Intents,
        shard_id: u64,
        shard_count: u64,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, SyncError> {
        let id = u32::try_from(shard_id)
            .map_err(|_| SyncError::ShardIdOverflow { value: shard_id })?;
        let total = u32::try_from(shard_count)
            .map_err(|_| SyncError::ShardIdOverflow { value: shard_count })?;

        let config = Config::new(token, intents);
        let shard = Shard::with_config(ShardId::new(id, total), config);

        let (tx, notices) = mpsc::channel(256);
        let task = tokio::spawn(run_shard(shard, tx, metrics));

        Ok(Self {
            shard_id,
            shard_count,
            notices,
            task,
        })
    }

    /// Next forwarded event; `None` once the task is fully gone.
    pub async fn next_notice(&mut self) -> Option<GatewayNotice> {
        self.notices.recv().await
    }

    /// Whether this connection matches an assignment pair.
    pub fn matches(&self, shard_id: u64, shard_count: u64) -> bool {
        self.shard_id == shard_id && self.shard_count == shard_count
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        // Dropping the shard closes the websocket; Discord sees a normal
        // disconnect and releases the session.
        self.task.abort();
    }
}

/// Run a single shard's event loop, forwarding relay-relevant events.
async fn run_shard(
    mut shard: Shard,
    tx: mpsc::Sender<GatewayNotice>,
    metrics: Arc<SyncMetrics>,
) {
    let shard_id: u64 = shard.id().number().into();
    let mut consecutive_errors: u32 = 0;

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        let event = match item {
            Ok(event) => {
                consecutive_errors = 0;
                event
            }
            Err(source) => {
                consecutive_errors += 1;
                warn!(shard_id, error = %source, consecutive = consecutive_errors, "Error receiving gateway event");

                if matches!(
                    source.kind(),
                    twilight_gateway::error::ReceiveMessageErrorType::Reconnect
                ) {
                    // The gateway refused to take the session back; treat it
                    // as an authentication problem and hand control to the
                    // relay's reconnect path.
                    metrics.record_authentication_failure();
                    break;
                }

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    warn!(shard_id, "Gateway connection dead, giving up on this session");
                    break;
                }

                continue;
            }
        };

        match event {
            Event::Ready(ready) => {
                info!(
                    shard_id,
                    guilds = ready.guilds.len(),
                    session_id = %ready.session_id,
                    "Gateway session ready"
                );
                if tx
                    .send(GatewayNotice::Ready {
                        guilds: ready.guilds.len(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Event::Resumed => {
                info!(shard_id, "Gateway session resumed");
            }
            Event::MessageCreate(message) => {
                if tx.send(GatewayNotice::Message(message)).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }

    let _ = tx.send(GatewayNotice::Closed).await;
}
