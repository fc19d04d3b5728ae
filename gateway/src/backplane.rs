//! Distributed fan-out across gateway processes.
//!
//! Every room broadcast is mirrored onto a shared publish/subscribe channel
//! keyed by session, and every message arriving from that channel is mirrored
//! onto the local room. Envelopes carry the originating process ID so a
//! gateway never re-delivers its own broadcasts.

use async_trait::async_trait;
use futures_util::StreamExt as _;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Prefix for per-session backplane channels.
pub const SESSION_CHANNEL_PREFIX: &str = "codepair:session:";

/// A broadcast mirrored across the backplane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Gateway process that originated the broadcast.
    pub origin: String,
    pub session_id: String,
    /// The serialized outbound event, relayed verbatim.
    pub msg: String,
}

/// A broadcast received from another gateway process.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub session_id: String,
    pub msg: String,
}

/// Errors that can occur on the backplane.
#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Bridge between local in-process broadcast and the shared cross-process
/// publish/subscribe channel.
///
/// Delivery is at-least-once, best-effort; a dropped backplane connection may
/// lose in-flight events.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish a serialized event to the session's shared channel.
    ///
    /// # Errors
    ///
    /// * If the publish fails to reach the shared channel
    async fn publish(&self, session_id: &str, msg: &str) -> Result<(), BackplaneError>;

    /// Receive events published by other gateway processes. Self-originated
    /// envelopes are filtered out before delivery.
    ///
    /// # Errors
    ///
    /// * If the subscription cannot be established
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RemoteEvent>, BackplaneError>;
}

impl core::fmt::Debug for dyn Backplane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{Backplane}}")
    }
}

/// Redis pub/sub backplane.
///
/// One multiplexed connection for publishing, one pattern subscription over
/// `codepair:session:*` for receiving. Both are established up front so a
/// dead Redis fails the gateway at startup instead of at first broadcast.
pub struct RedisBackplane {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    origin: String,
}

impl RedisBackplane {
    /// # Errors
    ///
    /// * If the Redis connection cannot be established
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            client,
            conn,
            origin: Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, session_id: &str, msg: &str) -> Result<(), BackplaneError> {
        let envelope = serde_json::to_string(&Envelope {
            origin: self.origin.clone(),
            session_id: session_id.to_string(),
            msg: msg.to_string(),
        })?;

        let mut conn = self.conn.clone();
        let () = redis::AsyncCommands::publish(
            &mut conn,
            format!("{SESSION_CHANNEL_PREFIX}{session_id}"),
            envelope,
        )
        .await?;

        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RemoteEvent>, BackplaneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{SESSION_CHANNEL_PREFIX}*")).await?;

        let origin = self.origin.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();

            while let Some(msg) = stream.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!("Failed to read backplane message payload: {error:?}");
                        continue;
                    }
                };

                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) if envelope.origin == origin => {} // self-originated
                    Ok(envelope) => {
                        if tx
                            .send(RemoteEvent {
                                session_id: envelope.session_id,
                                msg: envelope.msg,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("Invalid backplane envelope: {error:?}");
                    }
                }
            }

            info!("Backplane subscription ended");
        });

        Ok(rx)
    }
}

/// Capacity of the in-memory bus. Slow receivers that fall behind will skip
/// messages.
const IN_MEMORY_CAPACITY: usize = 1024;

/// In-process backplane over a `tokio::sync::broadcast` bus.
///
/// Stands in for Redis in tests: [`peer`](Self::peer) yields another handle
/// on the same bus with its own origin, simulating a second gateway process.
pub struct InMemoryBackplane {
    bus: broadcast::Sender<Envelope>,
    origin: String,
}

impl InMemoryBackplane {
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(IN_MEMORY_CAPACITY);
        Self {
            bus,
            origin: Uuid::new_v4().to_string(),
        }
    }

    /// Another gateway process sharing this bus.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            origin: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for InMemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for InMemoryBackplane {
    async fn publish(&self, session_id: &str, msg: &str) -> Result<(), BackplaneError> {
        // send() errors if there are no subscribers, which is fine
        let _ = self.bus.send(Envelope {
            origin: self.origin.clone(),
            session_id: session_id.to_string(),
            msg: msg.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RemoteEvent>, BackplaneError> {
        let mut bus_rx = self.bus.subscribe();
        let origin = self.origin.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(envelope) => {
                        if envelope.origin == origin {
                            continue;
                        }
                        if tx
                            .send(RemoteEvent {
                                session_id: envelope.session_id,
                                msg: envelope.msg,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("In-memory backplane receiver lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
