//! Cross-instance fan-out over a publish/subscribe bus.
//!
//! Hubs publish serialized envelopes on well-known channels and subscribe to
//! their own namespace, so every instance delivers to its local sockets.

mod memory;
#[cfg(feature = "redis")]
mod redis_bus;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use sanctum_protocol::{ConversationId, RoomId, UserId};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

use crate::config::{BusBackend, BusConfig};

pub const GAME_ROOM_PREFIX: &str = "game:room:";
pub const VIDEOCHAT_ROOM_PREFIX: &str = "videochat:room:";
pub const CONVERSATION_PREFIX: &str = "chat:conversation:";
pub const USER_NOTIFICATION_PREFIX: &str = "notifications:user:";
pub const BROADCAST_CHANNEL: &str = "notifications:broadcast";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("publish to {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("subscription closed")]
    Closed,
}

/// One payload received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

pub type BusStream = BoxStream<'static, BusMessage>;

/// A shared publish/subscribe transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to every channel matching `pattern` (`prefix*` or an exact name).
    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError>;
}

/// `prefix*` glob match as used by channel patterns.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

pub fn game_channel(room_id: RoomId) -> String {
    format!("{GAME_ROOM_PREFIX}{room_id}")
}

pub fn videochat_channel(room_id: &str) -> String {
    format!("{VIDEOCHAT_ROOM_PREFIX}{room_id}")
}

pub fn conversation_channel(conversation_id: ConversationId) -> String {
    format!("{CONVERSATION_PREFIX}{conversation_id}")
}

pub fn user_channel(user_id: UserId) -> String {
    format!("{USER_NOTIFICATION_PREFIX}{user_id}")
}

pub fn parse_game_channel(channel: &str) -> Option<RoomId> {
    channel.strip_prefix(GAME_ROOM_PREFIX)?.parse().ok()
}

pub fn parse_videochat_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(VIDEOCHAT_ROOM_PREFIX)
        .filter(|room| !room.is_empty())
}

pub fn parse_conversation_channel(channel: &str) -> Option<ConversationId> {
    channel.strip_prefix(CONVERSATION_PREFIX)?.parse().ok()
}

pub fn parse_user_channel(channel: &str) -> Option<UserId> {
    channel.strip_prefix(USER_NOTIFICATION_PREFIX)?.parse().ok()
}

/// Bus handle shared by the hubs. Publishing is at-most-once.
pub struct Notifier {
    bus: Arc<dyn PubSub>,
    publish_timeout: Duration,
}

impl Notifier {
    pub fn new(bus: Arc<dyn PubSub>, publish_timeout: Duration) -> Self {
        Self {
            bus,
            publish_timeout,
        }
    }

    /// In-process bus, for single-instance deployments and tests.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBus::default()),
            BusConfig::default().publish_timeout(),
        )
    }

    pub fn from_config(cfg: &BusConfig) -> anyhow::Result<Self> {
        let bus: Arc<dyn PubSub> = match cfg.backend {
            BusBackend::Memory => Arc::new(MemoryBus::default()),
            #[cfg(feature = "redis")]
            BusBackend::Redis => Arc::new(RedisBus::open(&cfg.url)?),
            #[cfg(not(feature = "redis"))]
            BusBackend::Redis => {
                anyhow::bail!("bus backend 'redis' requires building with the `redis` feature")
            }
        };
        info!(backend = ?cfg.backend, "pub/sub bus configured");
        Ok(Self::new(bus, cfg.publish_timeout()))
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        match tokio::time::timeout(self.publish_timeout, self.bus.publish(channel, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                channel: channel.to_string(),
                timeout: self.publish_timeout,
            }),
        }
    }

    pub async fn publish_to_user(&self, user_id: UserId, payload: &str) -> Result<(), BusError> {
        self.publish(&user_channel(user_id), payload).await
    }

    pub async fn publish_broadcast(&self, payload: &str) -> Result<(), BusError> {
        self.publish(BROADCAST_CHANNEL, payload).await
    }

    /// Pump messages matching `pattern` into `on_message` until `cancel` fires
    /// or the bus ends the subscription.
    ///
    /// `live` is raised once the subscription is in place and lowered when the
    /// task exits.
    pub async fn subscribe<F>(
        &self,
        pattern: &str,
        cancel: CancellationToken,
        live: Arc<AtomicBool>,
        mut on_message: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(BusMessage) + Send + 'static,
    {
        let mut stream = self.bus.psubscribe(pattern).await?;
        live.store(true, Ordering::Release);
        let pattern = pattern.to_string();
        info!(%pattern, "bus subscription started");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%pattern, "bus subscription cancelled");
                        break;
                    }
                    msg = stream.next() => match msg {
                        Some(msg) => on_message(msg),
                        None => {
                            warn!(%pattern, "bus subscription ended");
                            break;
                        }
                    },
                }
            }
            live.store(false, Ordering::Release);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        assert_eq!(game_channel(12), "game:room:12");
        assert_eq!(parse_game_channel("game:room:12"), Some(12));
        assert_eq!(parse_game_channel("game:room:abc"), None);
        assert_eq!(videochat_channel("lobby"), "videochat:room:lobby");
        assert_eq!(parse_videochat_channel("videochat:room:lobby"), Some("lobby"));
        assert_eq!(parse_videochat_channel("videochat:room:"), None);
        assert_eq!(parse_conversation_channel(&conversation_channel(101)), Some(101));
        assert_eq!(parse_user_channel(&user_channel(7)), Some(7));
        assert_eq!(parse_user_channel(BROADCAST_CHANNEL), None);
    }

    #[test]
    fn glob_patterns() {
        assert!(pattern_matches("game:room:*", "game:room:1"));
        assert!(!pattern_matches("game:room:*", "videochat:room:1"));
        assert!(pattern_matches("notifications:*", BROADCAST_CHANNEL));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }

    struct StalledBus;

    #[async_trait]
    impl PubSub for StalledBus {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BusError> {
            futures::future::pending().await
        }

        async fn psubscribe(&self, _pattern: &str) -> Result<BusStream, BusError> {
            Err(BusError::Unavailable("stalled".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_is_bounded() {
        let notifier = Notifier::new(Arc::new(StalledBus), Duration::from_secs(2));
        let err = notifier.publish("game:room:1", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn subscription_delivers_and_stops_on_cancel() {
        let notifier = Notifier::in_memory();
        let cancel = CancellationToken::new();
        let live = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = notifier
            .subscribe("game:room:*", cancel.clone(), live.clone(), move |msg| {
                let _ = tx.send(msg);
            })
            .await
            .unwrap();
        assert!(live.load(Ordering::Acquire));

        notifier.publish("videochat:room:1", "ignored").await.unwrap();
        notifier.publish("game:room:3", "{\"n\":1}").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "game:room:3");
        assert_eq!(msg.payload, "{\"n\":1}");

        cancel.cancel();
        handle.await.unwrap();
        assert!(!live.load(Ordering::Acquire));
    }
}
