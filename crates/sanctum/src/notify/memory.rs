//! In-process bus on a tokio broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::{BusError, BusMessage, BusStream, PubSub, pattern_matches};

const DEFAULT_CAPACITY: usize = 1024;

pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
    available: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(BusError::Unavailable("memory bus disabled".into()));
        }
        // No subscribers is not an error: nobody was listening.
        let _ = self.tx.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let msg = match item {
                Ok(msg) if pattern_matches(&pattern, &msg.channel) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%pattern, skipped, "bus subscriber lagged, messages lost");
                    None
                }
            };
            future::ready(msg)
        });
        Ok(stream.boxed())
    }
}
