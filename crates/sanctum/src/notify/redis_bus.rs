//! Redis PUBLISH / PSUBSCRIBE transport.

use async_trait::async_trait;
use futures::{StreamExt, future};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::warn;

use super::{BusError, BusMessage, BusStream, PubSub};

pub struct RedisBus {
    client: redis::Client,
    publisher: OnceCell<MultiplexedConnection>,
}

impl RedisBus {
    /// Validate `url`; connections are opened lazily.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| anyhow::anyhow!("invalid redis url {url}: {e}"))?;
        Ok(Self {
            client,
            publisher: OnceCell::new(),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BusError> {
        self.publisher
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()
            .map_err(unavailable)
    }
}

fn unavailable(e: redis::RedisError) -> BusError {
    BusError::Unavailable(e.to_string())
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(unavailable)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.psubscribe(pattern).await.map_err(unavailable)?;

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let decoded = match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    warn!(%channel, error = %e, "dropping undecodable bus payload");
                    None
                }
            };
            future::ready(decoded)
        });
        Ok(stream.boxed())
    }
}
