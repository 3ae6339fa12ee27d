//! Reader and writer loops driving one websocket.
//!
//! The writer runs on its own task and is the only code that writes to the
//! socket. The reader runs on the upgrade task, dispatches inbound frames to the
//! handler and, when it stops for any reason, unregisters the connection from
//! its hub before tearing the writer down.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::{Connection, Frame};
use crate::config::RealtimeConfig;

/// Timing and sizing knobs of a pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub send_buffer: usize,
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for PumpConfig {
    fn from(cfg: &RealtimeConfig) -> Self {
        let pong_wait = Duration::from_secs(cfg.pong_wait_secs.max(1));
        let ping_period = match cfg.ping_period_secs {
            Some(secs) if secs > 0 && secs < cfg.pong_wait_secs => Duration::from_secs(secs),
            _ => pong_wait * 9 / 10,
        };
        Self {
            send_buffer: cfg.send_buffer.max(1),
            max_message_size: cfg.max_message_size.max(1),
            write_wait: Duration::from_secs(cfg.write_wait_secs.max(1)),
            pong_wait,
            ping_period,
        }
    }
}

/// Receives every inbound data frame of a connection, in arrival order.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]);
}

/// The hub side of a connection's lifetime.
#[async_trait]
pub trait ConnectionOwner: Send + Sync {
    /// Called once, after the reader loop has stopped.
    async fn unregister(&self, conn: &Arc<Connection>);
}

/// Why the reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    PeerClosed,
    ReadError,
    Oversized,
    DeadlineExpired,
    WriterExited,
}

/// Drive `socket` until either side gives up.
pub async fn run<S, E>(
    socket: S,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Frame>,
    owner: Arc<dyn ConnectionOwner>,
    handler: Option<Arc<dyn InboundHandler>>,
    config: PumpConfig,
) -> PumpExit
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, conn.clone(), config.clone()));
    let mut writer_done = false;
    let mut deadline = Instant::now() + config.pong_wait;

    let exit = loop {
        let next = tokio::select! {
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
            _ = &mut writer => {
                writer_done = true;
                break PumpExit::WriterExited;
            }
        };

        let msg = match next {
            Err(_) => {
                info!("Connection {} (user {}): read deadline expired", conn.id(), conn.user_id());
                break PumpExit::DeadlineExpired;
            }
            Ok(None) => break PumpExit::PeerClosed,
            Ok(Some(Err(e))) => {
                warn!("Connection {} (user {}): read error: {}", conn.id(), conn.user_id(), e);
                break PumpExit::ReadError;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let data: &[u8] = match &msg {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                continue;
            }
            // Pings are answered by the websocket layer.
            Message::Ping(_) => continue,
            Message::Close(_) => break PumpExit::PeerClosed,
        };

        if data.len() > config.max_message_size {
            warn!(
                "Connection {} (user {}): inbound frame of {} bytes exceeds limit of {}",
                conn.id(),
                conn.user_id(),
                data.len(),
                config.max_message_size
            );
            break PumpExit::Oversized;
        }

        if let Some(handler) = &handler {
            handler.on_message(&conn, data).await;
        }
    };

    if conn.mark_unregistered() {
        owner.unregister(&conn).await;
    }
    conn.close();

    if !writer_done && tokio::time::timeout(config.write_wait, &mut writer).await.is_err() {
        debug!("Connection {}: writer did not finish in time, aborting", conn.id());
        writer.abort();
    }

    debug!("Connection {} (user {}) closed: {:?}", conn.id(), conn.user_id(), exit);
    exit
}

async fn write_loop<S, E>(
    mut sink: SplitSink<S, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    conn: Arc<Connection>,
    config: PumpConfig,
) where
    S: Sink<Message, Error = E> + Send,
    E: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if !write_frame(&mut sink, Message::Text(text), &conn, config.write_wait).await {
                        break;
                    }
                }
                None => {
                    write_frame(&mut sink, Message::Close(None), &conn, config.write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if !write_frame(&mut sink, Message::Ping(Bytes::new()), &conn, config.write_wait).await {
                    break;
                }
            }
        }
    }

    outbound.close();
    let _ = tokio::time::timeout(config.write_wait, sink.close()).await;
}

async fn write_frame<S, E>(
    sink: &mut SplitSink<S, Message>,
    msg: Message,
    conn: &Connection,
    wait: Duration,
) -> bool
where
    S: Sink<Message, Error = E>,
    E: Display,
{
    match tokio::time::timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Connection {} (user {}): write failed: {}", conn.id(), conn.user_id(), e);
            false
        }
        Err(_) => {
            warn!("Connection {} (user {}): write timed out", conn.id(), conn.user_id());
            false
        }
    }
}
