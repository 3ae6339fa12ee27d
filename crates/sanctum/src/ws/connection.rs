//! One client socket as seen by the hubs: an identity plus a bounded outbound queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use axum::extract::ws::Utf8Bytes;
use log::{debug, warn};
use sanctum_protocol::UserId;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A serialized text frame waiting in an outbound queue.
pub type Frame = Utf8Bytes;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The queue was full; the frame was discarded.
    Dropped,
    /// The queue was already closed; nothing happened.
    Closed,
}

/// Hub-facing half of a websocket connection.
///
/// The matching receiver is drained by the connection's writer loop. Dropping
/// the sender (see [`Connection::close`]) is what tells that loop to say goodbye.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbound: RwLock<Option<mpsc::Sender<Frame>>>,
    dropped: AtomicU64,
    unregistered: AtomicBool,
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` frames.
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            outbound: RwLock::new(Some(tx)),
            dropped: AtomicU64::new(0),
            unregistered: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Enqueue a frame without waiting.
    ///
    /// Full queues drop the frame and count it; closed queues are a no-op.
    pub fn try_send(&self, frame: impl Into<Frame>) -> SendOutcome {
        let guard = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame.into()) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Connection {} (user {}): buffer full, dropped message ({} dropped so far)",
                    self.id, self.user_id, total
                );
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "Connection {} (user {}): writer gone, message discarded",
                    self.id, self.user_id
                );
                SendOutcome::Closed
            }
        }
    }

    /// Serialize `value` and enqueue it.
    pub fn send_json<T: Serialize>(&self, value: &T) -> SendOutcome {
        match serde_json::to_string(value) {
            Ok(json) => self.try_send(json),
            Err(e) => {
                warn!("Connection {}: failed to serialize message: {}", self.id, e);
                SendOutcome::Dropped
            }
        }
    }

    /// Close the outbound queue. Frames already queued are still written.
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }

    /// Number of frames discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flip the unregistered flag; only the first caller gets `true`.
    pub(crate) fn mark_unregistered(&self) -> bool {
        !self.unregistered.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_excess_frames() {
        let (conn, mut rx) = Connection::new(1, 256);

        let outcomes: Vec<_> = (0..300)
            .map(|i| conn.try_send(format!("{{\"n\":{i}}}")))
            .collect();

        assert_eq!(
            outcomes.iter().filter(|o| **o == SendOutcome::Queued).count(),
            256
        );
        assert_eq!(
            outcomes.iter().filter(|o| **o == SendOutcome::Dropped).count(),
            44
        );
        assert_eq!(conn.dropped_count(), 44);

        let mut retained = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            retained.push(frame);
        }
        assert_eq!(retained.len(), 256);
        assert_eq!(retained[0].as_str(), "{\"n\":0}");
        assert_eq!(retained[255].as_str(), "{\"n\":255}");
    }

    #[test]
    fn send_after_close_is_noop() {
        let (conn, mut rx) = Connection::new(7, 4);
        assert_eq!(conn.try_send("first"), SendOutcome::Queued);

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert_eq!(conn.try_send("late"), SendOutcome::Closed);

        assert_eq!(rx.try_recv().unwrap().as_str(), "first");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn send_after_writer_exit_is_closed() {
        let (conn, rx) = Connection::new(7, 4);
        drop(rx);
        assert_eq!(conn.try_send("orphan"), SendOutcome::Closed);
        assert!(conn.is_closed());
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = Connection::new(1, 1);
        let (b, _rb) = Connection::new(1, 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn unregister_flag_fires_once() {
        let (conn, _rx) = Connection::new(3, 1);
        assert!(conn.mark_unregistered());
        assert!(!conn.mark_unregistered());
    }
}
