//! Room-scoped relay for WebRTC negotiation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sanctum_protocol::{PeerSummary, Signal, SignalCommand, SignalKind, UserId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::error::{HubError, HubResult};
use crate::notify::{self, BusError, Notifier};
use crate::ws::{self, Connection, ConnectionId, ConnectionOwner, Frame, InboundHandler, ScopedRegistry};

/// One user's presence in a signaling room.
#[derive(Clone)]
pub struct SignalPeer {
    pub user_id: UserId,
    pub username: String,
    pub conn: Arc<Connection>,
}

impl SignalPeer {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

pub struct SignalHub {
    /// room -> user -> peer
    rooms: RwLock<ScopedRegistry<String, UserId, SignalPeer>>,
    notifier: Arc<Notifier>,
    wired: Arc<AtomicBool>,
    max_peers: usize,
}

impl SignalHub {
    pub fn new(notifier: Arc<Notifier>, config: &SignalingConfig) -> Self {
        Self {
            rooms: RwLock::new(ScopedRegistry::default()),
            notifier,
            wired: Arc::new(AtomicBool::new(false)),
            max_peers: config.max_peers_per_room.max(1),
        }
    }

    /// Add `conn` to `room_id` under `username`.
    ///
    /// The joiner privately receives the peers already present, and those peers
    /// are told about the joiner. A user joining again replaces their old entry.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: UserId,
        username: &str,
        conn: &Arc<Connection>,
    ) -> HubResult<()> {
        let key = room_id.to_string();
        let existing = {
            let mut rooms = ws::write(&self.rooms);
            if !rooms.contains(&key, &user_id) && rooms.scope_len(&key) >= self.max_peers {
                drop(rooms);
                let err = HubError::PeerLimit {
                    room: key,
                    max: self.max_peers,
                };
                warn!(room_id, user_id, max = self.max_peers, "signaling room is full");
                conn.send_json(&Signal::error(room_id, err.client_message()));
                return Err(err);
            }

            let mut existing = Vec::new();
            rooms.for_each_in_scope(&key, |peer_id, peer| {
                if *peer_id != user_id {
                    existing.push(peer.summary());
                }
            });
            rooms.register(
                key,
                user_id,
                SignalPeer {
                    user_id,
                    username: username.to_string(),
                    conn: conn.clone(),
                },
            );
            existing.sort_by_key(|peer| peer.user_id);
            existing
        };

        conn.send_json(&Signal::room_users(room_id, &existing));
        info!(room_id, user_id, username, peers = existing.len(), "peer joined signaling room");
        self.fan_out(room_id, &Signal::user_joined(room_id, user_id, username))
            .await;
        Ok(())
    }

    /// Remove `user_id` from the room and tell the rest.
    pub async fn leave(&self, room_id: &str, user_id: UserId) {
        self.remove_peer(room_id, user_id, None).await;
    }

    async fn remove_peer(&self, room_id: &str, user_id: UserId, conn_id: Option<ConnectionId>) {
        let removed = ws::write(&self.rooms)
            .unregister_if(&room_id.to_string(), &user_id, |peer| {
                conn_id.is_none_or(|id| peer.conn.id() == id)
            })
            .is_some();
        if !removed {
            return;
        }
        info!(room_id, user_id, "peer left signaling room");
        self.fan_out(room_id, &Signal::user_left(room_id, user_id))
            .await;
    }

    /// Forward an offer, answer or candidate to `target_id`, stamped with the sender.
    ///
    /// A target that is not here is looked for on other instances when the hub
    /// is wired, and otherwise dropped.
    pub async fn relay(&self, room_id: &str, from_user_id: UserId, target_id: UserId, mut signal: Signal) {
        signal.room_id = Some(room_id.to_string());
        signal.user_id = Some(from_user_id);
        signal.target_id = Some(target_id);

        if self.deliver_to_target(room_id, target_id, &signal) {
            return;
        }
        if self.wired.load(Ordering::Acquire) {
            if let Some(json) = to_json(&signal) {
                match self
                    .notifier
                    .publish(&notify::videochat_channel(room_id), &json)
                    .await
                {
                    Ok(()) => return,
                    Err(e) => warn!(room_id, error = %e, "signal publish failed"),
                }
            }
        }
        debug!(room_id, from_user_id, target_id, kind = %signal.kind, "relay target not in room");
    }

    fn deliver_to_target(&self, room_id: &str, target_id: UserId, signal: &Signal) -> bool {
        let target = ws::read(&self.rooms)
            .get(&room_id.to_string(), &target_id)
            .map(|peer| peer.conn.clone());
        match target {
            Some(conn) => {
                conn.send_json(signal);
                true
            }
            None => false,
        }
    }

    /// Local delivery to every peer of the room except `exclude`.
    pub fn broadcast_to_room(&self, room_id: &str, signal: &Signal, exclude: Option<UserId>) -> usize {
        let Some(json) = to_json(signal) else {
            return 0;
        };
        let frame = Frame::from(json);
        let targets: Vec<Arc<Connection>> = {
            let rooms = ws::read(&self.rooms);
            let mut targets = Vec::new();
            rooms.for_each_in_scope(&room_id.to_string(), |peer_id, peer| {
                if Some(*peer_id) != exclude {
                    targets.push(peer.conn.clone());
                }
            });
            targets
        };
        targets
            .iter()
            .filter(|conn| conn.try_send(frame.clone()) == ws::SendOutcome::Queued)
            .count()
    }

    /// Membership changes go to everyone but the peer they are about.
    async fn fan_out(&self, room_id: &str, signal: &Signal) {
        if self.wired.load(Ordering::Acquire) {
            if let Some(json) = to_json(signal) {
                match self
                    .notifier
                    .publish(&notify::videochat_channel(room_id), &json)
                    .await
                {
                    Ok(()) => return,
                    Err(e) => warn!(room_id, error = %e, "signal publish failed, delivering locally"),
                }
            }
        }
        self.broadcast_to_room(room_id, signal, signal.user_id);
    }

    /// Route a signal that arrived over the bus.
    fn route_remote(&self, room_id: &str, signal: Signal) {
        match signal.target_id {
            Some(target_id) => {
                self.deliver_to_target(room_id, target_id, &signal);
            }
            None => {
                self.broadcast_to_room(room_id, &signal, signal.user_id);
            }
        }
    }

    /// Leave every room that still maps this user to `conn`.
    pub async fn unregister_client(&self, conn: &Arc<Connection>) {
        let user_id = conn.user_id();
        let rooms: Vec<String> = ws::read(&self.rooms)
            .iter()
            .filter(|(_, peer_id, peer)| **peer_id == user_id && peer.conn.id() == conn.id())
            .map(|(room_id, _, _)| room_id.clone())
            .collect();
        for room_id in rooms {
            self.remove_peer(&room_id, user_id, Some(conn.id())).await;
        }
    }

    pub fn room_peers(&self, room_id: &str) -> Vec<PeerSummary> {
        let mut peers = Vec::new();
        ws::read(&self.rooms).for_each_in_scope(&room_id.to_string(), |_, peer| {
            peers.push(peer.summary());
        });
        peers.sort_by_key(|peer| peer.user_id);
        peers
    }

    pub fn is_wired(&self) -> bool {
        self.wired.load(Ordering::Acquire)
    }

    /// Deliver `videochat:room:<id>` traffic from the bus to local peers.
    pub async fn start_wiring(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let hub = Arc::clone(self);
        self.notifier
            .subscribe(
                &format!("{}*", notify::VIDEOCHAT_ROOM_PREFIX),
                cancel,
                self.wired.clone(),
                move |msg| {
                    let Some(room_id) = notify::parse_videochat_channel(&msg.channel) else {
                        warn!(channel = %msg.channel, "ignoring message on malformed videochat channel");
                        return;
                    };
                    match Signal::from_slice(msg.payload.as_bytes()) {
                        Ok(signal) => hub.route_remote(room_id, signal),
                        Err(e) => warn!(room_id, error = %e, "dropping malformed signal payload"),
                    }
                },
            )
            .await
    }

    pub fn shutdown(&self) -> usize {
        let drained = ws::write(&self.rooms).drain();
        for (room_id, _, peer) in &drained {
            peer.conn
                .send_json(&Signal::new(SignalKind::ServerShutdown, room_id));
            peer.conn.close();
        }
        info!(peers = drained.len(), "signaling hub shut down");
        drained.len()
    }
}

fn to_json(signal: &Signal) -> Option<String> {
    match serde_json::to_string(signal) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "failed to serialize signal");
            None
        }
    }
}

/// Per-connection adapter for signaling sockets.
pub struct SignalSocket {
    hub: Arc<SignalHub>,
    room_id: String,
    username: String,
}

impl SignalSocket {
    pub fn new(hub: Arc<SignalHub>, room_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hub,
            room_id: room_id.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl InboundHandler for SignalSocket {
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        let user_id = conn.user_id();
        let room_id = self.room_id.as_str();
        let command = match Signal::from_slice(raw).and_then(SignalCommand::decode) {
            Ok(command) => command,
            Err(e) => {
                warn!(room_id, user_id, error = %e, "dropping invalid signal");
                return;
            }
        };
        match command {
            SignalCommand::Join { username } => {
                let username = username.unwrap_or_else(|| self.username.clone());
                // Over-capacity joins were already answered with an error frame.
                let _ = self.hub.join(room_id, user_id, &username, conn).await;
            }
            SignalCommand::Leave => self.hub.leave(room_id, user_id).await,
            SignalCommand::Relay { target_id, signal } => {
                self.hub.relay(room_id, user_id, target_id, signal).await
            }
            SignalCommand::Unknown(kind) => debug!(room_id, user_id, %kind, "ignoring signal"),
        }
    }
}

#[async_trait]
impl ConnectionOwner for SignalSocket {
    async fn unregister(&self, conn: &Arc<Connection>) {
        self.hub.unregister_client(conn).await;
    }
}
