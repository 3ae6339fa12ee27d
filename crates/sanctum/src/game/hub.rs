//! Room-scoped hub for two-player games.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sanctum_protocol::{GameAction, GameActionKind, GameCommand, Move, RoomId, UserId};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::repository::{GameRepository, GameStats};
use super::room::{GameRoom, GameStatus, GameType};
use crate::config::GameConfig;
use crate::error::{HubError, HubResult};
use crate::notify::{self, BusError, Notifier};
use crate::ws::{self, Connection, ConnectionOwner, Frame, InboundHandler, ScopedRegistry};

/// Two seats per room.
pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone)]
pub struct GameSettings {
    pub forfeit_grace: Duration,
    pub win_points: i64,
}

impl From<&GameConfig> for GameSettings {
    fn from(cfg: &GameConfig) -> Self {
        Self {
            forfeit_grace: cfg.forfeit_grace(),
            win_points: cfg.win_points,
        }
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self::from(&GameConfig::default())
    }
}

#[derive(Default)]
struct GameState {
    /// room -> user -> that user's socket in the room
    rooms: ScopedRegistry<RoomId, UserId, Arc<Connection>>,
    /// user -> rooms the user is connected to
    user_rooms: ScopedRegistry<UserId, RoomId, ()>,
}

pub struct GameHub {
    state: RwLock<GameState>,
    store: Arc<dyn GameRepository>,
    notifier: Arc<Notifier>,
    wired: Arc<AtomicBool>,
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    timers: CancellationToken,
    /// Pending forfeit per seat, tagged with the generation that armed it.
    forfeits: DashMap<(RoomId, UserId), (u64, CancellationToken)>,
    forfeit_generation: AtomicU64,
    settings: GameSettings,
}

impl GameHub {
    pub fn new(
        store: Arc<dyn GameRepository>,
        notifier: Arc<Notifier>,
        settings: GameSettings,
    ) -> Self {
        Self {
            state: RwLock::new(GameState::default()),
            store,
            notifier,
            wired: Arc::new(AtomicBool::new(false)),
            room_locks: DashMap::new(),
            timers: CancellationToken::new(),
            forfeits: DashMap::new(),
            forfeit_generation: AtomicU64::new(0),
            settings,
        }
    }

    /// Whether `user_id` could take a seat in `room_id` right now.
    pub fn can_register(&self, user_id: UserId, room_id: RoomId) -> bool {
        let state = ws::read(&self.state);
        state.rooms.contains(&room_id, &user_id) || state.rooms.scope_len(&room_id) < ROOM_CAPACITY
    }

    /// Seat a connection in a room. A user already seated has their connection replaced.
    pub fn register(
        &self,
        user_id: UserId,
        room_id: RoomId,
        conn: &Arc<Connection>,
    ) -> HubResult<()> {
        let mut state = ws::write(&self.state);
        if !state.rooms.contains(&room_id, &user_id)
            && state.rooms.scope_len(&room_id) >= ROOM_CAPACITY
        {
            return Err(HubError::RoomFull);
        }
        let replaced = state.rooms.register(room_id, user_id, conn.clone());
        state.user_rooms.register(user_id, room_id, ());
        drop(state);

        if let Some((_, (_, timer))) = self.forfeits.remove(&(room_id, user_id)) {
            timer.cancel();
            debug!(room_id, user_id, "forfeit timer cancelled by reconnect");
        }

        match replaced {
            Some(old) => info!(room_id, user_id, old_conn = old.id(), "game connection replaced"),
            None => info!(room_id, user_id, "user registered in game room"),
        }
        Ok(())
    }

    /// Drop `conn` from `room_id` if it is still the user's seat there, then
    /// apply the disconnect rules of the room.
    pub async fn unregister_client(self: &Arc<Self>, room_id: RoomId, conn: &Arc<Connection>) {
        let user_id = conn.user_id();
        let removed = {
            let mut state = ws::write(&self.state);
            let removed = state
                .rooms
                .unregister_if(&room_id, &user_id, |c| c.id() == conn.id())
                .is_some();
            if removed {
                state.user_rooms.unregister(&user_id, &room_id);
            }
            removed
        };
        if !removed {
            return;
        }
        info!(room_id, user_id, "user left game room");

        let room = match self.store.room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => return,
            Err(e) => {
                error!(room_id, error = %e, "failed to load room after disconnect");
                return;
            }
        };

        match room.status() {
            GameStatus::Pending if room.creator_id() == user_id => {
                if let Err(e) = self.cancel_pending(room_id, user_id).await {
                    warn!(room_id, error = %e, "failed to cancel pending room");
                }
            }
            GameStatus::Active if room.is_participant(user_id) => {
                self.schedule_forfeit(room_id, user_id);
            }
            _ => {}
        }
    }

    pub fn is_registered(&self, room_id: RoomId, user_id: UserId) -> bool {
        ws::read(&self.state).rooms.contains(&room_id, &user_id)
    }

    /// Users currently connected to a room.
    pub fn room_peers(&self, room_id: RoomId) -> Vec<UserId> {
        let mut peers = ws::read(&self.state).rooms.members(&room_id);
        peers.sort_unstable();
        peers
    }

    /// Rooms a user is currently connected to.
    pub fn user_rooms(&self, user_id: UserId) -> Vec<RoomId> {
        ws::read(&self.state).user_rooms.members(&user_id)
    }

    pub async fn create_room(&self, creator_id: UserId, game_type: GameType) -> HubResult<GameRoom> {
        let room = self.store.create_room(creator_id, game_type).await?;
        info!(room_id = room.id(), creator_id, %game_type, "game room created");
        Ok(room)
    }

    pub async fn room(&self, room_id: RoomId) -> HubResult<GameRoom> {
        self.store
            .room(room_id)
            .await?
            .ok_or(HubError::RoomNotFound(room_id))
    }

    pub async fn pending_rooms(&self, game_type: GameType) -> HubResult<Vec<GameRoom>> {
        Ok(self.store.pending_rooms(game_type).await?)
    }

    pub async fn stats(&self, user_id: UserId, game_type: GameType) -> HubResult<GameStats> {
        Ok(self.store.stats(user_id, game_type).await?)
    }

    /// Decode and execute one inbound frame from `conn`, seated in `room_id`.
    pub async fn handle_message(&self, room_id: RoomId, conn: &Arc<Connection>, raw: &[u8]) {
        let user_id = conn.user_id();
        let mut action = match GameAction::from_slice(raw) {
            Ok(action) => action,
            Err(e) => {
                warn!(room_id, user_id, error = %e, "dropping malformed game frame");
                return;
            }
        };
        action.room_id = Some(room_id);
        action.user_id = Some(user_id);

        let result = match GameCommand::decode(&action) {
            Ok(command) => self.execute(room_id, user_id, command, &action).await,
            Err(e) if action.kind == GameActionKind::MakeMove => {
                debug!(room_id, user_id, error = %e, "undecodable move");
                Err(HubError::InvalidMoveFormat)
            }
            Err(e) => {
                warn!(room_id, user_id, error = %e, "dropping invalid game action");
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_client_error() {
                debug!(room_id, user_id, error = %e, "game action rejected");
            } else {
                error!(room_id, user_id, error = %e, "game action failed");
            }
            conn.send_json(&GameAction::error(room_id, e.client_message()));
        }
    }

    async fn execute(
        &self,
        room_id: RoomId,
        user_id: UserId,
        command: GameCommand,
        action: &GameAction,
    ) -> HubResult<()> {
        match command {
            GameCommand::JoinRoom => self.join_room(room_id, user_id).await,
            GameCommand::MakeMove(mv) => self.make_move(room_id, user_id, mv, &action.payload).await,
            GameCommand::Chat(_) => {
                self.fan_out(room_id, action).await;
                Ok(())
            }
            GameCommand::CreateRoom => Err(HubError::CreateOverSocket),
            GameCommand::Unknown(kind) => {
                warn!(room_id, user_id, %kind, "unknown game action type");
                Ok(())
            }
        }
    }

    async fn lock_room(&self, room_id: RoomId) -> OwnedMutexGuard<()> {
        let lock = self
            .room_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Seat `user_id` as the opponent and start the game.
    pub async fn join_room(&self, room_id: RoomId, user_id: UserId) -> HubResult<()> {
        let _guard = self.lock_room(room_id).await;
        let mut room = self.room(room_id).await?;
        room.join(user_id)?;
        if !self.store.update_room(&room, GameStatus::Pending).await? {
            return Err(HubError::NotJoinable);
        }
        info!(room_id, creator_id = room.creator_id(), opponent_id = user_id, "game started");

        self.fan_out(
            room_id,
            &GameAction::new(GameActionKind::GameStarted, room_id, room.started_payload()),
        )
        .await;
        self.fan_out(
            room_id,
            &GameAction::new(GameActionKind::GameState, room_id, room.state_payload()),
        )
        .await;
        Ok(())
    }

    /// Apply a move by `user_id`, persisting it and any resulting finish.
    pub async fn make_move(
        &self,
        room_id: RoomId,
        user_id: UserId,
        mv: Move,
        raw_move: &Value,
    ) -> HubResult<()> {
        let _guard = self.lock_room(room_id).await;
        let mut room = self.room(room_id).await?;
        let outcome = room.apply_move(user_id, mv)?;

        let finish = room.finish();
        let recorded = self
            .store
            .commit_move(&room, user_id, &raw_move.to_string(), finish, self.settings.win_points)
            .await?;
        let Some(recorded) = recorded else {
            // Another instance moved this room on since it was loaded.
            debug!(room_id, user_id, "move lost to a concurrent write");
            return Err(HubError::NotYourTurn);
        };
        debug!(room_id, user_id, move_number = recorded.move_number, "move stored");
        if finish.is_some() {
            info!(room_id, ?outcome, "game finished");
        }

        let mut state = GameAction::new(GameActionKind::GameState, room_id, room.state_payload());
        state.user_id = Some(user_id);
        self.fan_out(room_id, &state).await;

        if room.status().is_terminal() {
            self.room_locks.remove(&room_id);
        }
        Ok(())
    }

    async fn cancel_pending(&self, room_id: RoomId, creator_id: UserId) -> HubResult<()> {
        let _guard = self.lock_room(room_id).await;
        let mut room = self.room(room_id).await?;
        if room.status() != GameStatus::Pending || room.creator_id() != creator_id {
            return Ok(());
        }
        room.cancel()?;
        if !self.store.update_room(&room, GameStatus::Pending).await? {
            return Ok(());
        }
        self.room_locks.remove(&room_id);
        info!(room_id, creator_id, "pending room cancelled because creator disconnected");
        Ok(())
    }

    /// Arm a forfeit for the seat, replacing any timer armed by an earlier disconnect.
    fn schedule_forfeit(self: &Arc<Self>, room_id: RoomId, user_id: UserId) {
        let hub = Arc::clone(self);
        let grace = self.settings.forfeit_grace;
        let key = (room_id, user_id);
        let generation = self.forfeit_generation.fetch_add(1, Ordering::Relaxed);
        let cancelled = self.timers.child_token();
        if let Some((_, previous)) = self.forfeits.insert(key, (generation, cancelled.clone())) {
            previous.cancel();
        }
        debug!(room_id, user_id, ?grace, "forfeit timer started");

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            hub.forfeits.remove_if(&key, |_, (armed, _)| *armed == generation);
            if let Err(e) = hub.forfeit_if_absent(room_id, user_id).await {
                warn!(room_id, user_id, error = %e, "forfeit failed");
            }
        });
    }

    /// Finish an active room in favour of the other player if `user_id` has not come back.
    pub async fn forfeit_if_absent(&self, room_id: RoomId, user_id: UserId) -> HubResult<bool> {
        if self.is_registered(room_id, user_id) {
            return Ok(false);
        }
        let _guard = self.lock_room(room_id).await;
        let mut room = self.room(room_id).await?;
        if room.status() != GameStatus::Active || !room.is_participant(user_id) {
            return Ok(false);
        }
        let finish = room.forfeit(user_id)?;
        if !self
            .store
            .finish_room(&room, finish, self.settings.win_points)
            .await?
        {
            return Ok(false);
        }
        info!(room_id, absent = user_id, winner = ?room.winner_id(), "game forfeited");

        let mut payload = room.state_payload();
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("forfeit".into(), Value::Bool(true));
        }
        self.fan_out(
            room_id,
            &GameAction::new(GameActionKind::GameState, room_id, payload),
        )
        .await;
        self.room_locks.remove(&room_id);
        Ok(true)
    }

    /// Deliver to every local connection of the room.
    pub fn broadcast_to_room(&self, room_id: RoomId, action: &GameAction) -> usize {
        match serde_json::to_string(action) {
            Ok(json) => self.deliver(room_id, Frame::from(json)),
            Err(e) => {
                error!(room_id, error = %e, "failed to serialize game action");
                0
            }
        }
    }

    fn deliver(&self, room_id: RoomId, frame: Frame) -> usize {
        let targets = ws::read(&self.state).rooms.snapshot(&room_id);
        targets
            .iter()
            .filter(|conn| conn.try_send(frame.clone()) == ws::SendOutcome::Queued)
            .count()
    }

    /// Publish when wired; otherwise, or when the bus fails, deliver locally.
    async fn fan_out(&self, room_id: RoomId, action: &GameAction) {
        let json = match serde_json::to_string(action) {
            Ok(json) => json,
            Err(e) => {
                error!(room_id, error = %e, "failed to serialize game action");
                return;
            }
        };
        if self.wired.load(Ordering::Acquire) {
            match self
                .notifier
                .publish(&notify::game_channel(room_id), &json)
                .await
            {
                Ok(()) => return,
                Err(e) => warn!(room_id, error = %e, "game publish failed, delivering locally"),
            }
        }
        self.deliver(room_id, Frame::from(json));
    }

    pub fn is_wired(&self) -> bool {
        self.wired.load(Ordering::Acquire)
    }

    /// Deliver `game:room:<id>` traffic from the bus to local sockets.
    pub async fn start_wiring(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let hub = Arc::clone(self);
        self.notifier
            .subscribe(
                &format!("{}*", notify::GAME_ROOM_PREFIX),
                cancel,
                self.wired.clone(),
                move |msg| {
                    let Some(room_id) = notify::parse_game_channel(&msg.channel) else {
                        warn!(channel = %msg.channel, "ignoring message on malformed game channel");
                        return;
                    };
                    match GameAction::from_slice(msg.payload.as_bytes()) {
                        Ok(action) => {
                            hub.broadcast_to_room(room_id, &action);
                        }
                        Err(e) => warn!(room_id, error = %e, "dropping malformed game payload"),
                    }
                },
            )
            .await
    }

    /// Tell every connected player the server is going away and close their queues.
    pub fn shutdown(&self) -> usize {
        self.timers.cancel();
        self.forfeits.clear();
        let drained = {
            let mut state = ws::write(&self.state);
            state.user_rooms.drain();
            state.rooms.drain()
        };
        for (room_id, _, conn) in &drained {
            conn.send_json(&GameAction::shutdown(*room_id));
            conn.close();
        }
        info!(connections = drained.len(), "game hub shut down");
        drained.len()
    }
}

/// Per-connection adapter binding a socket to its room.
pub struct GameSocket {
    hub: Arc<GameHub>,
    room_id: RoomId,
}

impl GameSocket {
    pub fn new(hub: Arc<GameHub>, room_id: RoomId) -> Self {
        Self { hub, room_id }
    }
}

#[async_trait]
impl InboundHandler for GameSocket {
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        self.hub.handle_message(self.room_id, conn, raw).await;
    }
}

#[async_trait]
impl ConnectionOwner for GameSocket {
    async fn unregister(&self, conn: &Arc<Connection>) {
        self.hub.unregister_client(self.room_id, conn).await;
    }
}
