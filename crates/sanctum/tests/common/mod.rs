//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sanctum::api::{self, AppState};
use sanctum::chat::{ChatHub, OpenDirectory};
use sanctum::config::SignalingConfig;
use sanctum::db::Database;
use sanctum::game::{GameHub, GameSettings, SqliteGameRepository};
use sanctum::notify::{MemoryBus, Notifier};
use sanctum::signal::SignalHub;
use sanctum::ws::{Frame, PumpConfig};
use serde_json::Value;
use tokio::sync::mpsc;

/// Every hub wired to one in-memory database and one in-memory bus.
pub struct TestHubs {
    pub db: Database,
    pub bus: Arc<MemoryBus>,
    pub notifier: Arc<Notifier>,
    pub chat: Arc<ChatHub>,
    pub games: Arc<GameHub>,
    pub signals: Arc<SignalHub>,
}

impl TestHubs {
    pub fn state(&self) -> AppState {
        AppState::new(
            self.chat.clone(),
            self.games.clone(),
            self.signals.clone(),
            PumpConfig::default(),
        )
    }

    pub fn router(&self) -> Router {
        api::create_router(self.state())
    }

    /// Direct access to the stored rooms and moves.
    pub fn store(&self) -> SqliteGameRepository {
        SqliteGameRepository::new(self.db.pool().clone())
    }
}

pub async fn test_hubs() -> TestHubs {
    test_hubs_with(GameSettings::default()).await
}

pub async fn test_hubs_with(settings: GameSettings) -> TestHubs {
    let db = Database::in_memory().await.unwrap();
    test_hubs_on(db, settings)
}

/// Build hubs over an existing database, e.g. to simulate a second instance.
pub fn test_hubs_on(db: Database, settings: GameSettings) -> TestHubs {
    let bus = Arc::new(MemoryBus::default());
    hubs_on_bus(db, bus, settings)
}

pub fn hubs_on_bus(db: Database, bus: Arc<MemoryBus>, settings: GameSettings) -> TestHubs {
    let notifier = Arc::new(Notifier::new(bus.clone(), Duration::from_millis(200)));
    let chat = Arc::new(ChatHub::new(notifier.clone(), Arc::new(OpenDirectory)));
    let games = Arc::new(GameHub::new(
        Arc::new(SqliteGameRepository::new(db.pool().clone())),
        notifier.clone(),
        settings,
    ));
    let signals = Arc::new(SignalHub::new(notifier.clone(), &SignalingConfig::default()));
    TestHubs {
        db,
        bus,
        notifier,
        chat,
        games,
        signals,
    }
}

/// Everything currently queued for a connection, decoded.
pub fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(serde_json::from_str(frame.as_str()).unwrap());
    }
    out
}

/// Wait until at least one frame is queued, then drain.
pub async fn recv_some(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("queue closed");
    let mut out = vec![serde_json::from_str(first.as_str()).unwrap()];
    out.extend(drain(rx));
    out
}

/// Frames of one `type`.
pub fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}
