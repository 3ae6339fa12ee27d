//! Application state shared across handlers.

use std::sync::Arc;

use crate::chat::ChatHub;
use crate::game::GameHub;
use crate::signal::SignalHub;
use crate::ws::PumpConfig;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatHub>,
    pub games: Arc<GameHub>,
    pub signals: Arc<SignalHub>,
    /// Applied to every upgraded socket.
    pub pump: PumpConfig,
}

impl AppState {
    pub fn new(
        chat: Arc<ChatHub>,
        games: Arc<GameHub>,
        signals: Arc<SignalHub>,
        pump: PumpConfig,
    ) -> Self {
        Self {
            chat,
            games,
            signals,
            pump,
        }
    }
}
