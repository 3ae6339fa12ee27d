//! User-level realtime events (friend requests, mentions, presence).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{ "type": ..., "payload": {...} }` pushed to every socket of a user, or to everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl RealtimeEvent {
    pub const CHAT_MENTION: &'static str = "chat_mention";

    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}
