//! WebRTC signaling envelope.
//!
//! The relay never looks inside `payload`; SDP and ICE candidates are opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, UserId};

crate::wire_kind! {
    /// Discriminator of a [`Signal`].
    pub enum SignalKind {
        Join => "join",
        Leave => "leave",
        Offer => "offer",
        Answer => "answer",
        IceCandidate => "ice-candidate",
        RoomUsers => "room_users",
        UserJoined => "user_joined",
        UserLeft => "user_left",
        Error => "error",
        ServerShutdown => "server_shutdown",
    }
}

impl SignalKind {
    /// Offer, answer and candidate messages are routed to a single target peer.
    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// One entry of a `room_users` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub user_id: UserId,
    pub username: String,
}

impl Signal {
    pub fn new(kind: SignalKind, room_id: &str) -> Self {
        Self {
            kind,
            room_id: Some(room_id.to_string()),
            user_id: None,
            target_id: None,
            username: None,
            payload: None,
        }
    }

    pub fn room_users(room_id: &str, peers: &[PeerSummary]) -> Self {
        let mut signal = Self::new(SignalKind::RoomUsers, room_id);
        signal.payload = Some(serde_json::json!({ "users": peers }));
        signal
    }

    pub fn user_joined(room_id: &str, user_id: UserId, username: &str) -> Self {
        let mut signal = Self::new(SignalKind::UserJoined, room_id);
        signal.user_id = Some(user_id);
        signal.username = Some(username.to_string());
        signal
    }

    pub fn user_left(room_id: &str, user_id: UserId) -> Self {
        let mut signal = Self::new(SignalKind::UserLeft, room_id);
        signal.user_id = Some(user_id);
        signal
    }

    pub fn error(room_id: &str, message: impl Into<String>) -> Self {
        let mut signal = Self::new(SignalKind::Error, room_id);
        signal.payload = Some(serde_json::json!({ "message": message.into() }));
        signal
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Inbound actions on a signaling socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalCommand {
    Join { username: Option<String> },
    Leave,
    Relay { target_id: UserId, signal: Signal },
    Unknown(String),
}

impl SignalCommand {
    pub fn decode(signal: Signal) -> Result<Self, ProtocolError> {
        if signal.kind.is_relayed() {
            let target_id = signal
                .target_id
                .ok_or(ProtocolError::MissingField("target_id"))?;
            return Ok(Self::Relay { target_id, signal });
        }
        let command = match signal.kind {
            SignalKind::Join => Self::Join {
                username: signal.username,
            },
            SignalKind::Leave => Self::Leave,
            other => Self::Unknown(other.into()),
        };
        Ok(command)
    }
}
