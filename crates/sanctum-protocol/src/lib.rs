//! Wire types for Sanctum realtime sockets.
//!
//! Every socket frame and every pub/sub payload is a JSON object shaped like
//!
//! ```text
//! { "type": string, "room_id"?: ..., "user_id"?: uint, "target_id"?: uint, "payload": any }
//! ```
//!
//! The `type` field is decoded into a closed enum per hub. Values the server
//! does not know survive decoding as an `Other` variant so they can be logged
//! and dropped instead of failing the whole frame.

/// Declares a `type` discriminator enum that round-trips through its wire string.
///
/// Unrecognised strings decode into `Other(String)`.
macro_rules! wire_kind {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A type string this server does not understand.
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $wire, )+
                    Self::Other(other) => other.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $( $wire => Self::$variant, )+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(other) => other,
                    known => known.as_str().to_string(),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use wire_kind;

pub mod chat;
pub mod event;
pub mod game;
pub mod signal;

use thiserror::Error;

pub use chat::{ChatCommand, ChatKind, ChatMessage};
pub use event::RealtimeEvent;
pub use game::{GameAction, GameActionKind, GameCommand, Move};
pub use signal::{PeerSummary, Signal, SignalCommand, SignalKind};

pub type UserId = u64;
pub type RoomId = u64;
pub type ConversationId = u64;

/// Errors raised while turning a decoded envelope into a command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("missing field {0}")]
    MissingField(&'static str),
}
