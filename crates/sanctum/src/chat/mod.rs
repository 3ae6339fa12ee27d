//! Chat sockets: per-user connections, conversation fan-out and mentions.

mod hub;
mod mentions;

pub use hub::{ChatHub, ChatSocket, ConversationDirectory, OpenDirectory};
pub use mentions::{Participant, extract_mentions, resolve_mentions};
