//! WebRTC signaling relay.

mod hub;

pub use hub::{SignalHub, SignalPeer, SignalSocket};
