//! WebSocket plumbing shared by every hub.

mod connection;
pub mod pump;
mod registry;

pub use connection::{Connection, ConnectionId, Frame, SendOutcome};
pub use pump::{ConnectionOwner, InboundHandler, PumpConfig, PumpExit};
pub use registry::ScopedRegistry;
pub(crate) use registry::{read, write};
