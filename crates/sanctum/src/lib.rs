//! Sanctum realtime core.
//!
//! Hubs for chat, two-player games and WebRTC signaling, the websocket pump
//! they share, and the pub/sub wiring that lets several server instances act
//! as one.

pub mod api;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod game;
pub mod notify;
pub mod signal;
pub mod ws;
