//! Hosting layer: TCP listener, WebSocket upgrade and server tick.
//!
//! The pipeline itself never sees the accept side. This module owns the
//! listener and the upgrade handshake, then hands each upgraded socket to
//! the [`ConnectionRegistry`](crate::registry::ConnectionRegistry).

mod core;
mod listener;

pub use self::core::ConduitServer;
pub use self::listener::bind_listener;
