//! WebSocket server module
//!
//! Accepts relay connections and routes messages between clients and the
//! group broker.

mod protocol;
mod session;
mod websocket;

pub use websocket::*;
