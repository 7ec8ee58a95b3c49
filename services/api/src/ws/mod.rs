//! WebSocket Room Transport
//!
//! - `protocol`: the JSON message format exchanged with the room transport.
//! - `session`: the connection lifecycle, from `join` to the session's close.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
