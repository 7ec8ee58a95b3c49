//! VoiceDesk API Library Crate
//!
//! This library contains the web-facing half of the voice support agent:
//! configuration, database access, credential and profile handlers, the room
//! WebSocket bridge, and routing. The binaries are thin wrappers around it.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;

#[cfg(test)]
mod test_support;
