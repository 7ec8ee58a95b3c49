//! Session orchestration and retrieval-augmented tool calling for voice agents.
//!
//! The crate is transport-agnostic: the HTTP/WebSocket service feeds room
//! events into a [`runtime::SessionRuntime`] and relays its outputs.

pub mod credential;
pub mod error;
pub mod llm_client;
pub mod model;
pub mod registry;
pub mod retrieval;
pub mod runtime;
pub mod session;
pub mod tools;
