//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the credential issuer and the session registry.

use crate::config::Config;
use std::sync::Arc;
use voicedesk_core::{
    credential::CredentialIssuer,
    registry::SessionRegistry,
    runtime::{SessionServices, SessionSettings},
    tools::ProfileStore,
};

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub issuer: Arc<CredentialIssuer>,
    pub registry: Arc<SessionRegistry>,
    pub services: SessionServices,
    pub session_settings: SessionSettings,
    pub profiles: Arc<dyn ProfileStore>,
    pub config: Arc<Config>,
}
