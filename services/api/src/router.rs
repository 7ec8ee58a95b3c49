//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the room WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ActiveSession, ErrorResponse, Profile, TokenRequest, TokenResponse, UpdateProfilePayload,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::issue_token,
        handlers::get_profile,
        handlers::update_profile,
        handlers::list_sessions,
        handlers::get_session,
        handlers::end_session,
    ),
    components(
        schemas(TokenRequest, TokenResponse, Profile, UpdateProfilePayload, ActiveSession, ErrorResponse)
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "VoiceDesk API", description = "Credentials, profiles and live sessions for the voice support agent")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/token", post(handlers::issue_token))
        .route(
            "/profile",
            get(handlers::get_profile).put(handlers::update_profile),
        )
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{room_id}", get(handlers::get_session))
        .route("/sessions/{room_id}/end", post(handlers::end_session))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
