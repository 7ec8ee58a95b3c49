//! Axum Handlers for the REST API
//!
//! Credential issuance, the caller's own profile, and operational views of
//! the session registry. Uses `utoipa` doc comments to generate OpenAPI
//! documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};
use voicedesk_core::{
    credential::VerifiedIdentity,
    error::{AuthError, RegistryError},
    model::ProfileUpdate,
};

use crate::{
    models::{
        ActiveSession, ErrorResponse, Profile, TokenRequest, TokenResponse, UpdateProfilePayload,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::ServiceUnavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidAssertion(_) | AuthError::Expired => {
                Self::Unauthorized(err.to_string())
            }
            AuthError::InvalidRequest(_) => Self::BadRequest(err.to_string()),
            AuthError::KeysUnavailable(_) => {
                warn!(error = %err, "Identity provider keys unavailable");
                Self::ServiceUnavailable("identity verification is temporarily unavailable".into())
            }
            AuthError::Minting(_) => Self::InternalServerError(err.into()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::Conflict(err.to_string())
    }
}

/// Extracts the identity assertion from an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("a bearer identity assertion is required".into()))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<VerifiedIdentity, ApiError> {
    let assertion = bearer_token(headers)?;
    Ok(state.issuer.verify_identity(assertion).await?)
}

/// Issue a session credential for a real-time room.
#[utoipa::path(
    post,
    path = "/token",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Credential issued", body = TokenResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 401, description = "Identity assertion invalid or expired", body = ErrorResponse),
        (status = 503, description = "Identity provider keys unavailable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let credential = state
        .issuer
        .issue(
            &payload.identity_assertion,
            &payload.room_name,
            payload.participant_label.as_deref(),
        )
        .await?;

    Ok(Json(TokenResponse {
        session_credential: credential.token,
        room_name: credential.room_id,
        user_id: credential.subject_id,
        participant_label: credential.participant_label,
        expires_at: credential.expires_at,
        server_url: state.config.livekit_url.clone(),
    }))
}

/// Get the caller's own profile.
#[utoipa::path(
    get,
    path = "/profile",
    responses(
        (status = 200, description = "Profile of the authenticated user", body = Profile),
        (status = 401, description = "Missing or invalid identity assertion", body = ErrorResponse),
        (status = 404, description = "No profile exists yet", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Profile>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let profile = state
        .profiles
        .get_profile(&identity.subject_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("no profile for this user".to_string()))?;
    Ok(Json(profile.into()))
}

/// Create or update the caller's own profile.
#[utoipa::path(
    put,
    path = "/profile",
    request_body = UpdateProfilePayload,
    responses(
        (status = 200, description = "Profile saved", body = Profile),
        (status = 400, description = "No email available", body = ErrorResponse),
        (status = 401, description = "Missing or invalid identity assertion", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfilePayload>,
) -> Result<Json<Profile>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let email = payload
        .email
        .filter(|e| !e.trim().is_empty())
        .or(identity.email)
        .ok_or_else(|| ApiError::BadRequest("an email address is required".to_string()))?;

    let profile = state
        .profiles
        .upsert_profile(ProfileUpdate {
            user_id: identity.subject_id,
            email,
            full_name: payload.full_name,
        })
        .await?;
    info!(user_id = %profile.user_id, "Profile saved");
    Ok(Json(profile.into()))
}

/// List the sessions currently registered on this instance.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Active sessions", body = [ActiveSession])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<ActiveSession>> {
    let sessions = state.registry.list().await;
    Json(sessions.into_iter().map(ActiveSession::from).collect())
}

/// Look up the active session of a room.
#[utoipa::path(
    get,
    path = "/sessions/{room_id}",
    responses(
        (status = 200, description = "Session details", body = ActiveSession),
        (status = 404, description = "No active session in this room", body = ErrorResponse)
    ),
    params(
        ("room_id" = String, Path, description = "Room identifier")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<ActiveSession>, ApiError> {
    let handle = state
        .registry
        .lookup(&room_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No active session in room '{room_id}'")))?;
    Ok(Json(handle.into()))
}

/// End the active session of a room, as if the caller hung up.
#[utoipa::path(
    post,
    path = "/sessions/{room_id}/end",
    responses(
        (status = 202, description = "End of call delivered to the session"),
        (status = 404, description = "No active session in this room", body = ErrorResponse)
    ),
    params(
        ("room_id" = String, Path, description = "Room identifier")
    )
)]
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .registry
        .lookup(&room_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No active session in room '{room_id}'")))?;
    if !handle.end_call().await {
        // The runtime already stopped; drop the stale entry.
        state.registry.unregister_if(&room_id, handle.session_id).await;
        return Err(ApiError::NotFound(format!(
            "No active session in room '{room_id}'"
        )));
    }
    info!(room_id = %room_id, "End of call requested");
    Ok(StatusCode::ACCEPTED)
}
