//! API and Database Models
//!
//! Request/response bodies for the HTTP API (documented with `utoipa`) and the
//! row types `sqlx` maps query results onto.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use voicedesk_core::{
    model::{InteractionSummary, KnowledgeEntry, ScoredEntry, UserProfile},
    runtime::SessionHandle,
};

// --- Credential issuance ---

#[derive(Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Identity assertion issued by the identity provider.
    #[serde(alias = "identity_assertion")]
    pub identity_assertion: String,
    #[serde(alias = "room_name")]
    #[schema(example = "assistant-room-u123")]
    pub room_name: String,
    /// Display name in the room; defaults to the assertion's name.
    #[serde(default, alias = "participant_label")]
    #[schema(example = "Ada")]
    pub participant_label: Option<String>,
}

#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub session_credential: String,
    pub room_name: String,
    pub user_id: String,
    pub participant_label: String,
    pub expires_at: DateTime<Utc>,
    /// Real-time transport endpoint the client should connect to.
    pub server_url: String,
}

// --- Sessions ---

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub room_id: String,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<SessionHandle> for ActiveSession {
    fn from(handle: SessionHandle) -> Self {
        Self {
            room_id: handle.room_id,
            session_id: handle.session_id,
            user_id: handle.subject_id,
            created_at: handle.created_at,
        }
    }
}

// --- Profiles ---

#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Profile {
    pub user_id: String,
    pub email: String,
    pub full_name: Option<String>,
    #[schema(example = "free")]
    pub subscription_tier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Profile> for UserProfile {
    fn from(row: Profile) -> Self {
        Self {
            user_id: row.user_id,
            email: row.email,
            full_name: row.full_name,
            subscription_tier: row.subscription_tier,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<UserProfile> for Profile {
    fn from(profile: UserProfile) -> Self {
        Self {
            user_id: profile.user_id,
            email: profile.email,
            full_name: profile.full_name,
            subscription_tier: profile.subscription_tier,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct UpdateProfilePayload {
    /// Defaults to the email claim of the identity assertion.
    #[serde(default)]
    #[schema(example = "ada@example.com")]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

// --- Storage rows ---

#[derive(FromRow, Debug)]
pub struct SummaryRow {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl From<SummaryRow> for InteractionSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            session_id: row.session_id,
            summary: row.summary,
            created_at: row.created_at,
        }
    }
}

/// A row returned by the `match_knowledge` SQL function.
#[derive(FromRow, Debug)]
pub struct KnowledgeMatchRow {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub source_url: Option<String>,
    pub similarity: f64,
}

impl From<KnowledgeMatchRow> for ScoredEntry {
    fn from(row: KnowledgeMatchRow) -> Self {
        Self {
            entry: KnowledgeEntry {
                id: row.id,
                title: row.title,
                content: row.content,
                category: row.category,
                tags: row.tags.unwrap_or_default(),
                source_url: row.source_url,
            },
            similarity: row.similarity as f32,
        }
    }
}
