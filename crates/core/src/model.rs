//! Domain records shared between the core and its storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dimensionality of knowledge embeddings (`text-embedding-3-small`).
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Durable account record keyed by the identity provider's subject id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub subscription_tier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller may write on their own profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub user_id: String,
    pub email: String,
    pub full_name: Option<String>,
}

/// The subset of a profile the agent may read back to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub email: String,
    pub full_name: Option<String>,
    pub subscription_tier: String,
}

impl From<UserProfile> for AccountSummary {
    fn from(profile: UserProfile) -> Self {
        Self {
            email: profile.email,
            full_name: profile.full_name,
            subscription_tier: profile.subscription_tier,
        }
    }
}

/// A retrievable unit of reference text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub source_url: Option<String>,
}

/// A knowledge entry paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub similarity: f32,
}

/// An article awaiting embedding and insertion by the ingestion step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKnowledgeArticle {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Durable record of one finished conversation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSummary {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInteractionSummary {
    pub user_id: String,
    pub session_id: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One entry of a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Utterance {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            at: Utc::now(),
        }
    }
}
