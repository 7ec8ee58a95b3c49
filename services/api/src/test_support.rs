//! In-memory collaborators and fixtures shared by the handler and WebSocket tests.

use crate::{
    config::{Config, IdentityVerification, Provider},
    state::AppState,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::json;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::Level;
use uuid::Uuid;
use voicedesk_core::{
    credential::{CredentialIssuer, JwtIdentityVerifier, LiveKitKeys},
    llm_client::{AgentReply, ContextEntry, ResponseGenerator},
    model::{InteractionSummary, NewInteractionSummary, ProfileUpdate, UserProfile, Utterance},
    registry::SessionRegistry,
    retrieval::{EmbeddingProvider, InMemoryKnowledgeStore, RetrievalEngine},
    runtime::{SessionServices, SessionSettings},
    tools::{ProfileStore, SummaryStore, ToolDispatcher, ToolSettings, ToolSpec},
};

pub const SECRET: &str = "identity-test-secret";
pub const AUDIENCE: &str = "voicedesk-test";
pub const ISSUER: &str = "https://securetoken.google.com/voicedesk-test";

pub fn assertion(sub: &str, exp_offset_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": sub,
        "name": "Test User",
        "email": format!("{sub}@example.com"),
        "aud": AUDIENCE,
        "iss": ISSUER,
        "iat": now - 10,
        "exp": now + exp_offset_secs,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgresql://unused".to_string(),
        provider: Provider::OpenAI,
        openai_api_key: Some("unused".to_string()),
        gemini_api_key: None,
        chat_model: "gpt-4o".to_string(),
        embedding_model: "text-embedding-3-small".to_string(),
        livekit_url: "ws://localhost:7880".to_string(),
        livekit_api_key: "devkey".to_string(),
        livekit_api_secret: "livekit-test-secret-that-is-long-enough".to_string(),
        identity_audience: AUDIENCE.to_string(),
        identity_issuer: ISSUER.to_string(),
        identity_verification: IdentityVerification::SharedSecret(SECRET.to_string()),
        similarity_threshold: 0.7,
        retrieval_top_k: 3,
        retrieval_max_top_k: 10,
        credential_ttl: Duration::from_secs(600),
        idle_timeout: Duration::from_secs(300),
        tool_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(5),
        log_level: Level::INFO,
        prompts_path: PathBuf::from("./prompts"),
    }
}

#[derive(Default)]
pub struct MemoryProfiles(Mutex<HashMap<String, UserProfile>>);

#[async_trait]
impl ProfileStore for MemoryProfiles {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.0.lock().await.get(user_id).cloned())
    }

    async fn upsert_profile(&self, update: ProfileUpdate) -> Result<UserProfile> {
        let mut profiles = self.0.lock().await;
        let now = Utc::now();
        let profile = profiles
            .entry(update.user_id.clone())
            .and_modify(|p| {
                p.email = update.email.clone();
                p.full_name = update.full_name.clone();
                p.updated_at = now;
            })
            .or_insert_with(|| UserProfile {
                user_id: update.user_id.clone(),
                email: update.email.clone(),
                full_name: update.full_name.clone(),
                subscription_tier: "free".to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(profile.clone())
    }
}

#[derive(Default)]
pub struct MemorySummaries(Mutex<Vec<InteractionSummary>>);

impl MemorySummaries {
    pub async fn count(&self) -> usize {
        self.0.lock().await.len()
    }
}

#[async_trait]
impl SummaryStore for MemorySummaries {
    async fn save_summary(&self, summary: NewInteractionSummary) -> Result<InteractionSummary> {
        let mut rows = self.0.lock().await;
        if let Some(existing) = rows
            .iter()
            .find(|s| s.session_id.is_some() && s.session_id == summary.session_id)
        {
            return Ok(existing.clone());
        }
        let saved = InteractionSummary {
            id: Uuid::new_v4(),
            user_id: summary.user_id,
            session_id: summary.session_id,
            summary: summary.summary,
            created_at: Utc::now(),
        };
        rows.push(saved.clone());
        Ok(saved)
    }

    async fn latest_summary(&self, user_id: &str) -> Result<Option<InteractionSummary>> {
        Ok(self
            .0
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.user_id == user_id)
            .cloned())
    }
}

/// Echoes the last user utterance back.
pub struct EchoGenerator;

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn respond(&self, context: &[ContextEntry], _tools: &[ToolSpec]) -> Result<AgentReply> {
        let last = context.iter().rev().find_map(|entry| match entry {
            ContextEntry::Utterance(u) => Some(u.text.clone()),
            _ => None,
        });
        Ok(AgentReply::Answer(format!(
            "You said: {}",
            last.unwrap_or_default()
        )))
    }

    async fn summarize(&self, transcript: &[Utterance]) -> Result<String> {
        Ok(format!("Conversation of {} utterances.", transcript.len()))
    }
}

struct ZeroEmbedder;

#[async_trait]
impl EmbeddingProvider for ZeroEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

pub struct Fixture {
    pub state: Arc<AppState>,
    pub profiles: Arc<MemoryProfiles>,
    pub summaries: Arc<MemorySummaries>,
}

pub fn fixture() -> Fixture {
    let config = config();
    let profiles = Arc::new(MemoryProfiles::default());
    let summaries = Arc::new(MemorySummaries::default());
    let registry = Arc::new(SessionRegistry::new());
    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::new(ZeroEmbedder),
        Arc::new(InMemoryKnowledgeStore::new()),
        config.tool_timeout,
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(
        profiles.clone(),
        summaries.clone(),
        retrieval,
        ToolSettings::default(),
    ));
    let issuer = Arc::new(CredentialIssuer::new(
        Arc::new(JwtIdentityVerifier::with_shared_secret(
            SECRET.as_bytes(),
            AUDIENCE,
            ISSUER,
        )),
        LiveKitKeys {
            api_key: config.livekit_api_key.clone(),
            api_secret: config.livekit_api_secret.clone(),
        },
        config.credential_ttl,
    ));

    let state = Arc::new(AppState {
        issuer,
        registry: registry.clone(),
        services: SessionServices {
            generator: Arc::new(EchoGenerator),
            dispatcher,
            summaries: summaries.clone(),
            registry,
        },
        session_settings: SessionSettings::default(),
        profiles: profiles.clone(),
        config: Arc::new(config),
    });

    Fixture {
        state,
        profiles,
        summaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_summary_for_a_session_returns_the_stored_row() {
        let summaries = MemorySummaries::default();
        let new = |text: &str| NewInteractionSummary {
            user_id: "u123".to_string(),
            session_id: Some("session-1".to_string()),
            summary: text.to_string(),
        };
        let first = summaries.save_summary(new("Asked about refunds.")).await.unwrap();
        let again = summaries.save_summary(new("Retried write.")).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.summary, "Asked about refunds.");
        assert_eq!(summaries.count().await, 1);
    }
}
