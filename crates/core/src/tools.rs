//! Tool Dispatcher
//!
//! Maps a function call requested by the agent onto a backend operation.
//! Arguments arrive as loosely-typed JSON and are validated against a typed
//! schema per tool before any backend is touched. Identity-sensitive tools
//! never read the subject from the arguments: the caller's subject is bound
//! from the active session through [`CallContext`].

use crate::{
    error::ToolError,
    model::{
        AccountSummary, InteractionSummary, NewInteractionSummary, ProfileUpdate, ScoredEntry,
        UserProfile,
    },
    retrieval::RetrievalEngine,
};
use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const GET_USER_ACCOUNT_INFO: &str = "get_user_account_info";
pub const ANSWER_FROM_COMPANY_KB: &str = "answer_from_company_kb";
pub const SUMMARIZE_INTERACTION: &str = "summarize_interaction_for_next_session";

/// Read/write access to user profiles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn upsert_profile(&self, update: ProfileUpdate) -> Result<UserProfile>;
}

/// Append-only storage for interaction summaries.
///
/// Saving is idempotent per `session_id`: saving again for a session that
/// already has a summary returns the stored row instead of adding one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn save_summary(&self, summary: NewInteractionSummary) -> Result<InteractionSummary>;
    async fn latest_summary(&self, user_id: &str) -> Result<Option<InteractionSummary>>;
}

/// Guards the at-most-once Interaction Summary of a session.
///
/// Both the summarize tool and session teardown must claim the latch before
/// writing. The claim is released unless the write is confirmed, including
/// when the writing future is dropped by a timeout.
#[derive(Debug, Default)]
pub struct SummaryLatch(AtomicBool);

impl SummaryLatch {
    pub fn claim(&self) -> Option<LatchClaim<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchClaim {
                latch: self,
                confirmed: false,
            })
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A held claim on a [`SummaryLatch`]. Dropping it without [`confirm`]
/// releases the latch.
///
/// [`confirm`]: LatchClaim::confirm
#[derive(Debug)]
pub struct LatchClaim<'a> {
    latch: &'a SummaryLatch,
    confirmed: bool,
}

impl LatchClaim<'_> {
    /// Keeps the latch claimed for the rest of the session.
    pub fn confirm(mut self) {
        self.confirmed = true;
    }
}

impl Drop for LatchClaim<'_> {
    fn drop(&mut self) {
        if !self.confirmed {
            self.latch.0.store(false, Ordering::Release);
        }
    }
}

/// Identity of the session on whose behalf a tool runs.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub subject_id: String,
    pub session_id: Uuid,
    pub room_id: String,
    pub summary_latch: Arc<SummaryLatch>,
}

// --- Argument schemas ---

/// `get_user_account_info` takes no arguments; the account is always the caller's.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetUserAccountInfoArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnswerFromCompanyKbArgs {
    /// The user's question, phrased as a search query.
    pub query: String,
    /// Maximum number of articles to return.
    #[serde(default)]
    pub top_k: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SummarizeInteractionArgs {
    /// A brief summary of the key points and outcomes of the conversation.
    #[serde(alias = "interaction_summary")]
    pub summary_text: String,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    GetUserAccountInfo,
    AnswerFromCompanyKb { query: String, top_k: Option<usize> },
    SummarizeInteraction { summary_text: String },
}

impl ToolInvocation {
    /// Validates `arguments` against the schema of `name`.
    ///
    /// A `top_k` above `max_top_k` is capped rather than rejected.
    pub fn parse(name: &str, arguments: &Value, max_top_k: usize) -> Result<Self, ToolError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => arguments.clone(),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "expected an object of arguments, got {other}"
                )));
            }
        };

        match name {
            GET_USER_ACCOUNT_INFO => {
                let _: GetUserAccountInfoArgs = from_arguments(arguments)?;
                Ok(Self::GetUserAccountInfo)
            }
            ANSWER_FROM_COMPANY_KB => {
                let args: AnswerFromCompanyKbArgs = from_arguments(arguments)?;
                let query = args.query.trim().to_string();
                if query.is_empty() {
                    return Err(ToolError::InvalidArguments("`query` is empty".to_string()));
                }
                let top_k = match args.top_k {
                    Some(0) => {
                        return Err(ToolError::InvalidArguments(
                            "`top_k` must be at least 1".to_string(),
                        ));
                    }
                    Some(k) => Some((k as usize).min(max_top_k)),
                    None => None,
                };
                Ok(Self::AnswerFromCompanyKb { query, top_k })
            }
            SUMMARIZE_INTERACTION => {
                let args: SummarizeInteractionArgs = from_arguments(arguments)?;
                let summary_text = args.summary_text.trim().to_string();
                if summary_text.is_empty() {
                    return Err(ToolError::InvalidArguments(
                        "`summary_text` is empty".to_string(),
                    ));
                }
                Ok(Self::SummarizeInteraction { summary_text })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn from_arguments<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// A tool declaration handed to the response generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Declarations for every tool the dispatcher accepts.
pub fn tool_specs() -> Vec<ToolSpec> {
    fn spec<T: JsonSchema>(name: &str, description: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::to_value(schemars::schema_for!(T))
                .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
        }
    }

    vec![
        spec::<GetUserAccountInfoArgs>(
            GET_USER_ACCOUNT_INFO,
            "Look up the caller's own account: email, name and subscription tier.",
        ),
        spec::<AnswerFromCompanyKbArgs>(
            ANSWER_FROM_COMPANY_KB,
            "Search the company knowledge base for articles answering a question about the company, its products, FAQs or how-to guides.",
        ),
        spec::<SummarizeInteractionArgs>(
            SUMMARIZE_INTERACTION,
            "Save a short summary of this conversation so the next session can pick up where it left off.",
        ),
    ]
}

/// A knowledge match as returned to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeHit {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub source_url: Option<String>,
    pub similarity: f32,
}

impl From<ScoredEntry> for KnowledgeHit {
    fn from(scored: ScoredEntry) -> Self {
        let entry = scored.entry;
        Self {
            id: entry.id,
            title: entry.title,
            content: entry.content,
            category: entry.category,
            tags: entry.tags,
            source_url: entry.source_url,
            similarity: scored.similarity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    AccountInfo { account: AccountSummary },
    KnowledgeMatches { matches: Vec<KnowledgeHit> },
    SummarySaved { summary_id: Uuid },
    SummaryAlreadyRecorded,
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub similarity_threshold: f32,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub timeout: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            default_top_k: 3,
            max_top_k: 10,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct ToolDispatcher {
    profiles: Arc<dyn ProfileStore>,
    summaries: Arc<dyn SummaryStore>,
    retrieval: Arc<RetrievalEngine>,
    settings: ToolSettings,
}

impl ToolDispatcher {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        summaries: Arc<dyn SummaryStore>,
        retrieval: Arc<RetrievalEngine>,
        settings: ToolSettings,
    ) -> Self {
        Self {
            profiles,
            summaries,
            retrieval,
            settings,
        }
    }

    /// Validates and executes one tool call for the session in `ctx`.
    ///
    /// Validation failures return before any backend call. The backend call
    /// is bounded by the configured timeout.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        name: &str,
        arguments: &Value,
    ) -> Result<ToolOutput, ToolError> {
        let invocation = match ToolInvocation::parse(name, arguments, self.settings.max_top_k) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(tool = %name, error = %e, "Rejected tool call");
                return Err(e);
            }
        };

        info!(tool = %name, subject_id = %ctx.subject_id, "Dispatching tool call");
        tokio::time::timeout(self.settings.timeout, self.execute(ctx, invocation))
            .await
            .unwrap_or_else(|_| {
                warn!(tool = %name, "Tool call timed out");
                Err(ToolError::Timeout)
            })
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        invocation: ToolInvocation,
    ) -> Result<ToolOutput, ToolError> {
        match invocation {
            ToolInvocation::GetUserAccountInfo => {
                let profile = self
                    .profiles
                    .get_profile(&ctx.subject_id)
                    .await
                    .map_err(|e| {
                        error!(error = ?e, subject_id = %ctx.subject_id, "Profile lookup failed");
                        ToolError::Backend(e.to_string())
                    })?
                    .ok_or_else(|| {
                        ToolError::NotFound(format!("no profile for subject '{}'", ctx.subject_id))
                    })?;
                Ok(ToolOutput::AccountInfo {
                    account: profile.into(),
                })
            }
            ToolInvocation::AnswerFromCompanyKb { query, top_k } => {
                let top_k = top_k.unwrap_or(self.settings.default_top_k);
                let matches = self
                    .retrieval
                    .retrieve(&query, self.settings.similarity_threshold, top_k)
                    .await?;
                Ok(ToolOutput::KnowledgeMatches {
                    matches: matches.into_iter().map(KnowledgeHit::from).collect(),
                })
            }
            ToolInvocation::SummarizeInteraction { summary_text } => {
                let Some(claim) = ctx.summary_latch.claim() else {
                    info!(session_id = %ctx.session_id, "Summary already recorded for this session");
                    return Ok(ToolOutput::SummaryAlreadyRecorded);
                };
                let saved = self
                    .summaries
                    .save_summary(NewInteractionSummary {
                        user_id: ctx.subject_id.clone(),
                        session_id: Some(ctx.session_id.to_string()),
                        summary: summary_text,
                    })
                    .await;
                match saved {
                    Ok(summary) => {
                        claim.confirm();
                        info!(summary_id = %summary.id, session_id = %ctx.session_id, "Interaction summary saved");
                        Ok(ToolOutput::SummarySaved {
                            summary_id: summary.id,
                        })
                    }
                    Err(e) => {
                        error!(error = ?e, session_id = %ctx.session_id, "Failed to save interaction summary");
                        Err(ToolError::PersistenceFailed(e.to_string()))
                    }
                }
            }
        }
    }
}
