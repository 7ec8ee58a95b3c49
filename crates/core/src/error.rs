//! Error Taxonomy
//!
//! Every failure the orchestration core reports to its callers is one of the
//! enums below. Collaborator traits return `anyhow::Result`; the core maps
//! those into this taxonomy at the module boundary so that callers can decide
//! on retries and user-facing behavior by variant.

use serde::Serialize;
use thiserror::Error;

/// Failures of the credential issuer and of credential verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Signature mismatch, wrong audience/issuer, malformed token.
    #[error("identity assertion is invalid: {0}")]
    InvalidAssertion(String),
    #[error("identity assertion has expired")]
    Expired,
    /// The identity provider's verification keys could not be obtained.
    #[error("identity provider keys are unavailable: {0}")]
    KeysUnavailable(String),
    #[error("invalid credential request: {0}")]
    InvalidRequest(String),
    #[error("failed to mint session credential: {0}")]
    Minting(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a session is already registered for room '{0}'")]
    DuplicateRoom(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("embedding capability is unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("retrieval timed out")]
    Timeout,
    #[error("query text is empty")]
    EmptyQuery,
    #[error("knowledge store query failed: {0}")]
    Store(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    #[error("tool call timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Backend(String),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

impl ToolError {
    /// Transient failures are retried once by the calling session step.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::PersistenceFailed(_)
                | ToolError::Timeout
                | ToolError::Retrieval(RetrievalError::Timeout)
        )
    }

    /// Stable machine-readable kind, fed back to the response generator.
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            ToolError::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::PersistenceFailed(_) => ToolErrorKind::PersistenceFailed,
            ToolError::Timeout | ToolError::Retrieval(RetrievalError::Timeout) => {
                ToolErrorKind::Timeout
            }
            ToolError::Backend(_) | ToolError::Retrieval(_) => ToolErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArguments,
    UnknownTool,
    NotFound,
    PersistenceFailed,
    Timeout,
    Unavailable,
}
