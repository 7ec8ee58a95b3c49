use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use voicedesk_core::credential::DEFAULT_JWKS_URL;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backends for response generation and embeddings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// How identity assertions are verified.
#[derive(Clone, PartialEq, Eq)]
pub enum IdentityVerification {
    /// RS256 against the identity provider's published keys.
    Jwks { url: String },
    /// HS256 with a shared secret, for local development.
    SharedSecret(String),
}

impl fmt::Debug for IdentityVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jwks { url } => f.debug_struct("Jwks").field("url", url).finish(),
            Self::SharedSecret(_) => f.write_str("SharedSecret([REDACTED])"),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub livekit_url: String,
    pub livekit_api_key: String,
    pub livekit_api_secret: String,
    pub identity_audience: String,
    pub identity_issuer: String,
    pub identity_verification: IdentityVerification,
    pub similarity_threshold: f32,
    pub retrieval_top_k: usize,
    pub retrieval_max_top_k: usize,
    pub credential_ttl: Duration,
    pub idle_timeout: Duration,
    pub tool_timeout: Duration,
    pub response_timeout: Duration,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("provider", &self.provider)
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .field("livekit_url", &self.livekit_url)
            .field("livekit_api_key", &self.livekit_api_key)
            .field("identity_audience", &self.identity_audience)
            .field("identity_issuer", &self.identity_issuer)
            .field("identity_verification", &self.identity_verification)
            .field("similarity_threshold", &self.similarity_threshold)
            .field("retrieval_top_k", &self.retrieval_top_k)
            .field("retrieval_max_top_k", &self.retrieval_max_top_k)
            .field("credential_ttl", &self.credential_ttl)
            .field("idle_timeout", &self.idle_timeout)
            .field("tool_timeout", &self.tool_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("log_level", &self.log_level)
            .field("prompts_path", &self.prompts_path)
            .finish_non_exhaustive()
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn parsed<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn seconds(name: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = parsed(name, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = required("DATABASE_URL")?;

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{other}' is not one of 'openai', 'gemini'"),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let livekit_url =
            std::env::var("LIVEKIT_URL").unwrap_or_else(|_| "ws://localhost:7880".to_string());
        let livekit_api_key = required("LIVEKIT_API_KEY")?;
        let livekit_api_secret = required("LIVEKIT_API_SECRET")?;

        let identity_audience = required("IDENTITY_AUDIENCE")?;
        let identity_issuer = std::env::var("IDENTITY_ISSUER")
            .unwrap_or_else(|_| format!("https://securetoken.google.com/{identity_audience}"));
        let identity_verification = match std::env::var("IDENTITY_SHARED_SECRET") {
            Ok(secret) if !secret.is_empty() => IdentityVerification::SharedSecret(secret),
            _ => IdentityVerification::Jwks {
                url: std::env::var("IDENTITY_JWKS_URL")
                    .unwrap_or_else(|_| DEFAULT_JWKS_URL.to_string()),
            },
        };

        let similarity_threshold: f32 = parsed("SIMILARITY_THRESHOLD", 0.7)?;
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::InvalidValue(
                "SIMILARITY_THRESHOLD".to_string(),
                format!("{similarity_threshold} is outside [-1, 1]"),
            ));
        }
        let retrieval_top_k: usize = parsed("RETRIEVAL_TOP_K", 3)?;
        let retrieval_max_top_k: usize = parsed("RETRIEVAL_MAX_TOP_K", 10)?;
        if retrieval_top_k == 0 || retrieval_top_k > retrieval_max_top_k {
            return Err(ConfigError::InvalidValue(
                "RETRIEVAL_TOP_K".to_string(),
                format!("must be between 1 and RETRIEVAL_MAX_TOP_K ({retrieval_max_top_k})"),
            ));
        }

        let credential_ttl = seconds("CREDENTIAL_TTL_SECS", 600)?;
        if credential_ttl > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidValue(
                "CREDENTIAL_TTL_SECS".to_string(),
                "session credentials must not outlive one hour".to_string(),
            ));
        }
        let idle_timeout = seconds("IDLE_TIMEOUT_SECS", 300)?;
        let tool_timeout = seconds("TOOL_TIMEOUT_SECS", 10)?;
        let response_timeout = seconds("RESPONSE_TIMEOUT_SECS", 30)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            embedding_model,
            livekit_url,
            livekit_api_key,
            livekit_api_secret,
            identity_audience,
            identity_issuer,
            identity_verification,
            similarity_threshold,
            retrieval_top_k,
            retrieval_max_top_k,
            credential_ttl,
            idle_timeout,
            tool_timeout,
            response_timeout,
            log_level,
            prompts_path,
        })
    }

    /// The active provider's API key. Presence is checked by `from_env`.
    pub fn provider_api_key(&self) -> &str {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref().unwrap_or_default(),
            Provider::Gemini => self.gemini_api_key.as_deref().unwrap_or_default(),
        }
    }

    /// The OpenAI-compatible base URL of the active provider.
    pub fn provider_api_base(&self) -> &'static str {
        match self.provider {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}
