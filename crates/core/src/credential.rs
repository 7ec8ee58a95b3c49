//! Credential Issuer
//!
//! Verifies identity assertions issued by the external identity provider and
//! mints short-lived, room-scoped LiveKit join tokens. Issuance is stateless:
//! nothing is stored, and a credential is only ever invalidated by expiry.

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind, jwk::JwkSet,
};
use livekit_api::access_token::{AccessToken, VideoGrants};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Public keys for the identity provider's RS256 ID tokens.
pub const DEFAULT_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
const MAX_ROOM_NAME_LEN: usize = 128;

/// The identity extracted from a verified assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub subject_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Verifies opaque identity assertions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, assertion: &str) -> Result<VerifiedIdentity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
}

enum KeySource {
    Shared(DecodingKey),
    Jwks {
        url: String,
        client: reqwest::Client,
        cache: RwLock<Option<CachedKeys>>,
    },
}

/// JWT-based verifier for identity assertions.
///
/// Production deployments use [`JwtIdentityVerifier::with_jwks`], which checks
/// RS256 signatures against the provider's published key set. Local
/// development and tests use a shared HS256 secret instead.
pub struct JwtIdentityVerifier {
    keys: KeySource,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn with_shared_secret(secret: &[u8], audience: &str, issuer: &str) -> Self {
        Self {
            keys: KeySource::Shared(DecodingKey::from_secret(secret)),
            validation: Self::validation(Algorithm::HS256, audience, issuer),
        }
    }

    pub fn with_jwks(url: impl Into<String>, audience: &str, issuer: &str) -> Self {
        Self {
            keys: KeySource::Jwks {
                url: url.into(),
                client: reqwest::Client::new(),
                cache: RwLock::new(None),
            },
            validation: Self::validation(Algorithm::RS256, audience, issuer),
        }
    }

    fn validation(algorithm: Algorithm, audience: &str, issuer: &str) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation
    }

    async fn decoding_key(&self, assertion: &str) -> Result<DecodingKey, AuthError> {
        let (url, client, cache) = match &self.keys {
            KeySource::Shared(key) => return Ok(key.clone()),
            KeySource::Jwks { url, client, cache } => (url, client, cache),
        };

        let header = decode_header(assertion).map_err(map_jwt_error)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidAssertion("missing key id".to_string()))?;

        {
            let cached = cache.read().await;
            if let Some(keys) = cached.as_ref() {
                if keys.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    if let Some(jwk) = keys.set.find(&kid) {
                        return DecodingKey::from_jwk(jwk).map_err(map_jwt_error);
                    }
                }
            }
        }

        // Unknown kid or stale cache: the provider may have rotated keys.
        debug!(%kid, "Refreshing identity provider key set");
        let set = fetch_jwks(client, url).await?;
        let key = set
            .find(&kid)
            .map(DecodingKey::from_jwk)
            .transpose()
            .map_err(map_jwt_error)?;
        *cache.write().await = Some(CachedKeys {
            set,
            fetched_at: Instant::now(),
        });
        key.ok_or_else(|| AuthError::InvalidAssertion(format!("unknown key id '{kid}'")))
    }
}

async fn fetch_jwks(client: &reqwest::Client, url: &str) -> Result<JwkSet, AuthError> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AuthError::KeysUnavailable(e.to_string()))?;
    response
        .json::<JwkSet>()
        .await
        .map_err(|e| AuthError::KeysUnavailable(e.to_string()))
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::InvalidAssertion(err.to_string()),
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, assertion: &str) -> Result<VerifiedIdentity, AuthError> {
        let key = self.decoding_key(assertion).await?;
        let data =
            decode::<AssertionClaims>(assertion, &key, &self.validation).map_err(map_jwt_error)?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidAssertion("empty subject".to_string()));
        }
        Ok(VerifiedIdentity {
            subject_id: claims.sub,
            name: claims.name.filter(|n| !n.trim().is_empty()),
            email: claims.email,
        })
    }
}

/// API key pair used to sign and verify LiveKit join tokens.
#[derive(Clone)]
pub struct LiveKitKeys {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for LiveKitKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitKeys")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaGrants {
    pub publish_audio: bool,
    pub subscribe_audio: bool,
}

/// A signed join token scoped to exactly one room and one subject.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCredential {
    pub token: String,
    pub room_id: String,
    pub subject_id: String,
    pub participant_label: String,
    pub grants: MediaGrants,
    pub expires_at: DateTime<Utc>,
}

/// The verified contents of a presented session credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialClaims {
    pub room_id: String,
    pub subject_id: String,
    pub participant_label: String,
    pub grants: MediaGrants,
}

#[derive(Debug, Deserialize)]
struct JoinTokenClaims {
    sub: String,
    #[serde(default)]
    name: String,
    video: JoinTokenGrants,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinTokenGrants {
    #[serde(default)]
    room: String,
    #[serde(default)]
    room_join: bool,
    #[serde(default)]
    can_publish: bool,
    #[serde(default)]
    can_subscribe: bool,
}

pub struct CredentialIssuer {
    verifier: Arc<dyn IdentityVerifier>,
    keys: LiveKitKeys,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, keys: LiveKitKeys, ttl: Duration) -> Self {
        Self {
            verifier,
            keys,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Verifies an identity assertion without minting anything.
    pub async fn verify_identity(&self, assertion: &str) -> Result<VerifiedIdentity, AuthError> {
        self.verifier.verify(assertion).await
    }

    /// Verifies `assertion` and mints a credential for `requested_room`.
    ///
    /// The subject is always taken from the verified assertion. The participant
    /// label is display-only and falls back to the assertion's name, then to
    /// the subject id.
    pub async fn issue(
        &self,
        assertion: &str,
        requested_room: &str,
        requested_label: Option<&str>,
    ) -> Result<SessionCredential, AuthError> {
        validate_room_name(requested_room)?;
        let identity = match self.verifier.verify(assertion).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(room_id = %requested_room, error = %e, "Rejected identity assertion");
                return Err(e);
            }
        };

        let participant_label = requested_label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .or_else(|| identity.name.clone())
            .unwrap_or_else(|| identity.subject_id.clone());

        let token = AccessToken::with_api_key(&self.keys.api_key, &self.keys.api_secret)
            .with_identity(&identity.subject_id)
            .with_name(&participant_label)
            .with_grants(VideoGrants {
                room_join: true,
                room: requested_room.to_string(),
                can_publish: true,
                can_subscribe: true,
                ..Default::default()
            })
            .with_ttl(self.ttl)
            .to_jwt()
            .map_err(|e| AuthError::Minting(e.to_string()))?;

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AuthError::Minting(e.to_string()))?;

        info!(
            subject_id = %identity.subject_id,
            room_id = %requested_room,
            ttl_secs = self.ttl.as_secs(),
            "Issued session credential"
        );

        Ok(SessionCredential {
            token,
            room_id: requested_room.to_string(),
            subject_id: identity.subject_id,
            participant_label,
            grants: MediaGrants {
                publish_audio: true,
                subscribe_audio: true,
            },
            expires_at: Utc::now() + ttl,
        })
    }

    /// Verifies a presented session credential and returns its scope.
    pub fn verify_credential(&self, token: &str) -> Result<CredentialClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.keys.api_key]);
        let key = DecodingKey::from_secret(self.keys.api_secret.as_bytes());

        let claims = decode::<JoinTokenClaims>(token, &key, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if !claims.video.room_join || claims.video.room.is_empty() {
            return Err(AuthError::InvalidAssertion(
                "credential does not grant a room join".to_string(),
            ));
        }

        Ok(CredentialClaims {
            room_id: claims.video.room,
            participant_label: if claims.name.is_empty() {
                claims.sub.clone()
            } else {
                claims.name
            },
            subject_id: claims.sub,
            grants: MediaGrants {
                publish_audio: claims.video.can_publish,
                subscribe_audio: claims.video.can_subscribe,
            },
        })
    }
}

fn validate_room_name(room: &str) -> Result<(), AuthError> {
    if room.trim().is_empty() {
        return Err(AuthError::InvalidRequest("room name is required".to_string()));
    }
    if room.len() > MAX_ROOM_NAME_LEN {
        return Err(AuthError::InvalidRequest("room name is too long".to_string()));
    }
    if !room
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AuthError::InvalidRequest(format!(
            "room name '{room}' contains unsupported characters"
        )));
    }
    Ok(())
}
