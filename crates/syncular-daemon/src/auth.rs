//! Authentication boundary.
//!
//! The daemon consumes an [`Authenticator`]; the built-in implementation
//! verifies bearer tokens against the API-key table by SHA-256 hash. Key
//! secrets exist only at creation/rotation time and are never stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use syncular_db::Storage;
use syncular_schemas::{ApiKey, ApiKeyType, Principal, SyncError};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` means the token is unknown or unusable.
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>>;
}

/// Extract the bearer token and resolve it, mapping every miss to 401.
pub async fn require_principal(
    authenticator: &Arc<dyn Authenticator>,
    headers: &HeaderMap,
) -> Result<Principal, SyncError> {
    let token = bearer_token(headers).ok_or_else(SyncError::unauthenticated)?;
    match authenticator.authenticate(token).await {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => Err(SyncError::new(
            syncular_schemas::ErrorCode::InvalidToken,
            "unknown or revoked token",
        )),
        Err(e) => {
            warn!(error = %e, "authenticator failure");
            Err(SyncError::internal("authentication backend unavailable"))
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ---------------------------------------------------------------------------
// API-key backed authenticator
// ---------------------------------------------------------------------------

pub struct ApiKeyAuthenticator {
    storage: Arc<dyn Storage>,
}

impl ApiKeyAuthenticator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>> {
        let hash = hash_secret(token);
        let Some(key) = self.storage.get_api_key_by_hash(&hash).await? else {
            return Ok(None);
        };
        if !key.is_usable(Utc::now()) {
            return Ok(None);
        }

        // Best-effort usage stamp, off the auth path.
        {
            let storage = Arc::clone(&self.storage);
            let key_id = key.key_id;
            tokio::spawn(async move {
                if let Err(e) = storage.touch_api_key_last_used(key_id, Utc::now()).await {
                    warn!(error = %e, "last_used_at update failed");
                }
            });
        }

        Ok(Some(principal_for(&key)))
    }
}

fn principal_for(key: &ApiKey) -> Principal {
    Principal {
        actor_id: key
            .actor_id
            .clone()
            .unwrap_or_else(|| format!("key:{}", key.key_id)),
        key_type: key.key_type,
        // Admin keys are unrestricted regardless of stored keys.
        scope_keys: match key.key_type {
            ApiKeyType::Admin => Vec::new(),
            _ => key.scope_keys.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// Static-token authenticator (dev + tests)
// ---------------------------------------------------------------------------

/// Fixed token → principal table, for development and in-process tests.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: BTreeMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>> {
        Ok(self.tokens.get(token).cloned())
    }
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

pub struct GeneratedKey {
    pub secret: String,
    pub key_hash: String,
    pub key_prefix: String,
}

/// Mint a new key secret. The caller stores hash + prefix and returns the
/// secret to the operator exactly once.
pub fn generate_key() -> GeneratedKey {
    let secret = format!(
        "syk_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    GeneratedKey {
        key_hash: hash_secret(&secret),
        key_prefix: secret.chars().take(12).collect(),
        secret,
    }
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
