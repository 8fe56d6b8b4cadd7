//! Credential verification
//!
//! This module authenticates inbound bearer credentials:
//! - Bearer token extraction from the supported header fields
//! - JWT parsing and signature verification (RS256 only)
//! - Signing-key resolution through an in-memory cache backed by a remote
//!   key-set endpoint, filled lazily and never evicted
//! - Identity extraction from the verified claims

use crate::permission::Permission;
use axum::http::{header, HeaderMap};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

/// Claim carrying the caller's username.
const CLAIM_USERNAME: &str = "cognito:username";
/// Claim carrying the caller's group memberships.
const CLAIM_GROUPS: &str = "cognito:groups";
/// Group entries of the form `p:<level>` encode the caller's permission.
const PERMISSION_GROUP_PREFIX: &str = "p:";

/// Timeout for remote key-set fetches.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The authenticated caller. Produced fresh per request; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Opaque caller id from the username claim. Empty for anonymous callers.
    pub id: String,
    pub permission: Permission,
}

impl Identity {
    /// The unauthenticated caller used when no valid credential is presented
    /// and the credential-requirement policy is off.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Credential verification failures. All are per-request and user-visible.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Extract the bearer credential from the request headers.
///
/// Supported fields, in fallback order: `Authorization: Bearer <jwt>`, then
/// `jwt: <jwt>` (header names are case-insensitive, so `JWT:` matches too).
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token);
            }
        }
    }

    headers
        .get("jwt")
        .and_then(|v| v.to_str().ok())
        .filter(|token| !token.is_empty())
}

/// Verifies bearer JWTs against a lazily-cached remote key set.
pub struct TokenVerifier {
    jwks_url: String,
    http: reqwest::Client,
    /// Key material by key id. Append-only: ids are merged in from the remote
    /// set and existing entries are never replaced or evicted.
    keys: RwLock<HashMap<String, Jwk>>,
}

impl TokenVerifier {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .expect("failed to build key-set HTTP client");

        Self {
            jwks_url: jwks_url.into(),
            http,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Verify a raw bearer token and produce the caller identity.
    ///
    /// The permission claim defaults to the unprivileged level when absent or
    /// unparsable; the username claim defaults to an empty id.
    pub async fn authenticate(&self, raw: &str) -> Result<Identity, AuthError> {
        if raw.split('.').count() != 3 {
            return Err(AuthError::MalformedCredential(
                "expected three dot-separated sections".to_string(),
            ));
        }

        let header = decode_header(raw).map_err(credential_error)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or_else(|| {
            AuthError::MalformedCredential("missing key id in header".to_string())
        })?;

        let jwk = self.resolve_key(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::UnknownSigningKey(format!("{kid}: {e}")))?;

        let validation = Validation::new(Algorithm::RS256);
        let token = decode::<Value>(raw, &key, &validation).map_err(credential_error)?;

        Ok(identity_from_claims(&token.claims))
    }

    /// Resolve key material for a key id.
    ///
    /// Fast path reads the cache under a shared lock. On a miss the full
    /// remote set is fetched once (no lock held across the fetch), merged,
    /// and the lookup retried exactly once. A fetch failure degrades to
    /// `UnknownSigningKey` for this request without poisoning the cache.
    async fn resolve_key(&self, kid: &str) -> Result<Jwk, AuthError> {
        if let Some(jwk) = self.keys.read().unwrap().get(kid).cloned() {
            return Ok(jwk);
        }

        let set = self
            .fetch_keys()
            .await
            .map_err(|e| AuthError::UnknownSigningKey(format!("{kid} (key-set fetch: {e})")))?;
        self.merge_keys(set);

        self.keys
            .read()
            .unwrap()
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownSigningKey(kid.to_string()))
    }

    async fn fetch_keys(&self) -> reqwest::Result<JwkSet> {
        self.http
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Merge a fetched key set into the cache, skipping key ids that are
    /// already present. Concurrent callers may both fetch; the re-check under
    /// the exclusive lock guarantees neither clobbers the other's entries.
    pub fn merge_keys(&self, set: JwkSet) {
        let mut keys = self.keys.write().unwrap();
        for jwk in set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            keys.entry(kid).or_insert(jwk);
        }
    }

    /// Number of cached signing keys.
    pub fn cached_keys(&self) -> usize {
        self.keys.read().unwrap().len()
    }
}

/// Map a jsonwebtoken error onto the credential-failure taxonomy.
fn credential_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::MalformedCredential(err.to_string()),
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::UnsupportedAlgorithm(err.to_string())
        }
        _ => AuthError::InvalidCredential(err.to_string()),
    }
}

fn identity_from_claims(claims: &Value) -> Identity {
    let id = claims
        .get(CLAIM_USERNAME)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let permission = claims
        .get(CLAIM_GROUPS)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|group| group.strip_prefix(PERMISSION_GROUP_PREFIX))
        .and_then(|level| level.parse::<u32>().ok())
        .map(Permission)
        .unwrap_or(Permission::UNVERIFIED);

    Identity { id, permission }
}
