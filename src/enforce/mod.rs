//! Parameter enforcement
//!
//! Stops a caller from impersonating another identity by supplying
//! identity-bearing fields in their own request. Three reserved field names
//! are rewritten to the authenticated caller's true values, in the URL query
//! string and in the top level of a JSON request body. Fields absent from
//! the original request are never injected; the rewrite corrects, it does
//! not add.

use crate::auth::Identity;
use crate::permission::role_name;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use thiserror::Error;

/// Reserved field: the caller's id.
pub const FIELD_USER_ID: &str = "acle_user_id";
/// Reserved field: the caller's raw permission value.
pub const FIELD_USER_LEVEL: &str = "acle_user_level";
/// Reserved field: the caller's resolved role name.
pub const FIELD_USER_LEVEL_STR: &str = "acle_user_level_str";

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("unable to parse request body for enforcement: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Rewrite reserved fields in a raw query string.
///
/// Parameter order and untouched parameters are preserved verbatim. Only
/// pairs that carry a value are rewritten.
pub fn enforce_query(query: &str, identity: &Identity) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut parts = Vec::new();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some((key, value)) if !value.is_empty() => {
                let rewritten = match key {
                    FIELD_USER_ID => {
                        Some(utf8_percent_encode(&identity.id, NON_ALPHANUMERIC).to_string())
                    }
                    FIELD_USER_LEVEL => Some(identity.permission.to_string()),
                    FIELD_USER_LEVEL_STR => Some(role_name(identity.permission).to_string()),
                    _ => None,
                };
                match rewritten {
                    Some(value) => parts.push(format!("{key}={value}")),
                    None => parts.push(pair.to_string()),
                }
            }
            _ => parts.push(pair.to_string()),
        }
    }

    parts.join("&")
}

/// Rewrite reserved fields in the top level of a JSON body.
///
/// Returns `None` when no reserved field was present, so the caller can pass
/// the original bytes through untouched instead of re-serializing.
pub fn enforce_json_body(
    body: &[u8],
    identity: &Identity,
) -> Result<Option<Vec<u8>>, EnforceError> {
    let mut parsed: serde_json::Map<String, Value> = serde_json::from_slice(body)?;

    let mut changed = false;
    if parsed.contains_key(FIELD_USER_ID) {
        parsed.insert(
            FIELD_USER_ID.to_string(),
            Value::String(identity.id.clone()),
        );
        changed = true;
    }
    if parsed.contains_key(FIELD_USER_LEVEL) {
        parsed.insert(
            FIELD_USER_LEVEL.to_string(),
            Value::from(identity.permission.0),
        );
        changed = true;
    }
    if parsed.contains_key(FIELD_USER_LEVEL_STR) {
        parsed.insert(
            FIELD_USER_LEVEL_STR.to_string(),
            Value::String(role_name(identity.permission).to_string()),
        );
        changed = true;
    }

    if !changed {
        return Ok(None);
    }

    Ok(Some(serde_json::to_vec(&parsed)?))
}
