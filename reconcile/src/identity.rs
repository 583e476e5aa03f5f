//! Identity matching between external and local records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Normalized natural key.
///
/// Two records with equal identity keys are the same logical entity,
/// whichever system they came from. Only constructed through [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw natural key: trim surrounding whitespace and case-fold.
///
/// Matching is exact on the normalized form; no fuzzy or partial matching.
pub fn normalize(raw: &str) -> Result<IdentityKey> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ReconcileError::invalid_key(if raw.is_empty() {
            "key is empty".to_string()
        } else {
            format!("key '{}' is whitespace only", raw.escape_debug())
        }));
    }
    Ok(IdentityKey(trimmed.to_lowercase()))
}
