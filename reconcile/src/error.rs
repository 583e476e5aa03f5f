//! Error types for the reconciliation engine

use crate::record::LocalId;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Which snapshot a structural error was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    External,
    Local,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::External => write!(f, "external"),
            Side::Local => write!(f, "local"),
        }
    }
}

/// Errors that abort a whole reconciliation run.
///
/// Per-record apply problems never show up here; they are recorded in the
/// [`ReconciliationReport`](crate::report::ReconciliationReport) instead.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Natural key missing, empty or whitespace-only
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Two records in one snapshot normalize to the same key
    #[error("Duplicate key '{key}' in {side} snapshot")]
    DuplicateKey { key: String, side: Side },

    /// Permanent failure fetching the external snapshot
    #[error("Fetch failed: {0}")]
    Fetch(FetchError),

    /// Transient fetch failures outlasted the retry budget
    #[error("Fetch failed after {attempts} attempts: {last_error}")]
    FetchExhausted { attempts: u32, last_error: FetchError },

    /// Loading the local snapshot failed
    #[error("Loading local snapshot failed: {0}")]
    Load(#[source] StoreError),

    /// Run was cancelled before any operation was applied
    #[error("Reconciliation was cancelled")]
    Cancelled,

    /// Another run holds the lock for this domain
    #[error("Reconciliation already running for domain '{domain}'")]
    AlreadyRunning { domain: String },

    /// Engine configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Illegal run stage transition
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Create a new invalid key error
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create a new duplicate key error
    pub fn duplicate_key(key: impl Into<String>, side: Side) -> Self {
        Self::DuplicateKey {
            key: key.into(),
            side,
        }
    }

    /// Whether the error was caused by the input data rather than a collaborator
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::InvalidKey { .. } | Self::DuplicateKey { .. })
    }
}

/// Failure reported by an external source.
///
/// Sources classify their own failures: network and timeout classes are
/// transient, authentication and malformed responses are permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub transient: bool,
    pub message: String,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.transient
    }
}

/// Failure reported by the local store for a single call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(LocalId),

    /// Constraint violation, e.g. a second record with the same natural key
    #[error("Constraint violation: {0}")]
    Conflict(String),

    /// Store temporarily unreachable or timed out
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Other(String),
}
