//! Crate-wide error taxonomy.
//!
//! Every variant carries an `ErrorCategory` so failure modes carry enough
//! metadata for monitoring and for the caller to decide whether to
//! retry, fall back, or surface the error.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category used for metrics and alerting routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A downstream dependency (profile service, sync endpoint, peer) is
    /// unreachable or erroring; never fatal to the pipeline.
    TransientDependency,
    /// The caller-supplied input is malformed and rejected outright.
    PermanentInput,
    /// A ruleset or config file failed validation; previous state retained.
    PolicyInvalid,
    /// A cryptographic integrity check failed (HMAC, AEAD tag).
    Integrity,
    /// A bounded resource (queue, pool) is exhausted.
    ResourceExhausted,
    /// Cryptographic key material could not be derived or is missing.
    CryptoState,
    /// An internal invariant was violated; should not happen in practice.
    Internal,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::TransientDependency)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue full: {queue}")]
    QueueFull { queue: &'static str },

    #[error("circuit open for dependency: {dependency}")]
    CircuitOpen { dependency: String },

    #[error("profile unavailable for user {user_id}")]
    ProfileUnavailable { user_id: String },

    #[error("risk evaluation failed: {0}")]
    RiskEvaluation(String),

    #[error("limit computation failed for user {user_id}: {reason}")]
    LimitComputation { user_id: String, reason: String },

    #[error("policy ruleset invalid: {0}")]
    PolicyInvalid(String),

    #[error("integrity check failed: {0}")]
    IntegrityViolation(String),

    #[error("crypto key material unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("malformed transaction: {0}")]
    InvalidTransaction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::QueueFull { .. } => ErrorCategory::ResourceExhausted,
            Error::CircuitOpen { .. } => ErrorCategory::TransientDependency,
            Error::ProfileUnavailable { .. } => ErrorCategory::TransientDependency,
            Error::RiskEvaluation(_) => ErrorCategory::Internal,
            Error::LimitComputation { .. } => ErrorCategory::Internal,
            Error::PolicyInvalid(_) => ErrorCategory::PolicyInvalid,
            Error::IntegrityViolation(_) => ErrorCategory::Integrity,
            Error::CryptoUnavailable(_) => ErrorCategory::CryptoState,
            Error::InvalidTransaction(_) => ErrorCategory::PermanentInput,
            Error::Storage(_) => ErrorCategory::TransientDependency,
            Error::Io(_) => ErrorCategory::TransientDependency,
            Error::Serialization(_) => ErrorCategory::PermanentInput,
            Error::Config(_) => ErrorCategory::PolicyInvalid,
            Error::Internal(_) => ErrorCategory::Internal,
        }
    }
}
