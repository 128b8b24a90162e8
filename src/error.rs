//! Error taxonomy for provider calls and transfer jobs.
//!
//! Provider failures are classified into tagged values (`ErrorClass`) so that
//! retry and abort decisions are plain data-driven branches.

use std::time::Duration;
use thiserror::Error;

use crate::models::{EntryErrorKind, StopPoint};
use crate::report::TransferReport;

// ============================================================================
// Provider Errors
// ============================================================================

/// Failure raised by a source or target capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("temporary failure: {0}")]
    Temporary(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("authorization failure: {0}")]
    Authorization(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
}

/// How a retriable failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Wait at least the server-specified delay
    RateLimit(Duration),
    /// Exponential backoff with jitter
    Transient,
}

/// Tagged classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable(RetryKind),
    /// Non-retriable; record it and move on
    Recorded,
    /// Abort the job
    Fatal,
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited { retry_after_ms } => {
                ErrorClass::Retriable(RetryKind::RateLimit(Duration::from_millis(*retry_after_ms)))
            }
            ProviderError::Temporary(_) => ErrorClass::Retriable(RetryKind::Transient),
            ProviderError::Permanent(_)
            | ProviderError::NotFound(_)
            | ProviderError::Validation(_) => ErrorClass::Recorded,
            ProviderError::Authorization(_) | ProviderError::SourceUnavailable(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Entry error kind used when a whole batch is rejected without retry.
    pub fn entry_kind(&self) -> EntryErrorKind {
        match self {
            ProviderError::NotFound(_) => EntryErrorKind::NotFound,
            ProviderError::Validation(_) => EntryErrorKind::Validation,
            _ => EntryErrorKind::PermanentFailure,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Job Errors
// ============================================================================

/// Terminal error of a transfer job.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("authorization failure: {0}")]
    Authorization(String),

    #[error("rate limit persisted after {retries} retries on {collection_id} batch {batch_index}")]
    RateLimitEscalation {
        collection_id: String,
        batch_index: usize,
        retries: u32,
    },

    #[error("write error rate {rate:.3} exceeded threshold {threshold:.3}")]
    ErrorRateExceeded { rate: f64, threshold: f64 },

    #[error("checkpoint persistence failed after {attempts} attempts: {message}")]
    CheckpointPersistence { attempts: u32, message: String },

    #[error("cannot resolve target collection '{name}': {message}")]
    TargetCollection { name: String, message: String },

    #[error("another run holds the lock for job identity {0}")]
    JobLocked(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checkpoint store error: {0}")]
    Store(String),
}

impl TransferError {
    /// Maps a fatal provider failure to the matching job error.
    pub fn from_fatal(err: &ProviderError) -> Self {
        match err {
            ProviderError::Authorization(msg) => TransferError::Authorization(msg.clone()),
            other => TransferError::SourceUnavailable(other.to_string()),
        }
    }
}

/// A job that stopped before completion. The report is always finalized.
#[derive(Error, Debug)]
#[error("transfer job aborted at {stopped_at:?}: {error}")]
pub struct JobAborted {
    pub error: TransferError,
    pub stopped_at: Option<StopPoint>,
    pub report: Box<TransferReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ProviderError::RateLimited { retry_after_ms: 1500 }.class(),
            ErrorClass::Retriable(RetryKind::RateLimit(Duration::from_millis(1500)))
        );
        assert_eq!(
            ProviderError::Temporary("503".into()).class(),
            ErrorClass::Retriable(RetryKind::Transient)
        );
        assert_eq!(ProviderError::Permanent("bad".into()).class(), ErrorClass::Recorded);
        assert_eq!(ProviderError::NotFound("gone".into()).class(), ErrorClass::Recorded);
        assert_eq!(ProviderError::Validation("uri".into()).class(), ErrorClass::Recorded);
        assert_eq!(ProviderError::Authorization("401".into()).class(), ErrorClass::Fatal);
        assert_eq!(ProviderError::SourceUnavailable("down".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_entry_kind() {
        assert_eq!(ProviderError::NotFound("x".into()).entry_kind(), EntryErrorKind::NotFound);
        assert_eq!(ProviderError::Validation("x".into()).entry_kind(), EntryErrorKind::Validation);
        assert_eq!(
            ProviderError::Permanent("x".into()).entry_kind(),
            EntryErrorKind::PermanentFailure
        );
    }

    #[test]
    fn test_from_fatal() {
        assert!(matches!(
            TransferError::from_fatal(&ProviderError::Authorization("expired".into())),
            TransferError::Authorization(_)
        ));
        assert!(matches!(
            TransferError::from_fatal(&ProviderError::SourceUnavailable("down".into())),
            TransferError::SourceUnavailable(_)
        ));
    }
}
