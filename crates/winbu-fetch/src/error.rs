//! Error taxonomy for fetch sessions.
//!
//! A cache miss is not an error (it is `None` from the cache). Per-slot
//! secondary failures are not errors either: they degrade a slot to
//! `Unavailable` and surface as warnings on an otherwise successful fetch.

use std::time::Duration;

/// Stable machine-readable error codes.
pub mod error_codes {
    pub const INVALID_TARGET: &str = "E_INVALID_TARGET";
    pub const ADMISSION_TIMEOUT: &str = "E_ADMISSION_TIMEOUT";
    pub const TRANSPORT: &str = "E_TRANSPORT";
    pub const STATUS: &str = "E_STATUS";
    pub const EXTRACTION: &str = "E_EXTRACTION";
    pub const DEADLINE_EXCEEDED: &str = "E_DEADLINE_EXCEEDED";
    pub const CONFIG: &str = "E_CONFIG";
    pub const INTERNAL: &str = "E_INTERNAL";
}

/// Errors that abort a fetch session.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Admission timeout: no fetch permit within {waited:?}")]
    AdmissionTimeout { waited: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Timed out after {after:?} waiting for {phase}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        use error_codes::*;
        match self {
            FetchError::InvalidTarget(_) => INVALID_TARGET,
            FetchError::AdmissionTimeout { .. } => ADMISSION_TIMEOUT,
            FetchError::Transport(_) | FetchError::Timeout { .. } => TRANSPORT,
            FetchError::Status { .. } => STATUS,
            FetchError::Extraction(_) => EXTRACTION,
            FetchError::DeadlineExceeded { .. } => DEADLINE_EXCEEDED,
            FetchError::Config(_) => CONFIG,
            FetchError::Io(_) | FetchError::Json(_) => INTERNAL,
        }
    }

    /// Whether the primary fetch loop should try again after this error.
    ///
    /// Connection-level failures, 5xx and 429 are retryable. Any other
    /// status is a definitive answer from the origin.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Errors produced by a document extractor.
#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("No extractor registered for {0} pages")]
    UnsupportedFamily(crate::extract::PageFamily),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single secondary resolution failed. Never returned as `Err` from a
/// session; rendered into the slot's `Unavailable` reason instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    #[error("request failed: {0}")]
    Request(String),

    #[error("side channel returned status {0}")]
    Status(u16),

    #[error("no src URL found in response")]
    NoMatch,

    #[error("deadline exceeded before resolution finished")]
    Cancelled,
}

/// Convenience result type.
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryability() {
        let server_error = FetchError::Status {
            status: 503,
            url: "https://winbu.tv/x".into(),
        };
        let throttled = FetchError::Status {
            status: 429,
            url: "https://winbu.tv/x".into(),
        };
        let not_found = FetchError::Status {
            status: 404,
            url: "https://winbu.tv/x".into(),
        };
        assert!(server_error.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_fatal_errors_not_retryable() {
        let err = FetchError::Extraction(ExtractionError::Malformed("empty".into()));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), error_codes::EXTRACTION);

        let err = FetchError::AdmissionTimeout {
            waited: Duration::from_millis(10),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), error_codes::ADMISSION_TIMEOUT);
    }

    #[test]
    fn test_resolve_failure_messages() {
        assert_eq!(
            ResolveFailure::NoMatch.to_string(),
            "no src URL found in response"
        );
        assert_eq!(
            ResolveFailure::Status(502).to_string(),
            "side channel returned status 502"
        );
    }
}
