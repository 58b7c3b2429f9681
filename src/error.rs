//! Error taxonomy shared across the pipeline, stores, and HTTP layer.
//!
//! Provider and storage failures are split into retryable and permanent
//! classes; [`Error::is_retryable`] is what the job queue consults when
//! deciding between rescheduling with backoff and terminal failure.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Domain errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input shape or size. User-correctable, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid identity.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Caller exceeded a rate limit; carries the suggested wait.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing file or record.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout or 5xx from storage, AI, or embedding providers. Retryable.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Provider rejected the request outright (auth failure, malformed
    /// request). Retrying would fail the same way.
    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    /// Database read or write failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Media type this system cannot turn into text.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Document was readable as bytes but not as a document.
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl Error {
    /// Whether the job framework should reschedule the failed attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientProvider(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Error::TransientProvider(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Error::TransientProvider(e.to_string());
            }
            return Error::PermanentProvider(e.to_string());
        }
        // Request never got a response (DNS, TLS, broken pipe).
        Error::TransientProvider(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(Error::TransientProvider("timeout".into()).is_retryable());
    }

    #[test]
    fn permanent_classes_are_not_retryable() {
        for err in [
            Error::Validation("bad".into()),
            Error::NotFound("gone".into()),
            Error::PermanentProvider("401 from provider".into()),
            Error::Persistence("disk full".into()),
        ] {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }
}
