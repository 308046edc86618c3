//! Error taxonomy for the partition controller.
//!
//! Every failure is reported through [`CohostError`]. Callers that need to
//! decide whether to retry classify errors with [`CohostError::kind`]:
//!
//! - `Validation`: bad size/count/format or unknown instance. No side effects.
//! - `ResourceExhausted`: not enough chunks or cores. Registry state was rolled back.
//! - `Busy`: the instance is mid-operation. Nothing changed; retry later.
//! - `HardwareProtocol`: an IPI was not accepted. Not rolled back, poll status.
//! - `FatalInit`: device initialization could not reserve anything.

use thiserror::Error;

/// Result type for cohost operations.
pub type CohostResult<T> = Result<T, CohostError>;

#[derive(Error, Debug)]
pub enum CohostError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("hardware protocol error: {0}")]
    HardwareProtocol(String),

    #[error("device initialization failed: {0}")]
    FatalInit(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`CohostError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ResourceExhausted,
    Busy,
    HardwareProtocol,
    FatalInit,
    Timeout,
    Internal,
}

impl CohostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CohostError::Validation(_)
            | CohostError::NotFound(_)
            | CohostError::InvalidImage(_)
            | CohostError::Config(_)
            | CohostError::Json(_) => ErrorKind::Validation,
            CohostError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            CohostError::Busy(_) => ErrorKind::Busy,
            CohostError::HardwareProtocol(_) => ErrorKind::HardwareProtocol,
            CohostError::FatalInit(_) => ErrorKind::FatalInit,
            CohostError::Timeout(_) => ErrorKind::Timeout,
            CohostError::Internal(_) | CohostError::Io(_) => ErrorKind::Internal,
        }
    }

    /// True if the same request may succeed once in-flight work drains.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            CohostError::NotFound("os 3".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CohostError::InvalidImage("bad magic".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CohostError::Busy("os 0 is Booting".into()).kind(),
            ErrorKind::Busy
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(CohostError::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(CohostError::Busy("x".into()).is_retryable());
        assert!(!CohostError::ResourceExhausted("x".into()).is_retryable());
        assert!(!CohostError::HardwareProtocol("x".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = CohostError::ResourceExhausted("no chunk fits 64 MiB".into());
        assert_eq!(err.to_string(), "resource exhausted: no chunk fits 64 MiB");
    }
}
