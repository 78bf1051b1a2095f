#![forbid(unsafe_code)]

// Error taxonomy for the stress harness

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the harness.
///
/// Per-test and per-connection variants (`Connect`, `Send`, `Receive`, `Timeout`)
/// are rendered into outcome records where they occur. `main` fails the process
/// only for errors that are `is_fatal`.
#[derive(Error, Debug)]
pub enum StressError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("receive timeout after {0:?}")]
    Timeout(Duration),

    #[error("service at {url} not ready after {waited:?} (last status: {last_status})")]
    ReadinessTimeout {
        url: String,
        waited: Duration,
        last_status: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for harness operations
pub type StressResult<T> = Result<T, StressError>;

impl StressError {
    /// Fatal errors abort the whole run rather than a single test.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StressError::ReadinessTimeout { .. } | StressError::Config(_) | StressError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = StressError::Send("broken pipe".to_string());
        assert_eq!(err.to_string(), "send error: broken pipe");

        let err = StressError::ReadinessTimeout {
            url: "http://localhost:8080/health".to_string(),
            waited: Duration::from_secs(60),
            last_status: "initializing".to_string(),
        };
        assert!(err.to_string().contains("http://localhost:8080/health"));
        assert!(err.to_string().contains("initializing"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StressError::Config("bad".into()).is_fatal());
        assert!(!StressError::Connect("refused".into()).is_fatal());
        assert!(!StressError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!StressError::Cancelled.is_fatal());
    }
}
