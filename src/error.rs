//! Errors surfaced by the transport and by the client itself.
//!
//! Per-operation failures never show up here: they resolve as an
//! [OperationResult](crate::OperationResult) instead.

use thiserror::Error;

/// A failure to get a response from an endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level I/O failure, e.g. a reset stream or refused connection.
    #[error("I/O error: {0}")]
    Io(String),
    /// The operation did not complete before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The TLS handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),
    /// The request could not be sent as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The endpoint has been closed.
    #[error("endpoint closed")]
    Closed,
}

impl TransportError {
    /// Whether another attempt at the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Io(_))
    }
}

/// An endpoint which failed to shut down cleanly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{endpoint}: {error}")]
pub struct CloseFailure {
    /// The endpoint being closed.
    pub endpoint: String,
    /// Why closing it failed.
    pub error: TransportError,
}

/// Client-wide errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// Too many operations are pending; the caller should back off before enqueueing more.
    #[error("overloaded: {pending} operations pending, limit is {limit}")]
    Overloaded {
        /// Operations pending when the new one was rejected.
        pending: usize,
        /// The configured maximum.
        limit: usize,
    },
    /// The client has been closed.
    #[error("feed client is closed")]
    Closed,
    /// One or more endpoints failed to close.
    #[error("failed to close {} endpoint(s): {}", .0.len(), join(.0))]
    Close(Vec<CloseFailure>),
}

fn join(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_errors_are_retryable() {
        assert!(TransportError::Io("reset".into()).is_retryable());
        assert!(!TransportError::Tls("handshake".into()).is_retryable());
        assert!(!TransportError::InvalidRequest("bad".into()).is_retryable());
        assert!(!TransportError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }

    #[test]
    fn close_error_lists_every_endpoint() {
        let error = FeedError::Close(vec![
            CloseFailure {
                endpoint: "https://a:8080/".into(),
                error: TransportError::Io("broken pipe".into()),
            },
            CloseFailure {
                endpoint: "https://b:8080/".into(),
                error: TransportError::Closed,
            },
        ]);

        assert_eq!(
            error.to_string(),
            "failed to close 2 endpoint(s): https://a:8080/: I/O error: broken pipe; \
             https://b:8080/: endpoint closed"
        );
    }
}
