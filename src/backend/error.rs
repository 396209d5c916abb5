//! Backend error types

use thiserror::Error;

/// Backend failure with classification.
///
/// Inside a generation these never cross the [`crate::backend::ModelBackend`]
/// boundary as `Err`: the backend converts them into a single terminal
/// error-role update. The `Err` form is used where no stream exists yet,
/// e.g. constructing a backend from an invalid configuration.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::RateLimit, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::InvalidRequest, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ServerError, message)
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Worker, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unsupported, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unknown, message)
    }
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Unreachable endpoint, timeout, connection reset.
    Network,
    /// Authentication rejected (401, 403).
    Auth,
    /// Rate limited (429).
    RateLimit,
    /// The backend rejected the request as malformed (400).
    InvalidRequest,
    /// Provider-side failure (5xx).
    ServerError,
    /// Unexpected failure inside a generation worker.
    Worker,
    /// No constructor bound for the requested backend kind.
    Unsupported,
    Unknown,
}
