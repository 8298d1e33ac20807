//! Error types for the attested session.

use crate::attestation::FetchStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("attestation configuration failure: {0}")]
    ConfigurationFailure(String),

    #[error("missing token binding header {0}")]
    BindingMissing(String),

    #[error("attestation token fetch needs a retry: {0}")]
    NetworkTransient(FetchStatus),

    #[error("certificate trust evaluation failed for host {host}: {reason}")]
    TrustEvaluationFailure { host: String, reason: String },

    #[error("attestation service error: {0}")]
    ServiceError(FetchStatus),

    #[error("task was cancelled")]
    Cancelled,

    #[error("session has been invalidated")]
    Invalidated,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid resume data: {0}")]
    InvalidResumeData(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Binding,
    Transient,
    Trust,
    Service,
    Transfer,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigurationFailure(_) => ErrorKind::Configuration,
            Self::BindingMissing(_) => ErrorKind::Binding,
            Self::NetworkTransient(_) => ErrorKind::Transient,
            Self::TrustEvaluationFailure { .. } => ErrorKind::Trust,
            Self::ServiceError(_) => ErrorKind::Service,
            Self::Cancelled
            | Self::Invalidated
            | Self::InvalidRequest(_)
            | Self::InvalidResumeData(_)
            | Self::Transport(_)
            | Self::Io(_) => ErrorKind::Transfer,
        }
    }

    /// Whether the caller should offer a retry after a user driven event.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<hyper::Error> for SessionError {
    fn from(err: hyper::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = SessionError::NetworkTransient(FetchStatus::NoNetwork);
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("NO_NETWORK"));

        let err = SessionError::ServiceError(FetchStatus::Rejected);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Service);
    }
}
