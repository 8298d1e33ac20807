use crate::error::SessionError;
use hyper::body::Bytes;
use hyper::Request;

/// What the session should do with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Send the request, with a token header when one was obtained.
    Proceed,
    /// A transient condition; the caller may retry after some user driven
    /// event.
    Retry(SessionError),
    /// The request must not be sent.
    Fail(SessionError),
}

impl Decision {
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Self::Proceed => None,
            Self::Retry(e) | Self::Fail(e) => Some(e),
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// The decision together with the (possibly modified) request.
#[derive(Debug)]
pub struct Interception {
    pub decision: Decision,
    pub request: Request<Bytes>,
    /// Human readable status for logs.
    pub message: String,
}

impl Interception {
    pub(crate) fn proceed(request: Request<Bytes>, message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Proceed,
            request,
            message: message.into(),
        }
    }

    pub(crate) fn retry(request: Request<Bytes>, error: SessionError) -> Self {
        Self {
            message: error.to_string(),
            decision: Decision::Retry(error),
            request,
        }
    }

    pub(crate) fn fail(request: Request<Bytes>, error: SessionError) -> Self {
        Self {
            message: error.to_string(),
            decision: Decision::Fail(error),
            request,
        }
    }
}
