//! The HTTP engine the session delegates transfers to.
//!
//! [`HttpEngine`] is the seam: the session decides whether and with which
//! headers a task is created, the engine owns connections, TLS and the
//! delegate callbacks. [`HyperEngine`] is the tokio/hyper/rustls
//! implementation.

mod hyper_engine;
mod task;
mod trust;

pub use hyper_engine::HyperEngine;
pub use task::{SessionTask, TaskId, TaskKind, TaskProgress, TaskState};
pub use trust::{AuthChallenge, ChallengeDisposition, Credential, ServerTrust};
pub(crate) use task::TaskStarter;
pub(crate) use trust::TrustBridge;

use crate::error::{Result, SessionError};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Method, URL and headers of a request, without the body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl<B> From<&Request<B>> for RequestHead {
    fn from(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    /// Final URL, after redirects.
    pub url: Uri,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn expected_content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// Body source for upload tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadBody {
    Data(Bytes),
    File(PathBuf),
    /// Asked from the task delegate when the transfer starts.
    Streamed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskSpec {
    Data,
    Upload(UploadBody),
    Download,
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Data => TaskKind::Data,
            Self::Upload(_) => TaskKind::Upload,
            Self::Download => TaskKind::Download,
        }
    }
}

pub type DataCompletion =
    Box<dyn FnOnce(Option<Bytes>, Option<ResponseHead>, Option<SessionError>) + Send>;
pub type DownloadCompletion =
    Box<dyn FnOnce(Option<PathBuf>, Option<ResponseHead>, Option<SessionError>) + Send>;

/// Everything a finished transfer produced.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub body: Option<Bytes>,
    pub location: Option<PathBuf>,
    pub response: Option<ResponseHead>,
    pub error: Option<SessionError>,
}

impl TransferOutcome {
    pub fn failed(error: SessionError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Completion handler supplied at task creation. Called exactly once.
pub enum Completion {
    Data(DataCompletion),
    Download(DownloadCompletion),
}

impl Completion {
    pub fn deliver(self, outcome: TransferOutcome) {
        match self {
            Self::Data(handler) => handler(outcome.body, outcome.response, outcome.error),
            Self::Download(handler) => handler(outcome.location, outcome.response, outcome.error),
        }
    }

    pub fn fail(self, error: SessionError) {
        self.deliver(TransferOutcome::failed(error))
    }

    /// A handler of the same shape that drops whatever it receives.
    pub fn discarding(&self) -> Completion {
        match self {
            Self::Data(_) => Self::Data(Box::new(|_, _, _| {})),
            Self::Download(_) => Self::Download(Box::new(|_, _, _| {})),
        }
    }
}

/// State needed to continue an interrupted download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub partial_path: PathBuf,
    pub offset: u64,
}

impl ResumeData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SessionError::InvalidResumeData(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::InvalidResumeData(e.to_string()))
    }

    pub(crate) fn from_request(head: &RequestHead, partial_path: PathBuf, offset: u64) -> Self {
        Self {
            url: head.uri.to_string(),
            headers: head
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
                })
                .collect(),
            partial_path,
            offset,
        }
    }

    /// The GET that fetches the remainder, with a `Range` header.
    pub fn to_request(&self) -> Result<Request<Bytes>> {
        let mut builder = Request::builder().method(Method::GET).uri(self.url.as_str());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| SessionError::InvalidResumeData(e.to_string()))?;
            if name == hyper::header::RANGE {
                continue;
            }
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| SessionError::InvalidResumeData(e.to_string()))?;
            builder = builder.header(name, value);
        }
        builder
            .header(hyper::header::RANGE, format!("bytes={}-", self.offset))
            .body(Bytes::new())
            .map_err(|e| SessionError::InvalidResumeData(e.to_string()))
    }
}

/// Creates and runs transfers. Tasks come back suspended.
pub trait HttpEngine: Send + Sync {
    fn create_task(
        &self,
        request: Request<Bytes>,
        spec: TaskSpec,
        completion: Option<Completion>,
    ) -> SessionTask;

    /// Continue a download from [`SessionTask::cancel_producing_resume_data`].
    fn resume_download(&self, resume_data: &[u8], completion: Option<Completion>) -> SessionTask;

    /// Let running tasks finish, refuse new ones, then report invalidation.
    fn finish_tasks_and_invalidate(&self);

    /// Cancel everything and report invalidation.
    fn invalidate_and_cancel(&self);

    fn all_tasks(&self) -> Vec<SessionTask>;

    /// Write out pending connection state, then call `done`.
    fn flush(&self, done: Box<dyn FnOnce() + Send>) {
        done()
    }

    /// Drop connection and credential state, then call `done`. Later tasks
    /// start on fresh connections.
    fn reset(&self, done: Box<dyn FnOnce() + Send>) {
        done()
    }
}

/// Request headers that authenticate the caller to one origin. A redirect
/// to another origin drops them.
pub trait CredentialHeaders: Send + Sync {
    fn credential_headers(&self) -> Vec<HeaderName>;
}
