//! Session event callbacks and the forwarding delegate that enforces pinning.
//!
//! Callbacks are grouped by capability. A delegate implements
//! [`SessionDelegate`] and advertises the other capabilities through the
//! accessor methods; every callback has a default so implementors only
//! override what they care about.

use crate::engine::{
    AuthChallenge, ChallengeDisposition, Credential, RequestHead, ResponseHead, ServerTrust,
    SessionTask,
};
use crate::error::SessionError;
use crate::pinning::CertificateVerifier;
use hyper::body::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Body source for streamed uploads.
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Allow,
    Cancel,
}

#[allow(unused_variables)]
pub trait SessionDelegate: Send + Sync {
    fn did_become_invalid(&self, error: Option<&SessionError>) {}

    fn did_receive_challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }

    fn task_delegate(&self) -> Option<&dyn TaskDelegate> {
        None
    }

    fn data_delegate(&self) -> Option<&dyn DataDelegate> {
        None
    }

    fn download_delegate(&self) -> Option<&dyn DownloadDelegate> {
        None
    }
}

#[allow(unused_variables)]
pub trait TaskDelegate: Send + Sync {
    /// Return the request to follow, or `None` to deliver the redirect
    /// response itself.
    fn will_perform_redirection(
        &self,
        task: &SessionTask,
        response: &ResponseHead,
        new_request: RequestHead,
    ) -> Option<RequestHead> {
        Some(new_request)
    }

    fn did_receive_task_challenge(
        &self,
        task: &SessionTask,
        challenge: &AuthChallenge,
    ) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }

    fn need_new_body_stream(&self, task: &SessionTask) -> Option<BodyStream> {
        None
    }

    fn did_send_body_data(
        &self,
        task: &SessionTask,
        bytes_sent: u64,
        total_bytes_sent: u64,
        total_bytes_expected_to_send: u64,
    ) {
    }

    fn did_complete(&self, task: &SessionTask, error: Option<&SessionError>) {}
}

#[allow(unused_variables)]
pub trait DataDelegate: Send + Sync {
    fn did_receive_response(
        &self,
        task: &SessionTask,
        response: &ResponseHead,
    ) -> ResponseDisposition {
        ResponseDisposition::Allow
    }

    fn did_receive_data(&self, task: &SessionTask, data: &Bytes) {}
}

#[allow(unused_variables)]
pub trait DownloadDelegate: Send + Sync {
    fn did_finish_downloading_to(&self, task: &SessionTask, location: &Path) {}

    fn did_write_data(
        &self,
        task: &SessionTask,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected_to_write: Option<u64>,
    ) {
    }

    fn did_resume_at_offset(
        &self,
        task: &SessionTask,
        file_offset: u64,
        expected_total_bytes: Option<u64>,
    ) {
    }
}

/// Route a challenge to the task-level handler when the delegate has one.
pub(crate) fn dispatch_challenge(
    delegate: &dyn SessionDelegate,
    task: &SessionTask,
    challenge: &AuthChallenge,
) -> ChallengeDisposition {
    match delegate.task_delegate() {
        Some(task_delegate) => task_delegate.did_receive_task_challenge(task, challenge),
        None => delegate.did_receive_challenge(challenge),
    }
}

/// Wraps the caller's delegate. Every callback is passed through unchanged
/// except server trust challenges, which are answered here from the pin set.
///
/// An accepted challenge is still shown to the wrapped delegate, but its
/// answer is ignored. A rejected one never reaches it.
pub struct ForwardingDelegate {
    inner: Option<Arc<dyn SessionDelegate>>,
    verifier: CertificateVerifier,
}

impl ForwardingDelegate {
    pub fn new(inner: Option<Arc<dyn SessionDelegate>>, verifier: CertificateVerifier) -> Self {
        Self { inner, verifier }
    }

    pub fn inner(&self) -> Option<&Arc<dyn SessionDelegate>> {
        self.inner.as_ref()
    }

    pub fn verifier(&self) -> &CertificateVerifier {
        &self.verifier
    }

    fn answer_server_trust(
        &self,
        trust: &ServerTrust,
        notify: impl FnOnce(),
    ) -> ChallengeDisposition {
        match self.verifier.evaluate(trust) {
            Ok(matched) => {
                debug!("Server trust for {} accepted: {:?}", trust.host(), matched);
                notify();
                ChallengeDisposition::UseCredential(Credential::ServerTrust(trust.clone()))
            }
            Err(e) => {
                warn!("Cancelling server trust challenge: {}", e);
                ChallengeDisposition::CancelAuthenticationChallenge
            }
        }
    }

    fn inner_task(&self) -> Option<&dyn TaskDelegate> {
        self.inner.as_deref().and_then(|d| d.task_delegate())
    }

    fn inner_data(&self) -> Option<&dyn DataDelegate> {
        self.inner.as_deref().and_then(|d| d.data_delegate())
    }

    fn inner_download(&self) -> Option<&dyn DownloadDelegate> {
        self.inner.as_deref().and_then(|d| d.download_delegate())
    }
}

impl SessionDelegate for ForwardingDelegate {
    fn did_become_invalid(&self, error: Option<&SessionError>) {
        if let Some(inner) = &self.inner {
            inner.did_become_invalid(error);
        }
    }

    fn did_receive_challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
        match challenge {
            AuthChallenge::ServerTrust(trust) => self.answer_server_trust(trust, || {
                if let Some(inner) = &self.inner {
                    let _ = inner.did_receive_challenge(challenge);
                }
            }),
            _ => match &self.inner {
                Some(inner) => inner.did_receive_challenge(challenge),
                None => ChallengeDisposition::PerformDefaultHandling,
            },
        }
    }

    fn task_delegate(&self) -> Option<&dyn TaskDelegate> {
        Some(self)
    }

    fn data_delegate(&self) -> Option<&dyn DataDelegate> {
        Some(self)
    }

    fn download_delegate(&self) -> Option<&dyn DownloadDelegate> {
        Some(self)
    }
}

impl TaskDelegate for ForwardingDelegate {
    fn will_perform_redirection(
        &self,
        task: &SessionTask,
        response: &ResponseHead,
        new_request: RequestHead,
    ) -> Option<RequestHead> {
        match self.inner_task() {
            Some(inner) => inner.will_perform_redirection(task, response, new_request),
            None => Some(new_request),
        }
    }

    fn did_receive_task_challenge(
        &self,
        task: &SessionTask,
        challenge: &AuthChallenge,
    ) -> ChallengeDisposition {
        match challenge {
            AuthChallenge::ServerTrust(trust) => self.answer_server_trust(trust, || {
                if let Some(inner) = self.inner_task() {
                    let _ = inner.did_receive_task_challenge(task, challenge);
                }
            }),
            _ => match self.inner_task() {
                Some(inner) => inner.did_receive_task_challenge(task, challenge),
                None => self.did_receive_challenge(challenge),
            },
        }
    }

    fn need_new_body_stream(&self, task: &SessionTask) -> Option<BodyStream> {
        self.inner_task()?.need_new_body_stream(task)
    }

    fn did_send_body_data(
        &self,
        task: &SessionTask,
        bytes_sent: u64,
        total_bytes_sent: u64,
        total_bytes_expected_to_send: u64,
    ) {
        if let Some(inner) = self.inner_task() {
            inner.did_send_body_data(
                task,
                bytes_sent,
                total_bytes_sent,
                total_bytes_expected_to_send,
            );
        }
    }

    fn did_complete(&self, task: &SessionTask, error: Option<&SessionError>) {
        if let Some(inner) = self.inner_task() {
            inner.did_complete(task, error);
        }
    }
}

impl DataDelegate for ForwardingDelegate {
    fn did_receive_response(
        &self,
        task: &SessionTask,
        response: &ResponseHead,
    ) -> ResponseDisposition {
        match self.inner_data() {
            Some(inner) => inner.did_receive_response(task, response),
            None => ResponseDisposition::Allow,
        }
    }

    fn did_receive_data(&self, task: &SessionTask, data: &Bytes) {
        if let Some(inner) = self.inner_data() {
            inner.did_receive_data(task, data);
        }
    }
}

impl DownloadDelegate for ForwardingDelegate {
    fn did_finish_downloading_to(&self, task: &SessionTask, location: &Path) {
        if let Some(inner) = self.inner_download() {
            inner.did_finish_downloading_to(task, location);
        }
    }

    fn did_write_data(
        &self,
        task: &SessionTask,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected_to_write: Option<u64>,
    ) {
        if let Some(inner) = self.inner_download() {
            inner.did_write_data(
                task,
                bytes_written,
                total_bytes_written,
                total_bytes_expected_to_write,
            );
        }
    }

    fn did_resume_at_offset(
        &self,
        task: &SessionTask,
        file_offset: u64,
        expected_total_bytes: Option<u64>,
    ) {
        if let Some(inner) = self.inner_download() {
            inner.did_resume_at_offset(task, file_offset, expected_total_bytes);
        }
    }
}
