//! The attested session facade.
//!
//! Mirrors the task creation API of the underlying engine. Every request goes
//! through the token provider first; only a `Proceed` decision creates a live
//! task. `Retry` and `Fail` produce a task that is already cancelled, with
//! the error reported through the completion handler or, without one, the
//! session delegate.

mod delegate;

pub use delegate::{
    BodyStream, DataDelegate, DownloadDelegate, ForwardingDelegate, ResponseDisposition,
    SessionDelegate, TaskDelegate,
};
pub(crate) use delegate::dispatch_challenge;

use crate::config::SessionConfiguration;
use crate::decision::{Decision, Interception};
use crate::engine::{
    Completion, HttpEngine, HyperEngine, ResponseHead, SessionTask, TaskKind, TaskSpec, UploadBody,
};
use crate::error::{Result, SessionError};
use crate::pinning::CertificateVerifier;
use crate::token::TokenProvider;
use hyper::body::Bytes;
use hyper::header::HeaderName;
use hyper::Request;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Live tasks of a session, split by kind.
#[derive(Debug, Default, Clone)]
pub struct TaskGroups {
    pub data: Vec<SessionTask>,
    pub upload: Vec<SessionTask>,
    pub download: Vec<SessionTask>,
}

pub struct AttestedSession {
    configuration: SessionConfiguration,
    tokens: Arc<TokenProvider>,
    delegate: Arc<ForwardingDelegate>,
    engine: Arc<dyn HttpEngine>,
}

impl AttestedSession {
    /// A session backed by [`HyperEngine`] running on `runtime`.
    pub fn new(
        configuration: SessionConfiguration,
        delegate: Option<Arc<dyn SessionDelegate>>,
        tokens: Arc<TokenProvider>,
        runtime: Handle,
    ) -> Result<Self> {
        let forwarding = Arc::new(ForwardingDelegate::new(
            delegate,
            CertificateVerifier::new(tokens.pin_store(), configuration.unpinned_hosts),
        ));
        let engine = HyperEngine::new(
            runtime,
            forwarding.clone(),
            tokens.clone(),
            &configuration,
        )?;
        Ok(Self::with_engine(
            configuration,
            tokens,
            forwarding,
            Arc::new(engine),
        ))
    }

    /// A session over an arbitrary engine. The engine must route its
    /// callbacks to `delegate`.
    pub fn with_engine(
        configuration: SessionConfiguration,
        tokens: Arc<TokenProvider>,
        delegate: Arc<ForwardingDelegate>,
        engine: Arc<dyn HttpEngine>,
    ) -> Self {
        Self {
            configuration,
            tokens,
            delegate,
            engine,
        }
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    pub fn token_provider(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    pub fn delegate(&self) -> &Arc<ForwardingDelegate> {
        &self.delegate
    }

    pub fn data_task(&self, request: Request<Bytes>) -> SessionTask {
        self.intercept_and_create(request, TaskSpec::Data, None)
    }

    pub fn data_task_with_completion<F>(&self, request: Request<Bytes>, handler: F) -> SessionTask
    where
        F: FnOnce(Option<Bytes>, Option<ResponseHead>, Option<SessionError>) + Send + 'static,
    {
        self.intercept_and_create(
            request,
            TaskSpec::Data,
            Some(Completion::Data(Box::new(handler))),
        )
    }

    /// Upload `body`. The request's own body is ignored.
    pub fn upload_task(&self, request: Request<Bytes>, body: UploadBody) -> SessionTask {
        self.intercept_and_create(request, TaskSpec::Upload(body), None)
    }

    pub fn upload_task_with_completion<F>(
        &self,
        request: Request<Bytes>,
        body: UploadBody,
        handler: F,
    ) -> SessionTask
    where
        F: FnOnce(Option<Bytes>, Option<ResponseHead>, Option<SessionError>) + Send + 'static,
    {
        self.intercept_and_create(
            request,
            TaskSpec::Upload(body),
            Some(Completion::Data(Box::new(handler))),
        )
    }

    /// Upload whatever the task delegate's body stream yields.
    pub fn streamed_upload_task(&self, request: Request<Bytes>) -> SessionTask {
        self.upload_task(request, UploadBody::Streamed)
    }

    pub fn download_task(&self, request: Request<Bytes>) -> SessionTask {
        self.intercept_and_create(request, TaskSpec::Download, None)
    }

    pub fn download_task_with_completion<F>(
        &self,
        request: Request<Bytes>,
        handler: F,
    ) -> SessionTask
    where
        F: FnOnce(Option<PathBuf>, Option<ResponseHead>, Option<SessionError>) + Send + 'static,
    {
        self.intercept_and_create(
            request,
            TaskSpec::Download,
            Some(Completion::Download(Box::new(handler))),
        )
    }

    /// Continue a cancelled download. No new token is fetched; the stored
    /// request headers are replayed as they were.
    pub fn download_task_with_resume_data(&self, resume_data: &[u8]) -> SessionTask {
        self.engine.resume_download(resume_data, None)
    }

    pub fn download_task_with_resume_data_and_completion<F>(
        &self,
        resume_data: &[u8],
        handler: F,
    ) -> SessionTask
    where
        F: FnOnce(Option<PathBuf>, Option<ResponseHead>, Option<SessionError>) + Send + 'static,
    {
        self.engine
            .resume_download(resume_data, Some(Completion::Download(Box::new(handler))))
    }

    pub fn finish_tasks_and_invalidate(&self) {
        self.engine.finish_tasks_and_invalidate();
    }

    pub fn invalidate_and_cancel(&self) {
        self.engine.invalidate_and_cancel();
    }

    pub fn all_tasks(&self) -> Vec<SessionTask> {
        self.engine.all_tasks()
    }

    pub fn tasks_by_kind(&self) -> TaskGroups {
        let mut groups = TaskGroups::default();
        for task in self.engine.all_tasks() {
            match task.kind() {
                TaskKind::Data => groups.data.push(task),
                TaskKind::Upload => groups.upload.push(task),
                TaskKind::Download => groups.download.push(task),
            }
        }
        groups
    }

    /// `done` runs once the engine has written out pending state.
    pub fn flush<F>(&self, done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.engine.flush(Box::new(done));
    }

    /// `done` runs once connection and credential state is dropped.
    pub fn reset<F>(&self, done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.engine.reset(Box::new(done));
    }

    /// Every configured value is added under names the request lacks.
    fn apply_additional_headers(&self, mut request: Request<Bytes>) -> Request<Bytes> {
        let headers = request.headers_mut();
        let present: HashSet<HeaderName> = headers.keys().cloned().collect();
        for (name, value) in &self.configuration.additional_headers {
            if !present.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        request
    }

    fn intercept_and_create(
        &self,
        request: Request<Bytes>,
        spec: TaskSpec,
        completion: Option<Completion>,
    ) -> SessionTask {
        let request = self.apply_additional_headers(request);
        let Interception {
            decision,
            request,
            message,
        } = self.tokens.fetch_token(request);
        debug!("Interception of {} {}: {}", request.method(), request.uri(), message);

        let error = match decision {
            Decision::Proceed => return self.engine.create_task(request, spec, completion),
            Decision::Retry(error) | Decision::Fail(error) => error,
        };
        warn!("Request to {} not sent: {}", request.uri(), error);

        match completion {
            Some(completion) => {
                let discard = completion.discarding();
                completion.fail(error);
                let task = self.engine.create_task(request, spec, Some(discard));
                task.cancel();
                task
            }
            None => {
                let task = self.engine.create_task(request, spec, None);
                task.cancel();
                self.delegate.did_become_invalid(Some(&error));
                task
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{
        AttestationService, FetchStatus, HostPins, MemoryStore, ResourceBundle, TokenFetchResult,
    };
    use crate::config::TokenConfig;
    use crate::engine::{TaskKind, TaskState, TransferOutcome};
    use crate::pinning::UnpinnedHosts;
    use hyper::header::HeaderValue;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedService {
        status: FetchStatus,
        fetches: AtomicUsize,
    }

    impl AttestationService for FixedService {
        fn initialize(&self, _: &str, _: Option<&str>) -> std::result::Result<(), String> {
            Ok(())
        }

        fn fetch_token_blocking(&self, _url: &str) -> TokenFetchResult {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            TokenFetchResult {
                token: "tok".to_string(),
                ..TokenFetchResult::with_status(self.status)
            }
        }

        fn fetch_current_config(&self) -> Option<String> {
            Some("{}".to_string())
        }

        fn pins(&self, _: &str) -> Option<HostPins> {
            Some(HostPins::new())
        }

        fn set_request_binding_value(&self, _: &str) {}
    }

    struct InlineBundle;

    impl ResourceBundle for InlineBundle {
        fn read_resource(&self, _: &str, _: &str) -> io::Result<String> {
            Ok("{}".to_string())
        }
    }

    /// Records created tasks and completes them synchronously on start.
    #[derive(Default)]
    struct RecordingEngine {
        created: Mutex<Vec<(Request<Bytes>, TaskSpec)>>,
        tasks: Mutex<Vec<SessionTask>>,
        resumed: AtomicUsize,
    }

    impl HttpEngine for RecordingEngine {
        fn create_task(
            &self,
            request: Request<Bytes>,
            spec: TaskSpec,
            completion: Option<Completion>,
        ) -> SessionTask {
            let head = (&request).into();
            let kind = spec.kind();
            self.created.lock().unwrap().push((request, spec));
            let task = SessionTask::new(
                kind,
                head,
                Box::new(move |task: SessionTask| {
                    let outcome = if task.is_cancelled() {
                        TransferOutcome::failed(SessionError::Cancelled)
                    } else {
                        TransferOutcome {
                            body: Some(Bytes::from_static(b"ok")),
                            ..TransferOutcome::default()
                        }
                    };
                    if let Some(completion) = completion {
                        completion.deliver(outcome);
                    }
                }),
            );
            self.tasks.lock().unwrap().push(task.clone());
            task
        }

        fn resume_download(
            &self,
            resume_data: &[u8],
            completion: Option<Completion>,
        ) -> SessionTask {
            self.resumed.fetch_add(1, Ordering::SeqCst);
            let request = crate::engine::ResumeData::decode(resume_data)
                .and_then(|data| data.to_request())
                .unwrap();
            self.create_task(request, TaskSpec::Download, completion)
        }

        fn finish_tasks_and_invalidate(&self) {}

        fn invalidate_and_cancel(&self) {
            for task in self.tasks.lock().unwrap().iter() {
                task.cancel();
            }
        }

        fn all_tasks(&self) -> Vec<SessionTask> {
            self.tasks.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct InvalidationRecorder {
        errors: Mutex<Vec<SessionError>>,
    }

    impl SessionDelegate for InvalidationRecorder {
        fn did_become_invalid(&self, error: Option<&SessionError>) {
            if let Some(error) = error {
                self.errors.lock().unwrap().push(error.clone());
            }
        }
    }

    struct Harness {
        session: AttestedSession,
        engine: Arc<RecordingEngine>,
        service: Arc<FixedService>,
        recorder: Arc<InvalidationRecorder>,
    }

    fn harness(status: FetchStatus) -> Harness {
        harness_with(status, &[("x-client", "attested")])
    }

    fn harness_with(status: FetchStatus, additional: &[(&'static str, &'static str)]) -> Harness {
        let service = Arc::new(FixedService {
            status,
            fetches: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenProvider::new(
            service.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(InlineBundle),
            TokenConfig::default(),
        ));
        let recorder = Arc::new(InvalidationRecorder::default());
        let delegate = Arc::new(ForwardingDelegate::new(
            Some(recorder.clone()),
            CertificateVerifier::new(tokens.pin_store(), UnpinnedHosts::Reject),
        ));
        let engine = Arc::new(RecordingEngine::default());

        let mut configuration = SessionConfiguration::default();
        for &(name, value) in additional {
            configuration.additional_headers.append(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        Harness {
            session: AttestedSession::with_engine(
                configuration,
                tokens,
                delegate,
                engine.clone(),
            ),
            engine,
            service,
            recorder,
        }
    }

    fn get(url: &str) -> Request<Bytes> {
        Request::get(url).body(Bytes::new()).unwrap()
    }

    type Delivered = Arc<Mutex<Vec<(Option<Bytes>, Option<SessionError>)>>>;

    fn data_handler(
        delivered: &Delivered,
    ) -> impl FnOnce(Option<Bytes>, Option<ResponseHead>, Option<SessionError>) + Send + 'static
    {
        let delivered = delivered.clone();
        move |body, _, error| delivered.lock().unwrap().push((body, error))
    }

    #[test]
    fn test_proceed_creates_live_task_with_token() {
        let h = harness(FetchStatus::Success);
        let task = h.session.data_task(get("https://api.example.com/a"));

        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(task.kind(), TaskKind::Data);
        let headers = &task.original_request().headers;
        assert_eq!(headers["attestation-token"], "tok");
        assert_eq!(headers["x-client"], "attested");
        assert!(h.recorder.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_additional_headers_do_not_override_request() {
        let h = harness(FetchStatus::UnprotectedUrl);
        let mut request = get("https://api.example.com/a");
        request
            .headers_mut()
            .insert("x-client", HeaderValue::from_static("custom"));

        let task = h.session.data_task(request);
        assert_eq!(task.original_request().headers["x-client"], "custom");
        assert!(task.original_request().headers.get("attestation-token").is_none());
    }

    #[test]
    fn test_multi_value_additional_headers_are_all_added() {
        let h = harness_with(
            FetchStatus::UnprotectedUrl,
            &[("accept", "application/json"), ("accept", "text/plain")],
        );

        let task = h.session.data_task(get("https://api.example.com/a"));
        let accept: Vec<_> = task.original_request().headers.get_all("accept").iter().collect();
        assert_eq!(accept, vec!["application/json", "text/plain"]);

        let mut request = get("https://api.example.com/a");
        request
            .headers_mut()
            .insert("accept", HeaderValue::from_static("image/png"));
        let task = h.session.data_task(request);
        let accept: Vec<_> = task.original_request().headers.get_all("accept").iter().collect();
        assert_eq!(accept, vec!["image/png"]);
    }

    #[test]
    fn test_proceed_with_completion_delivers_once() {
        let h = harness(FetchStatus::Success);
        let delivered = Delivered::default();
        let task = h
            .session
            .data_task_with_completion(get("https://api.example.com/a"), data_handler(&delivered));

        assert!(delivered.lock().unwrap().is_empty());
        task.resume();
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0.as_deref(), Some(&b"ok"[..]));
        assert!(delivered[0].1.is_none());
    }

    #[test]
    fn test_retry_without_completion_notifies_delegate() {
        let h = harness(FetchStatus::NoNetwork);
        let task = h.session.download_task(get("https://api.example.com/file"));

        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(
            *h.recorder.errors.lock().unwrap(),
            vec![SessionError::NetworkTransient(FetchStatus::NoNetwork)]
        );
        assert_eq!(h.engine.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fail_with_completion_reports_error_once() {
        let h = harness(FetchStatus::Rejected);
        let delivered = Delivered::default();
        let task = h.session.upload_task_with_completion(
            get("https://api.example.com/upload"),
            UploadBody::Data(Bytes::from_static(b"payload")),
            data_handler(&delivered),
        );

        assert_eq!(task.state(), TaskState::Cancelled);
        task.resume();
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].0.is_none());
        assert_eq!(
            delivered[0].1,
            Some(SessionError::ServiceError(FetchStatus::Rejected))
        );
        assert!(h.recorder.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_with_completion_reports_error_synchronously() {
        let h = harness(FetchStatus::PoorNetwork);
        let delivered = Delivered::default();
        let task = h
            .session
            .data_task_with_completion(get("https://api.example.com/a"), data_handler(&delivered));

        // Delivered before the task is returned, and never again
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(
            *delivered.lock().unwrap(),
            vec![(None, Some(SessionError::NetworkTransient(FetchStatus::PoorNetwork)))]
        );
        task.resume();
        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert!(h.recorder.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_declined_requests_keep_their_headers() {
        for status in [FetchStatus::NoNetwork, FetchStatus::Rejected] {
            let h = harness_with(status, &[]);
            let mut request = get("https://api.example.com/a");
            request
                .headers_mut()
                .insert("x-request-id", HeaderValue::from_static("42"));
            request
                .headers_mut()
                .append("accept", HeaderValue::from_static("text/plain"));
            let expected = request.headers().clone();

            let task = h.session.data_task(request);
            assert!(task.is_cancelled());
            assert_eq!(task.original_request().headers, expected, "{status}");
            let created = h.engine.created.lock().unwrap();
            assert_eq!(*created[0].0.headers(), expected, "{status}");
        }
    }

    #[test]
    fn test_tasks_grouped_by_kind() {
        let h = harness(FetchStatus::Success);
        h.session.data_task(get("https://api.example.com/a"));
        h.session.download_task(get("https://api.example.com/b"));
        h.session.download_task(get("https://api.example.com/c"));
        h.session.upload_task(
            get("https://api.example.com/d"),
            UploadBody::Data(Bytes::from_static(b"payload")),
        );

        let groups = h.session.tasks_by_kind();
        assert_eq!(groups.data.len(), 1);
        assert_eq!(groups.upload.len(), 1);
        assert_eq!(groups.download.len(), 2);
        assert!(groups.download.iter().all(|t| t.kind() == TaskKind::Download));
    }

    #[test]
    fn test_flush_and_reset_complete() {
        let h = harness(FetchStatus::Success);
        let calls = Arc::new(AtomicUsize::new(0));

        let flushed = calls.clone();
        h.session.flush(move || {
            flushed.fetch_add(1, Ordering::SeqCst);
        });
        let reset = calls.clone();
        h.session.reset(move || {
            reset.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_binding_failure_skips_service() {
        let h = harness(FetchStatus::Success);
        h.session.token_provider().set_bind_header("x-user");

        let task = h.session.data_task(get("https://api.example.com/a"));
        assert!(task.is_cancelled());
        assert_eq!(h.service.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(
            *h.recorder.errors.lock().unwrap(),
            vec![SessionError::BindingMissing("x-user".to_string())]
        );
    }

    #[test]
    fn test_resume_data_bypasses_token_fetch() {
        let h = harness(FetchStatus::Success);
        let resume = crate::engine::ResumeData {
            url: "https://api.example.com/file".to_string(),
            headers: vec![],
            partial_path: PathBuf::from("/tmp/file.part"),
            offset: 10,
        };

        let task = h
            .session
            .download_task_with_resume_data(&resume.encode().unwrap());
        assert_eq!(task.kind(), TaskKind::Download);
        assert_eq!(h.service.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.resumed.load(Ordering::SeqCst), 1);
        assert_eq!(task.original_request().headers["range"], "bytes=10-");
    }

    #[test]
    fn test_upload_spec_reaches_engine() {
        let h = harness(FetchStatus::Success);
        h.session
            .streamed_upload_task(get("https://api.example.com/stream"));
        h.session.invalidate_and_cancel();

        let created = h.engine.created.lock().unwrap();
        assert_eq!(created[0].1, TaskSpec::Upload(UploadBody::Streamed));
        assert!(h.session.all_tasks().iter().all(|t| t.is_cancelled()));
    }
}
