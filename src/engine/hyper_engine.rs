//! tokio + hyper + rustls implementation of [`HttpEngine`].
//!
//! Every request opens its own connection. TLS server authentication is
//! routed through the session delegate by [`TrustBridge`], so the delegate's
//! answer is what decides whether a handshake completes.

use crate::config::SessionConfiguration;
use crate::engine::{
    AuthChallenge, ChallengeDisposition, Completion, Credential, CredentialHeaders, HttpEngine,
    RequestHead, ResponseHead, ResumeData, SessionTask, TaskSpec, TaskState, TransferOutcome,
    TrustBridge, UploadBody,
};
use crate::error::{Result, SessionError};
use crate::session::{dispatch_challenge, ResponseDisposition, SessionDelegate};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION,
    WWW_AUTHENTICATE,
};
use hyper::http::uri::InvalidUri;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub struct HyperEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    runtime: Handle,
    delegate: Arc<dyn SessionDelegate>,
    credentials: Arc<dyn CredentialHeaders>,
    platform: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    download_dir: PathBuf,
    max_redirects: usize,
    tasks: Mutex<Vec<SessionTask>>,
    invalidated: AtomicBool,
    invalidation_reported: AtomicBool,
}

/// Everything a task needs once it is started.
struct Job {
    request: Request<Bytes>,
    spec: TaskSpec,
    resume: Option<ResumeData>,
    completion: Option<Completion>,
    /// Reported instead of running the transfer.
    early_error: Option<SessionError>,
}

struct Transferred {
    response: ResponseHead,
    body: Option<Bytes>,
    location: Option<PathBuf>,
}

impl HyperEngine {
    /// Transfers run on `runtime`. Platform trust uses the bundled web PKI
    /// roots plus the configuration's extra anchors. `credentials` names the
    /// headers stripped from cross-origin redirects.
    pub fn new(
        runtime: Handle,
        delegate: Arc<dyn SessionDelegate>,
        credentials: Arc<dyn CredentialHeaders>,
        configuration: &SessionConfiguration,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for anchor in &configuration.extra_root_certificates {
            roots
                .add(anchor.clone())
                .map_err(|e| SessionError::Transport(format!("invalid trust anchor: {e}")))?;
        }
        let platform =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| SessionError::Transport(format!("failed to build verifier: {e}")))?;

        Ok(Self {
            shared: Arc::new(EngineShared {
                runtime,
                delegate,
                credentials,
                platform,
                provider,
                download_dir: configuration.download_dir.clone(),
                max_redirects: configuration.max_redirects,
                tasks: Mutex::new(Vec::new()),
                invalidated: AtomicBool::new(false),
                invalidation_reported: AtomicBool::new(false),
            }),
        })
    }
}

impl HttpEngine for HyperEngine {
    fn create_task(
        &self,
        request: Request<Bytes>,
        spec: TaskSpec,
        completion: Option<Completion>,
    ) -> SessionTask {
        let early_error = self
            .shared
            .invalidated
            .load(Ordering::SeqCst)
            .then_some(SessionError::Invalidated);
        self.shared.spawn_task(Job {
            request,
            spec,
            resume: None,
            completion,
            early_error,
        })
    }

    fn resume_download(&self, resume_data: &[u8], completion: Option<Completion>) -> SessionTask {
        let decoded = ResumeData::decode(resume_data)
            .and_then(|resume| Ok((resume.to_request()?, resume)));
        let job = match decoded {
            Ok((request, resume)) => Job {
                request,
                spec: TaskSpec::Download,
                resume: Some(resume),
                completion,
                early_error: None,
            },
            Err(e) => Job {
                request: Request::new(Bytes::new()),
                spec: TaskSpec::Download,
                resume: None,
                completion,
                early_error: Some(e),
            },
        };
        self.shared.spawn_task(job)
    }

    fn finish_tasks_and_invalidate(&self) {
        info!("Session invalidated, waiting for running tasks");
        self.shared.invalidated.store(true, Ordering::SeqCst);
        if self.shared.lock_tasks().is_empty() {
            self.shared.report_invalidation();
        }
    }

    fn invalidate_and_cancel(&self) {
        info!("Session invalidated, cancelling tasks");
        self.shared.invalidated.store(true, Ordering::SeqCst);
        let tasks = self.shared.lock_tasks().clone();
        if tasks.is_empty() {
            self.shared.report_invalidation();
        }
        for task in tasks {
            task.cancel();
        }
    }

    fn all_tasks(&self) -> Vec<SessionTask> {
        self.shared
            .lock_tasks()
            .iter()
            .filter(|task| task.state() != TaskState::Completed)
            .cloned()
            .collect()
    }

    // Connections are never pooled and nothing is cached, so there is no
    // state to write out or drop.
    fn flush(&self, done: Box<dyn FnOnce() + Send>) {
        self.shared.runtime.spawn(async move { done() });
    }

    fn reset(&self, done: Box<dyn FnOnce() + Send>) {
        debug!("Session reset");
        self.shared.runtime.spawn(async move { done() });
    }
}

impl EngineShared {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<SessionTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_task(self: &Arc<Self>, job: Job) -> SessionTask {
        let head = RequestHead::from(&job.request);
        let kind = job.spec.kind();
        let shared = Arc::clone(self);
        let task = SessionTask::new(
            kind,
            head,
            Box::new(move |task: SessionTask| {
                let runtime = shared.runtime.clone();
                runtime.spawn(shared.run(task, job));
            }),
        );
        self.lock_tasks().push(task.clone());
        task
    }

    fn report_invalidation(&self) {
        if !self.invalidation_reported.swap(true, Ordering::SeqCst) {
            self.delegate.did_become_invalid(None);
        }
    }

    async fn run(self: Arc<Self>, task: SessionTask, job: Job) {
        let Job {
            request,
            spec,
            resume,
            completion,
            early_error,
        } = job;

        let result = match early_error {
            Some(e) => Err(e),
            None if task.is_cancelled() => Err(SessionError::Cancelled),
            None => {
                tokio::select! {
                    biased;
                    _ = task.cancelled() => Err(SessionError::Cancelled),
                    result = self.transfer(&task, request, &spec, resume) => result,
                }
            }
        };
        self.finish(&task, result, completion);
    }

    fn finish(
        &self,
        task: &SessionTask,
        result: Result<Transferred>,
        completion: Option<Completion>,
    ) {
        let outcome = match result {
            Ok(transferred) => {
                if let (Some(location), Some(delegate)) =
                    (&transferred.location, self.delegate.download_delegate())
                {
                    delegate.did_finish_downloading_to(task, location);
                }
                TransferOutcome {
                    body: transferred.body,
                    location: transferred.location,
                    response: Some(transferred.response),
                    error: None,
                }
            }
            Err(e) => {
                debug!("Task {} failed: {}", task.id(), e);
                TransferOutcome::failed(e)
            }
        };

        if let Some(delegate) = self.delegate.task_delegate() {
            delegate.did_complete(task, outcome.error.as_ref());
        }
        if let Some(completion) = completion {
            completion.deliver(outcome);
        }
        task.mark_completed();

        let drained = {
            let mut tasks = self.lock_tasks();
            tasks.retain(|t| t != task);
            tasks.is_empty()
        };
        if drained && self.invalidated.load(Ordering::SeqCst) {
            self.report_invalidation();
        }
    }

    async fn transfer(
        &self,
        task: &SessionTask,
        request: Request<Bytes>,
        spec: &TaskSpec,
        mut resume: Option<ResumeData>,
    ) -> Result<Transferred> {
        let (parts, body) = request.into_parts();
        let mut head = RequestHead {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        };
        let mut body = match spec {
            TaskSpec::Upload(upload) => self.upload_body(task, upload).await?,
            TaskSpec::Data | TaskSpec::Download => body,
        };

        let mut redirects = 0;
        let mut challenge_answered = false;
        loop {
            let response = self.send(task, &head, body.clone()).await?;
            let response_head = ResponseHead {
                url: head.uri.clone(),
                status: response.status(),
                headers: response.headers().clone(),
            };

            let credentials = self.credentials.credential_headers();
            if let Some(next) = redirect_request(&head, &response_head, &credentials)? {
                if redirects >= self.max_redirects {
                    return Err(SessionError::Transport(format!(
                        "too many redirects ({redirects})"
                    )));
                }
                let followed = match self.delegate.task_delegate() {
                    Some(delegate) => {
                        delegate.will_perform_redirection(task, &response_head, next)
                    }
                    None => Some(next),
                };
                if let Some(next) = followed {
                    redirects += 1;
                    if next.method != head.method {
                        body = Bytes::new();
                    }
                    debug!("Following redirect to {}", next.uri);
                    head = next;
                    continue;
                }
            }

            if response_head.status == StatusCode::UNAUTHORIZED && !challenge_answered {
                let challenge = response_head
                    .headers
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| {
                        AuthChallenge::from_www_authenticate(head.uri.host().unwrap_or_default(), v)
                    });
                if let Some(challenge) = challenge {
                    challenge_answered = true;
                    match dispatch_challenge(self.delegate.as_ref(), task, &challenge) {
                        ChallengeDisposition::UseCredential(Credential::Authorization(value)) => {
                            head.headers.insert(AUTHORIZATION, value);
                            continue;
                        }
                        ChallengeDisposition::CancelAuthenticationChallenge => {
                            return Err(SessionError::Cancelled)
                        }
                        _ => {}
                    }
                }
            }

            let body = response.into_body();
            return match spec {
                TaskSpec::Download => {
                    self.download(task, &head, response_head, body, resume.take())
                        .await
                }
                TaskSpec::Data | TaskSpec::Upload(_) => {
                    self.receive(task, response_head, body).await
                }
            };
        }
    }

    async fn upload_body(&self, task: &SessionTask, upload: &UploadBody) -> Result<Bytes> {
        match upload {
            UploadBody::Data(data) => Ok(data.clone()),
            UploadBody::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            UploadBody::Streamed => {
                let mut stream = self
                    .delegate
                    .task_delegate()
                    .and_then(|delegate| delegate.need_new_body_stream(task))
                    .ok_or_else(|| {
                        SessionError::InvalidRequest(
                            "no body stream provided for streamed upload".to_string(),
                        )
                    })?;
                let mut buffer = Vec::new();
                stream.read_to_end(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    async fn send(
        &self,
        task: &SessionTask,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let uri = &head.uri;
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(SessionError::InvalidRequest(format!("unsupported URL {uri}"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| SessionError::InvalidRequest(format!("URL without host {uri}")))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        debug!("Connecting to {}:{}{}", host, port, uri.path());
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            SessionError::Transport(format!("Failed to connect to {host}:{port}: {e}"))
        })?;

        let sent = body.len() as u64;
        let request = build_request(head, body)?;

        let response = if https {
            let bridge =
                TrustBridge::new(self.delegate.clone(), task.clone(), self.platform.clone());
            let rejection = bridge.rejection();
            let tls_config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
                .with_safe_default_protocol_versions()
                .map_err(|e| SessionError::Transport(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(bridge))
                .with_no_client_auth();
            let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                SessionError::InvalidRequest(format!("invalid server name {host}: {e}"))
            })?;

            let tls_stream = match TlsConnector::from(Arc::new(tls_config))
                .connect(server_name, stream)
                .await
            {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    let rejected = rejection
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    return Err(rejected.unwrap_or_else(|| {
                        SessionError::Transport(format!("TLS handshake with {host} failed: {e}"))
                    }));
                }
            };
            exchange(TokioIo::new(tls_stream), request).await?
        } else {
            exchange(TokioIo::new(stream), request).await?
        };

        if sent > 0 {
            task.record_sent(sent);
            if let Some(delegate) = self.delegate.task_delegate() {
                delegate.did_send_body_data(task, sent, task.progress().bytes_sent, sent);
            }
        }
        Ok(response)
    }

    async fn receive(
        &self,
        task: &SessionTask,
        response: ResponseHead,
        mut body: Incoming,
    ) -> Result<Transferred> {
        if let Some(delegate) = self.delegate.data_delegate() {
            if delegate.did_receive_response(task, &response) == ResponseDisposition::Cancel {
                return Err(SessionError::Cancelled);
            }
        }

        let expected = response.expected_content_length();
        let mut collected = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(chunk) = frame?.into_data() {
                task.record_received(chunk.len() as u64, expected);
                if let Some(delegate) = self.delegate.data_delegate() {
                    delegate.did_receive_data(task, &chunk);
                }
                collected.extend_from_slice(&chunk);
            }
        }

        Ok(Transferred {
            response,
            body: Some(Bytes::from(collected)),
            location: None,
        })
    }

    async fn download(
        &self,
        task: &SessionTask,
        head: &RequestHead,
        response: ResponseHead,
        mut body: Incoming,
        resume: Option<ResumeData>,
    ) -> Result<Transferred> {
        let resume = resume.filter(|_| response.status == StatusCode::PARTIAL_CONTENT);
        let (path, offset) = match &resume {
            Some(resume) => (resume.partial_path.clone(), resume.offset),
            None => (
                self.download_dir.join(format!("download-{}.part", task.id())),
                0,
            ),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = if resume.is_some() {
            let file = OpenOptions::new().append(true).open(&path).await?;
            file.set_len(offset).await?;
            file
        } else {
            File::create(&path).await?
        };

        let expected = response.expected_content_length().map(|len| len + offset);
        let download_delegate = self.delegate.download_delegate();
        if offset > 0 {
            if let Some(delegate) = download_delegate {
                delegate.did_resume_at_offset(task, offset, expected);
            }
        }

        let mut written = offset;
        while let Some(frame) = body.frame().await {
            if let Ok(chunk) = frame?.into_data() {
                file.write_all(&chunk).await?;
                let len = chunk.len() as u64;
                written += len;
                task.record_received(len, expected);
                task.set_resume_data(ResumeData::from_request(head, path.clone(), written));
                if let Some(delegate) = download_delegate {
                    delegate.did_write_data(task, len, written, expected);
                }
            }
        }
        file.flush().await?;
        debug!("Downloaded {} bytes to {}", written, path.display());

        Ok(Transferred {
            response,
            body: None,
            location: Some(path),
        })
    }
}

fn build_request(head: &RequestHead, body: Bytes) -> Result<Request<Full<Bytes>>> {
    let path = head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = Request::builder()
        .method(head.method.clone())
        .uri(path)
        .body(Full::new(body))
        .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = head.headers.clone();

    if !request.headers().contains_key(HOST) {
        if let Some(authority) = head.uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(HOST, value);
        }
    }
    Ok(request)
}

async fn exchange<T>(io: TokioIo<T>, request: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection closed: {}", e);
        }
    });

    Ok(sender.send_request(request).await?)
}

/// The request to issue for a redirect response, if it is one. `credentials`
/// and `Authorization` only follow a redirect that stays on the same origin.
fn redirect_request(
    head: &RequestHead,
    response: &ResponseHead,
    credentials: &[HeaderName],
) -> Result<Option<RequestHead>> {
    let status = response.status;
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = response.headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        warn!("{} redirect without a usable Location header", status);
        return Ok(None);
    };
    let uri = resolve_location(&head.uri, location)?;

    let method = if status == StatusCode::SEE_OTHER
        || (matches!(status.as_u16(), 301 | 302) && head.method == Method::POST)
    {
        Method::GET
    } else {
        head.method.clone()
    };

    let mut headers = head.headers.clone();
    if method != head.method {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if uri.scheme() != head.uri.scheme() || uri.authority() != head.uri.authority() {
        headers.remove(AUTHORIZATION);
        headers.remove(HOST);
        for name in credentials {
            headers.remove(name);
        }
    }

    Ok(Some(RequestHead {
        method,
        uri,
        headers,
    }))
}

/// Resolve a `Location` value against the URL that produced it.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let invalid =
        |e: String| SessionError::InvalidRequest(format!("invalid redirect {location}: {e}"));
    let scheme = base.scheme_str().unwrap_or("https");

    // Fragments never reach the server
    let location = location.split('#').next().unwrap_or_default();
    let has_scheme = location
        .split(|c: char| c == '/' || c == '?')
        .next()
        .is_some_and(|first| first.contains(':'));
    if has_scheme {
        return location.parse().map_err(|e: InvalidUri| invalid(e.to_string()));
    }
    if let Some(network_path) = location.strip_prefix("//") {
        return format!("{scheme}://{network_path}")
            .parse()
            .map_err(|e: InvalidUri| invalid(e.to_string()));
    }

    let (path, query) = match location.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (location, None),
    };
    let path = if path.is_empty() {
        base.path().to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        let base_path = base.path();
        let dir_end = base_path.rfind('/').map(|i| i + 1).unwrap_or(0);
        format!("{}{}", &base_path[..dir_end], path)
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    Uri::builder()
        .scheme(scheme)
        .authority(base.authority().map(|a| a.as_str()).unwrap_or_default())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| invalid(e.to_string()))
}
