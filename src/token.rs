//! Attestation token provider.
//!
//! Brings the attestation service up once per process, persists its dynamic
//! configuration, keeps the pin store in step with it and turns every token
//! fetch into a [`Decision`] for the session.

use crate::attestation::{
    AttestationService, FetchStatus, KeyValueStore, ResourceBundle, CONFIG_EXTENSION,
    DYNAMIC_CONFIG_KEY, INITIAL_CONFIG_NAME,
};
use crate::config::TokenConfig;
use crate::decision::Interception;
use crate::engine::CredentialHeaders;
use crate::error::SessionError;
use crate::pinning::PinStore;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::Request;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

pub struct TokenProvider {
    service: Arc<dyn AttestationService>,
    store: Arc<dyn KeyValueStore>,
    bundle: Arc<dyn ResourceBundle>,
    pins: Arc<PinStore>,
    config: TokenConfig,
    bind_header: RwLock<String>,
    bring_up: OnceCell<Result<(), SessionError>>,
    config_writer: Mutex<()>,
}

impl TokenProvider {
    pub fn new(
        service: Arc<dyn AttestationService>,
        store: Arc<dyn KeyValueStore>,
        bundle: Arc<dyn ResourceBundle>,
        config: TokenConfig,
    ) -> Self {
        let pins = Arc::new(PinStore::new(config.pin_policy.clone()));
        Self {
            service,
            store,
            bundle,
            pins,
            config,
            bind_header: RwLock::new(String::new()),
            bring_up: OnceCell::new(),
            config_writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// The pin set the certificate verifier reads.
    pub fn pin_store(&self) -> Arc<PinStore> {
        self.pins.clone()
    }

    /// Empty when request binding is disabled.
    pub fn bind_header(&self) -> String {
        self.bind_header
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind every subsequent token to the value of `header` in the request.
    /// An empty name disables binding.
    pub fn set_bind_header(&self, header: impl Into<String>) {
        let header = header.into();
        debug!("Token binding header set to {:?}", header);
        *self.bind_header.write().unwrap_or_else(PoisonError::into_inner) = header;
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.bring_up.get(), Some(Ok(())))
    }

    /// Bring the attestation service up. Runs at most once per provider,
    /// concurrent callers wait for the first attempt and share its result.
    pub fn initialize(&self) -> Result<(), SessionError> {
        self.bring_up.get_or_init(|| self.bring_up_service()).clone()
    }

    fn bring_up_service(&self) -> Result<(), SessionError> {
        let initial = self
            .bundle
            .read_resource(INITIAL_CONFIG_NAME, CONFIG_EXTENSION)
            .map_err(|e| {
                error!("Initial attestation configuration could not be loaded: {}", e);
                SessionError::ConfigurationFailure(format!(
                    "initial configuration {INITIAL_CONFIG_NAME}.{CONFIG_EXTENSION}: {e}"
                ))
            })?;
        let dynamic = self.store.read(DYNAMIC_CONFIG_KEY);

        self.service
            .initialize(&initial, dynamic.as_deref())
            .map_err(|e| {
                error!("Attestation service initialization failed: {}", e);
                SessionError::ConfigurationFailure(e)
            })?;

        if dynamic.is_none() {
            self.persist_dynamic_config();
        }
        self.pins.refresh(self.service.as_ref());
        info!("Attestation service initialized");
        Ok(())
    }

    fn persist_dynamic_config(&self) {
        let _writer = self
            .config_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.service.fetch_current_config() {
            Some(config) => {
                if let Err(e) = self.store.write(DYNAMIC_CONFIG_KEY, &config) {
                    warn!("Failed to persist attestation configuration: {}", e);
                } else {
                    debug!("Attestation configuration persisted");
                }
            }
            None => warn!("Attestation service returned no configuration to persist"),
        }
    }

    /// Initialize and fetch a token for the configured prefetch URL on a
    /// background thread, so the first real request does not pay for it.
    pub fn prefetch(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let provider = Arc::clone(self);
        thread::Builder::new()
            .name("attestation-prefetch".to_string())
            .spawn(move || {
                if let Err(e) = provider.initialize() {
                    warn!("Prefetch skipped: {}", e);
                    return;
                }
                let Some(url) = provider.config.prefetch_url.as_deref() else {
                    return;
                };
                let result = provider.service.fetch_token_blocking(url);
                if result.is_config_changed {
                    provider.persist_dynamic_config();
                    provider.pins.refresh(provider.service.as_ref());
                }
                info!("Prefetch for {} finished with {}", url, result.status);
            })
    }

    /// Fetch a token for `request` and decide what the session does with it.
    ///
    /// Blocks the calling thread for as long as the attestation service
    /// takes. The token header, when added, replaces any existing value.
    pub fn fetch_token(&self, mut request: Request<Bytes>) -> Interception {
        if let Err(e) = self.initialize() {
            return Interception::fail(request, e);
        }

        let bind_header = self.bind_header();
        if bind_header.is_empty() {
            self.service.set_request_binding_value("");
        } else {
            match request.headers().get(bind_header.as_str()) {
                Some(value) => self
                    .service
                    .set_request_binding_value(&String::from_utf8_lossy(value.as_bytes())),
                None => {
                    warn!("Request to {} lacks binding header {}", request.uri(), bind_header);
                    return Interception::fail(request, SessionError::BindingMissing(bind_header));
                }
            }
        }

        let url = request.uri().to_string();
        let result = self.service.fetch_token_blocking(&url);
        info!("Token for {}: {} ({})", url, result.loggable_token, result.status);

        if result.is_config_changed {
            self.persist_dynamic_config();
            self.pins.refresh(self.service.as_ref());
        }

        match result.status {
            FetchStatus::Success => {
                let value = format!("{}{}", self.config.token_prefix, result.token);
                match HeaderValue::from_str(&value) {
                    Ok(value) => {
                        request
                            .headers_mut()
                            .insert(self.config.token_header.clone(), value);
                        Interception::proceed(request, result.status.to_string())
                    }
                    Err(_) => Interception::fail(
                        request,
                        SessionError::InvalidRequest(
                            "token is not a valid header value".to_string(),
                        ),
                    ),
                }
            }
            FetchStatus::NoNetwork | FetchStatus::PoorNetwork | FetchStatus::MitmDetected => {
                Interception::retry(request, SessionError::NetworkTransient(result.status))
            }
            FetchStatus::UnprotectedUrl
            | FetchStatus::UnknownUrl
            | FetchStatus::NoAttestationService => {
                Interception::proceed(request, result.status.to_string())
            }
            status => Interception::fail(request, SessionError::ServiceError(status)),
        }
    }
}

impl CredentialHeaders for TokenProvider {
    /// The token header, plus the binding header while binding is enabled.
    fn credential_headers(&self) -> Vec<HeaderName> {
        let mut headers = vec![self.config.token_header.clone()];
        if let Ok(bind_header) = HeaderName::from_bytes(self.bind_header().as_bytes()) {
            headers.push(bind_header);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{HostPins, MemoryStore, TokenFetchResult};
    use crate::decision::Decision;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    /// Replays queued fetch results and records what it was asked.
    #[derive(Default)]
    struct ScriptedService {
        results: Mutex<VecDeque<TokenFetchResult>>,
        config: Mutex<String>,
        pins: Mutex<HostPins>,
        initializations: AtomicUsize,
        fetches: AtomicUsize,
        seen_dynamic: Mutex<Option<String>>,
        bindings: Mutex<Vec<String>>,
        fail_initialize: bool,
        initialize_delay: Option<Duration>,
    }

    impl ScriptedService {
        fn push(&self, result: TokenFetchResult) {
            self.results.lock().unwrap().push_back(result);
        }

        fn success(token: &str) -> TokenFetchResult {
            TokenFetchResult {
                status: FetchStatus::Success,
                token: token.to_string(),
                loggable_token: "redacted".to_string(),
                is_config_changed: false,
            }
        }
    }

    impl AttestationService for ScriptedService {
        fn initialize(&self, initial: &str, dynamic: Option<&str>) -> Result<(), String> {
            self.initializations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.initialize_delay {
                thread::sleep(delay);
            }
            if self.fail_initialize {
                return Err("rejected configuration".to_string());
            }
            *self.seen_dynamic.lock().unwrap() = dynamic.map(str::to_string);
            let mut config = self.config.lock().unwrap();
            if config.is_empty() {
                *config = dynamic.unwrap_or(initial).to_string();
            }
            Ok(())
        }

        fn fetch_token_blocking(&self, _url: &str) -> TokenFetchResult {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| TokenFetchResult::with_status(FetchStatus::InternalError))
        }

        fn fetch_current_config(&self) -> Option<String> {
            Some(self.config.lock().unwrap().clone())
        }

        fn pins(&self, _policy: &str) -> Option<HostPins> {
            Some(self.pins.lock().unwrap().clone())
        }

        fn set_request_binding_value(&self, value: &str) {
            self.bindings.lock().unwrap().push(value.to_string());
        }
    }

    struct Bundle(Option<&'static str>);

    impl ResourceBundle for Bundle {
        fn read_resource(&self, _name: &str, _extension: &str) -> io::Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not bundled"))
        }
    }

    fn provider_with(
        service: Arc<ScriptedService>,
        store: Arc<MemoryStore>,
        config: TokenConfig,
    ) -> TokenProvider {
        TokenProvider::new(service, store, Arc::new(Bundle(Some("initial"))), config)
    }

    fn provider() -> (TokenProvider, Arc<ScriptedService>, Arc<MemoryStore>) {
        let service = Arc::new(ScriptedService::default());
        let store = Arc::new(MemoryStore::new());
        let provider = provider_with(service.clone(), store.clone(), TokenConfig::default());
        (provider, service, store)
    }

    fn get(url: &str) -> Request<Bytes> {
        Request::get(url).body(Bytes::new()).unwrap()
    }

    #[test]
    fn test_first_run_persists_initial_config() {
        let (provider, service, store) = provider();
        provider.initialize().unwrap();
        provider.initialize().unwrap();

        assert_eq!(service.initializations.load(Ordering::SeqCst), 1);
        assert_eq!(store.read(DYNAMIC_CONFIG_KEY).as_deref(), Some("initial"));
        assert!(service.seen_dynamic.lock().unwrap().is_none());
        assert!(provider.is_initialized());
    }

    #[test]
    fn test_later_run_passes_stored_config() {
        let service = Arc::new(ScriptedService::default());
        let store = Arc::new(MemoryStore::new());
        store.write(DYNAMIC_CONFIG_KEY, "dynamic-v2").unwrap();

        let provider = provider_with(service.clone(), store.clone(), TokenConfig::default());
        provider.initialize().unwrap();

        assert_eq!(
            service.seen_dynamic.lock().unwrap().as_deref(),
            Some("dynamic-v2")
        );
        assert_eq!(store.read(DYNAMIC_CONFIG_KEY).as_deref(), Some("dynamic-v2"));
    }

    #[test]
    fn test_missing_bundle_is_a_configuration_failure() {
        let service = Arc::new(ScriptedService::default());
        let provider = TokenProvider::new(
            service.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(Bundle(None)),
            TokenConfig::default(),
        );

        let interception = provider.fetch_token(get("https://api.example.com/"));
        assert!(matches!(
            interception.decision,
            Decision::Fail(SessionError::ConfigurationFailure(_))
        ));
        assert_eq!(service.initializations.load(Ordering::SeqCst), 0);
        assert_eq!(service.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejected_configuration_is_remembered() {
        let service = Arc::new(ScriptedService {
            fail_initialize: true,
            ..Default::default()
        });
        let provider = provider_with(
            service.clone(),
            Arc::new(MemoryStore::new()),
            TokenConfig::default(),
        );

        assert!(provider.initialize().is_err());
        assert!(provider.initialize().is_err());
        assert_eq!(service.initializations.load(Ordering::SeqCst), 1);
        assert!(!provider.is_initialized());
    }

    #[test]
    fn test_success_sets_prefixed_header() {
        let service = Arc::new(ScriptedService::default());
        let config = TokenConfig::builder()
            .token_prefix("Bearer ")
            .build()
            .unwrap();
        let provider = provider_with(service.clone(), Arc::new(MemoryStore::new()), config);
        service.push(ScriptedService::success("abc"));

        let mut request = get("https://api.example.com/v1");
        request
            .headers_mut()
            .insert("attestation-token", HeaderValue::from_static("stale"));
        let interception = provider.fetch_token(request);

        assert_eq!(interception.decision, Decision::Proceed);
        let values: Vec<_> = interception
            .request
            .headers()
            .get_all("attestation-token")
            .iter()
            .collect();
        assert_eq!(values, vec!["Bearer abc"]);
        assert_eq!(interception.message, "SUCCESS");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (FetchStatus::NoNetwork, "retry"),
            (FetchStatus::PoorNetwork, "retry"),
            (FetchStatus::MitmDetected, "retry"),
            (FetchStatus::UnprotectedUrl, "proceed"),
            (FetchStatus::UnknownUrl, "proceed"),
            (FetchStatus::NoAttestationService, "proceed"),
            (FetchStatus::BadUrl, "fail"),
            (FetchStatus::NotInitialized, "fail"),
            (FetchStatus::Rejected, "fail"),
            (FetchStatus::InternalError, "fail"),
        ];
        let (provider, service, _) = provider();

        for (status, expected) in cases {
            service.push(TokenFetchResult::with_status(status));
            let interception = provider.fetch_token(get("https://api.example.com/"));

            assert!(
                interception.request.headers().get("attestation-token").is_none(),
                "{status} must not add a token"
            );
            match (&interception.decision, expected) {
                (Decision::Proceed, "proceed") => {}
                (Decision::Retry(SessionError::NetworkTransient(s)), "retry") => {
                    assert_eq!(*s, status)
                }
                (Decision::Fail(SessionError::ServiceError(s)), "fail") => assert_eq!(*s, status),
                (other, _) => panic!("{status}: unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn test_binding_header_required_when_set() {
        let (provider, service, _) = provider();
        provider.set_bind_header("Authorization");
        service.push(ScriptedService::success("t"));

        let interception = provider.fetch_token(get("https://api.example.com/"));
        assert_eq!(
            interception.decision,
            Decision::Fail(SessionError::BindingMissing("Authorization".to_string()))
        );
        assert_eq!(service.fetches.load(Ordering::SeqCst), 0);

        let mut request = get("https://api.example.com/");
        request
            .headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer user"));
        let interception = provider.fetch_token(request);
        assert_eq!(interception.decision, Decision::Proceed);
        assert_eq!(*service.bindings.lock().unwrap(), vec!["Bearer user"]);

        provider.set_bind_header("");
        service.push(ScriptedService::success("t"));
        let interception = provider.fetch_token(get("https://api.example.com/"));
        assert_eq!(interception.decision, Decision::Proceed);
        // Disabling binding clears the value committed before
        assert_eq!(*service.bindings.lock().unwrap(), vec!["Bearer user", ""]);
    }

    #[test]
    fn test_concurrent_initialize_runs_once() {
        const THREADS: usize = 8;
        let service = Arc::new(ScriptedService {
            initialize_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider_with(
            service.clone(),
            store.clone(),
            TokenConfig::default(),
        ));
        for _ in 0..THREADS / 2 {
            service.push(ScriptedService::success("t"));
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let provider = Arc::clone(&provider);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        provider.initialize().is_ok()
                    } else {
                        let interception = provider.fetch_token(get("https://api.example.com/"));
                        interception.decision == Decision::Proceed
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(service.initializations.load(Ordering::SeqCst), 1);
        assert_eq!(service.fetches.load(Ordering::SeqCst), THREADS / 2);
        assert_eq!(store.read(DYNAMIC_CONFIG_KEY).as_deref(), Some("initial"));
    }

    #[test]
    fn test_bind_header_concurrent_updates() {
        let (provider, _, _) = provider();
        let provider = &provider;

        thread::scope(|scope| {
            for name in ["x-user", "x-device"] {
                scope.spawn(move || {
                    for _ in 0..500 {
                        provider.set_bind_header(name);
                        provider.set_bind_header("");
                    }
                });
            }
            for _ in 0..2 {
                scope.spawn(move || {
                    for _ in 0..500 {
                        let header = provider.bind_header();
                        assert!(
                            ["", "x-user", "x-device"].contains(&header.as_str()),
                            "torn bind header {header:?}"
                        );
                    }
                });
            }
        });

        provider.set_bind_header("x-final");
        assert_eq!(provider.bind_header(), "x-final");
    }

    #[test]
    fn test_credential_headers_follow_binding() {
        let (provider, _, _) = provider();
        let token = HeaderName::from_static("attestation-token");
        assert_eq!(provider.credential_headers(), vec![token.clone()]);

        provider.set_bind_header("X-User");
        assert_eq!(
            provider.credential_headers(),
            vec![token.clone(), HeaderName::from_static("x-user")]
        );

        provider.set_bind_header("");
        assert_eq!(provider.credential_headers(), vec![token]);
    }

    #[test]
    fn test_config_change_persists_and_refreshes_pins() {
        let (provider, service, store) = provider();
        provider.initialize().unwrap();
        assert!(provider.pin_store().current().is_empty());

        *service.config.lock().unwrap() = "rotated".to_string();
        *service.pins.lock().unwrap() =
            HostPins::from([("api.example.com".to_string(), vec!["CCCC".to_string()])]);
        service.push(TokenFetchResult {
            is_config_changed: true,
            ..ScriptedService::success("t")
        });

        let interception = provider.fetch_token(get("https://api.example.com/"));
        assert_eq!(interception.decision, Decision::Proceed);
        assert_eq!(store.read(DYNAMIC_CONFIG_KEY).as_deref(), Some("rotated"));
        assert!(provider
            .pin_store()
            .current()
            .contains("api.example.com", "CCCC"));
    }

    #[test]
    fn test_prefetch_fetches_configured_url() {
        let service = Arc::new(ScriptedService::default());
        let config = TokenConfig::builder()
            .prefetch_url("https://api.example.com/warmup")
            .build()
            .unwrap();
        let provider = Arc::new(provider_with(
            service.clone(),
            Arc::new(MemoryStore::new()),
            config,
        ));
        service.push(ScriptedService::success("warm"));

        provider.prefetch().unwrap().join().unwrap();
        assert!(provider.is_initialized());
        assert_eq!(service.fetches.load(Ordering::SeqCst), 1);
    }
}
