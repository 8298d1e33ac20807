//! The attestation service seam.
//!
//! The attestation backend is an opaque external service. The session only
//! needs five capabilities from it: bring-up with an initial and an optional
//! persisted configuration, a blocking token fetch, the current configuration
//! blob, the pin set for a policy, and request binding.

mod ephemeral;
mod store;

pub use ephemeral::{load_signing_key, EphemeralAttestationService, ServiceConfig, TokenClaims};
pub use store::{
    DirectoryBundle, FileStore, KeyValueStore, MemoryStore, ResourceBundle, CONFIG_EXTENSION,
    DYNAMIC_CONFIG_KEY, INITIAL_CONFIG_NAME,
};

use std::collections::HashMap;
use strum::{Display, IntoStaticStr};

/// Pins keyed by host: base64 SHA-256 of acceptable SubjectPublicKeyInfo blobs.
pub type HostPins = HashMap<String, Vec<String>>;

/// Outcome of a token fetch as reported by the attestation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Success,
    NoNetwork,
    PoorNetwork,
    MitmDetected,
    UnprotectedUrl,
    UnknownUrl,
    NoAttestationService,
    BadUrl,
    NotInitialized,
    Rejected,
    InternalError,
}

/// Result of [`AttestationService::fetch_token_blocking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFetchResult {
    pub status: FetchStatus,
    /// Empty unless `status` is [`FetchStatus::Success`].
    pub token: String,
    /// A form of the token that is safe to write to logs.
    pub loggable_token: String,
    /// The service-side configuration changed during this fetch.
    pub is_config_changed: bool,
}

impl TokenFetchResult {
    pub fn with_status(status: FetchStatus) -> Self {
        Self {
            status,
            token: String::new(),
            loggable_token: String::new(),
            is_config_changed: false,
        }
    }
}

/// Client of the external attestation service.
///
/// Every method may block the calling thread. `fetch_token_blocking` in
/// particular may perform network I/O and is slow on first use.
pub trait AttestationService: Send + Sync {
    /// Bring the service up. `dynamic_config` is the last persisted
    /// configuration, absent on first run.
    fn initialize(&self, initial_config: &str, dynamic_config: Option<&str>)
        -> Result<(), String>;

    fn fetch_token_blocking(&self, url: &str) -> TokenFetchResult;

    /// The full current configuration blob, for persistence.
    fn fetch_current_config(&self) -> Option<String>;

    fn pins(&self, policy: &str) -> Option<HostPins>;

    /// Commit the next fetched token to `value`. An empty value clears the
    /// binding.
    fn set_request_binding_value(&self, value: &str);
}
