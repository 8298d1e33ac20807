use crate::pinning::{UnpinnedHosts, PUBLIC_KEY_SHA256_POLICY};
use derive_builder::Builder;
use hyper::header::HeaderName;
use hyper::HeaderMap;
use rustls::pki_types::CertificateDer;
use std::path::PathBuf;

/// Header carrying the attestation token unless configured otherwise.
pub const DEFAULT_TOKEN_HEADER: &str = "attestation-token";
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Settings of the token provider.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct TokenConfig {
    /// Header the token is written to
    #[builder(default = "HeaderName::from_static(DEFAULT_TOKEN_HEADER)")]
    pub token_header: HeaderName,
    /// Prepended to the token value, e.g. `Bearer `
    #[builder(setter(into), default)]
    pub token_prefix: String,
    /// Pin policy requested from the attestation service
    #[builder(setter(into), default = "PUBLIC_KEY_SHA256_POLICY.to_string()")]
    pub pin_policy: String,
    /// URL fetched once by [`TokenProvider::prefetch`](crate::TokenProvider::prefetch)
    #[builder(setter(into, strip_option), default)]
    pub prefetch_url: Option<String>,
}

impl TokenConfig {
    pub fn builder() -> TokenConfigBuilder {
        TokenConfigBuilder::default()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_header: HeaderName::from_static(DEFAULT_TOKEN_HEADER),
            token_prefix: String::new(),
            pin_policy: PUBLIC_KEY_SHA256_POLICY.to_string(),
            prefetch_url: None,
        }
    }
}

/// Settings of an attested session and its engine.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct SessionConfiguration {
    /// Added to every request that does not already carry the header
    #[builder(default)]
    pub additional_headers: HeaderMap,
    /// Where download tasks write their files
    #[builder(setter(into), default = "std::env::temp_dir()")]
    pub download_dir: PathBuf,
    /// Trust anchors in addition to the bundled web PKI roots
    #[builder(default)]
    pub extra_root_certificates: Vec<CertificateDer<'static>>,
    #[builder(default = "DEFAULT_MAX_REDIRECTS")]
    pub max_redirects: usize,
    /// Policy for hosts absent from the pin set
    #[builder(default)]
    pub unpinned_hosts: UnpinnedHosts,
}

impl SessionConfiguration {
    pub fn builder() -> SessionConfigurationBuilder {
        SessionConfigurationBuilder::default()
    }
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            additional_headers: HeaderMap::new(),
            download_dir: std::env::temp_dir(),
            extra_root_certificates: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            unpinned_hosts: UnpinnedHosts::default(),
        }
    }
}
