//! In-process attestation service for development and tests.
//!
//! Plays the part of the remote attestation backend without leaving the
//! process: it keeps a JSON configuration (protected hosts, pins, token
//! lifetime) and issues tokens signed with a local secp256k1 key.

use super::{AttestationService, FetchStatus, HostPins, TokenFetchResult};
use crate::pinning::PUBLIC_KEY_SHA256_POLICY;
use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper::Uri;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

fn default_token_ttl() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

/// Service-side configuration, also the dynamic configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub version: u64,
    /// Hosts whose requests need a token. Everything else is unprotected.
    #[serde(default)]
    pub protected_hosts: Vec<String>,
    #[serde(default)]
    pub pins: HostPins,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl ServiceConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse attestation service config")
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("Failed to serialize attestation service config")
    }
}

/// Claims carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub host: String,
    /// Expiry, seconds since the UNIX epoch.
    pub exp: i64,
    /// Hex SHA-256 of the request binding value, if one was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

impl TokenClaims {
    /// Hex SHA-256 of a binding value, as stored in [`TokenClaims::bind`].
    pub fn binding_hash(value: &str) -> String {
        hex::encode(Sha256::digest(value.as_bytes()))
    }
}

#[derive(Default)]
struct State {
    config: Option<ServiceConfig>,
    binding: Option<String>,
    config_changed: bool,
}

/// Attestation service running inside the process.
pub struct EphemeralAttestationService {
    signing_key: SigningKey,
    state: Mutex<State>,
}

impl EphemeralAttestationService {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            state: Mutex::new(State::default()),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.signing_key)
    }

    /// Replace the service-side configuration. The next token fetch reports
    /// the change so the session persists it.
    pub fn publish_config(&self, config: ServiceConfig) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Publishing attestation config version {}", config.version);
        state.config = Some(config);
        state.config_changed = true;
    }

    pub fn current_config(&self) -> Option<ServiceConfig> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.config.clone()
    }

    /// Check a token's signature and return its claims.
    pub fn verify_token(&self, token: &str) -> Option<TokenClaims> {
        let (payload, signature) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let signature = Signature::from_slice(&hex::decode(signature).ok()?).ok()?;

        self.signing_key
            .verifying_key()
            .verify(&payload, &signature)
            .ok()?;

        serde_json::from_slice(&payload).ok()
    }

    fn issue(&self, claims: &TokenClaims) -> anyhow::Result<(String, String)> {
        let payload = serde_json::to_vec(claims).context("Failed to serialize token claims")?;
        let signature: Signature = self.signing_key.sign(&payload);
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            hex::encode(signature.to_bytes())
        );
        let loggable = String::from_utf8_lossy(&payload).into_owned();
        Ok((token, loggable))
    }
}

impl AttestationService for EphemeralAttestationService {
    fn initialize(
        &self,
        initial_config: &str,
        dynamic_config: Option<&str>,
    ) -> Result<(), String> {
        let initial = ServiceConfig::from_json(initial_config).map_err(|e| format!("{e:#}"))?;

        let config = match dynamic_config.map(ServiceConfig::from_json) {
            Some(Ok(dynamic)) if dynamic.version >= initial.version => dynamic,
            Some(Ok(dynamic)) => {
                debug!(
                    "Ignoring stale dynamic config version {} (initial is {})",
                    dynamic.version, initial.version
                );
                initial
            }
            Some(Err(e)) => {
                warn!("Ignoring unreadable dynamic config: {:#}", e);
                initial
            }
            None => initial,
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.config = Some(config);
        state.config_changed = false;
        Ok(())
    }

    fn fetch_token_blocking(&self, url: &str) -> TokenFetchResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(config) = state.config.clone() else {
            return TokenFetchResult::with_status(FetchStatus::NotInitialized);
        };

        let host = match url.parse::<Uri>() {
            Ok(uri) => match uri.host() {
                Some(host) => host.to_ascii_lowercase(),
                None => return TokenFetchResult::with_status(FetchStatus::BadUrl),
            },
            Err(_) => return TokenFetchResult::with_status(FetchStatus::BadUrl),
        };

        let is_config_changed = std::mem::take(&mut state.config_changed);

        if !config
            .protected_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&host))
        {
            return TokenFetchResult {
                is_config_changed,
                ..TokenFetchResult::with_status(FetchStatus::UnprotectedUrl)
            };
        }

        let ttl = i64::try_from(config.token_ttl_secs).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            host,
            exp: chrono::Utc::now().timestamp().saturating_add(ttl),
            bind: state.binding.as_deref().map(TokenClaims::binding_hash),
        };

        match self.issue(&claims) {
            Ok((token, loggable_token)) => TokenFetchResult {
                status: FetchStatus::Success,
                token,
                loggable_token,
                is_config_changed,
            },
            Err(e) => {
                warn!("Failed to issue token: {:#}", e);
                TokenFetchResult {
                    is_config_changed,
                    ..TokenFetchResult::with_status(FetchStatus::InternalError)
                }
            }
        }
    }

    fn fetch_current_config(&self) -> Option<String> {
        self.current_config()?.to_json().ok()
    }

    fn pins(&self, policy: &str) -> Option<HostPins> {
        if policy != PUBLIC_KEY_SHA256_POLICY {
            return None;
        }
        self.current_config().map(|c| c.pins)
    }

    fn set_request_binding_value(&self, value: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.binding = (!value.is_empty()).then(|| value.to_string());
    }
}

/// Load the ECDSA secp256k1 signing key from a PEM file.
pub fn load_signing_key(path: &str) -> anyhow::Result<SigningKey> {
    use k256::SecretKey;

    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signing key from {}", path))?;

    // SEC1 (EC PRIVATE KEY), as written by `openssl ecparam`
    if let Ok(secret_key) = SecretKey::from_sec1_pem(&pem) {
        return Ok(SigningKey::from(secret_key));
    }

    use k256::pkcs8::DecodePrivateKey;
    if let Ok(secret_key) = SecretKey::from_pkcs8_pem(&pem) {
        return Ok(SigningKey::from(secret_key));
    }

    anyhow::bail!(
        "Failed to parse signing key from {}: expected SEC1 or PKCS8 PEM",
        path
    )
}
