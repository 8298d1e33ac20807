//! Dynamic public-key pinning.
//!
//! The pin set is owned by the attestation service and may change whenever a
//! token fetch reports a configuration change. [`PinStore`] holds the current
//! snapshot; verifiers always read the latest one.

mod spki;
mod verifier;

pub use spki::{certificate_pin, spki_pin, KeyAlgorithm, RawPublicKey, SpkiError, SpkiHeader};
pub use verifier::{CertificateVerifier, PinMatch};

use crate::attestation::{AttestationService, HostPins};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Pin policy name for base64 SHA-256 SubjectPublicKeyInfo hashes.
pub const PUBLIC_KEY_SHA256_POLICY: &str = "public-key-sha256";

/// What to do with a host the pin set says nothing about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnpinnedHosts {
    /// No certificate can match, the connection is refused.
    #[default]
    Reject,
    /// Accept whatever the platform trust evaluation accepted.
    AllowPlatformTrust,
}

/// Immutable host to pins mapping. Host names are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    hosts: HashMap<String, BTreeSet<String>>,
}

impl PinSet {
    pub fn new(pins: HostPins) -> Self {
        let mut hosts: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (host, host_pins) in pins {
            hosts
                .entry(host.to_ascii_lowercase())
                .or_default()
                .extend(host_pins);
        }
        Self { hosts }
    }

    /// `None` when the host has no configured pin list.
    pub fn pins_for(&self, host: &str) -> Option<&BTreeSet<String>> {
        self.hosts.get(&host.to_ascii_lowercase())
    }

    pub fn contains(&self, host: &str, pin: &str) -> bool {
        self.pins_for(host).is_some_and(|pins| pins.contains(pin))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl From<HostPins> for PinSet {
    fn from(pins: HostPins) -> Self {
        Self::new(pins)
    }
}

/// Shared, replaceable pin set snapshot.
#[derive(Debug)]
pub struct PinStore {
    policy: String,
    current: RwLock<Arc<PinSet>>,
}

impl PinStore {
    pub fn new(policy: impl Into<String>) -> Self {
        Self::with_pins(policy, PinSet::default())
    }

    pub fn with_pins(policy: impl Into<String>, pins: PinSet) -> Self {
        Self {
            policy: policy.into(),
            current: RwLock::new(Arc::new(pins)),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn current(&self) -> Arc<PinSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, pins: PinSet) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(pins);
    }

    /// Reload the pin set from the attestation service. Keeps the previous
    /// snapshot and returns false if the service has no pins for the policy.
    pub fn refresh(&self, service: &dyn AttestationService) -> bool {
        match service.pins(&self.policy) {
            Some(pins) => {
                let pins = PinSet::new(pins);
                debug!("Loaded pins for {} hosts", pins.hosts.len());
                self.replace(pins);
                true
            }
            None => {
                warn!("Attestation service has no pins for policy {}", self.policy);
                false
            }
        }
    }
}
