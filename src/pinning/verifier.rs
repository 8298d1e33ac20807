use crate::engine::ServerTrust;
use crate::error::SessionError;
use crate::pinning::{certificate_pin, PinStore, UnpinnedHosts};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of an accepted server trust evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinMatch {
    /// `index` is the position in the chain, 0 being the leaf.
    Pinned { index: usize, pin: String },
    /// The host has no pins and the policy allows platform trust alone.
    Unpinned,
}

/// Checks a server's chain against the current pin set.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    pins: Arc<PinStore>,
    unpinned: UnpinnedHosts,
}

impl CertificateVerifier {
    pub fn new(pins: Arc<PinStore>, unpinned: UnpinnedHosts) -> Self {
        Self { pins, unpinned }
    }

    pub fn pin_store(&self) -> &Arc<PinStore> {
        &self.pins
    }

    /// Platform evaluation first, then a walk of the chain from the leaf
    /// towards the root. The first certificate whose pin is configured for
    /// the host accepts the chain.
    pub fn evaluate(&self, trust: &ServerTrust) -> Result<PinMatch, SessionError> {
        let host = trust.host();
        let failure = |reason: String| SessionError::TrustEvaluationFailure {
            host: host.to_string(),
            reason,
        };

        trust.evaluate().map_err(|e| {
            warn!("Platform trust evaluation failed for {}: {}", host, e);
            failure(e.to_string())
        })?;

        let pin_set = self.pins.current();
        let host_pins = pin_set.pins_for(host);
        if host_pins.is_none() && self.unpinned == UnpinnedHosts::AllowPlatformTrust {
            debug!("No pins for {}, accepting platform trust", host);
            return Ok(PinMatch::Unpinned);
        }

        for (index, certificate) in trust.certificates().iter().enumerate() {
            let pin = certificate_pin(certificate).map_err(|e| {
                warn!("Cannot compute pin for certificate {} of {}: {}", index, host, e);
                failure(e.to_string())
            })?;
            if host_pins.is_some_and(|pins| pins.contains(&pin)) {
                debug!("Pin {} matched certificate {} of {}", pin, index, host);
                return Ok(PinMatch::Pinned { index, pin });
            }
        }

        let reason = match host_pins {
            Some(_) => "no certificate in the chain matches a configured pin",
            None => "no pins configured for host",
        };
        warn!("Rejecting server trust for {}: {}", host, reason);
        Err(failure(reason.to_string()))
    }
}
