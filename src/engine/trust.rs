//! Authentication challenges and the TLS verifier that routes them to the
//! session delegate.

use crate::engine::task::SessionTask;
use crate::error::SessionError;
use crate::session::{dispatch_challenge, SessionDelegate};
use hyper::header::HeaderValue;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// The certificate chain a server presented, together with the platform
/// evaluator that decides whether the chain is trusted at all.
#[derive(Clone)]
pub struct ServerTrust {
    host: String,
    chain: Vec<CertificateDer<'static>>,
    ocsp_response: Vec<u8>,
    now: UnixTime,
    evaluator: Arc<dyn ServerCertVerifier>,
}

impl fmt::Debug for ServerTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTrust")
            .field("host", &self.host)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl ServerTrust {
    /// `chain` is ordered leaf first.
    pub fn new(
        host: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        evaluator: Arc<dyn ServerCertVerifier>,
        now: UnixTime,
    ) -> Self {
        Self {
            host: host.into(),
            chain,
            ocsp_response: Vec::new(),
            now,
            evaluator,
        }
    }

    pub fn with_ocsp_response(mut self, ocsp_response: Vec<u8>) -> Self {
        self.ocsp_response = ocsp_response;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Run the platform trust evaluation: path building to a trusted anchor,
    /// validity period and host name.
    pub fn evaluate(&self) -> Result<(), rustls::Error> {
        let (end_entity, intermediates) = self
            .chain
            .split_first()
            .ok_or(rustls::Error::NoCertificatesPresented)?;
        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| rustls::Error::General(format!("invalid host {}: {}", self.host, e)))?;
        self.evaluator.verify_server_cert(
            end_entity,
            intermediates,
            &server_name,
            &self.ocsp_response,
            self.now,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum AuthChallenge {
    /// TLS server authentication.
    ServerTrust(ServerTrust),
    /// An HTTP `401` with a `WWW-Authenticate` header.
    Http {
        host: String,
        scheme: String,
        realm: Option<String>,
    },
}

impl AuthChallenge {
    pub fn host(&self) -> &str {
        match self {
            Self::ServerTrust(trust) => trust.host(),
            Self::Http { host, .. } => host,
        }
    }

    pub fn is_server_trust(&self) -> bool {
        matches!(self, Self::ServerTrust(_))
    }

    /// Parse a `WWW-Authenticate` header value such as `Basic realm="api"`.
    pub fn from_www_authenticate(host: &str, value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, params) = match value.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (value, ""),
        };
        if scheme.is_empty() {
            return None;
        }
        let realm = params.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_string())
        });
        Some(Self::Http {
            host: host.to_string(),
            scheme: scheme.to_string(),
            realm,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Credential {
    /// Trust the server with this evaluated chain.
    ServerTrust(ServerTrust),
    /// Value of the `Authorization` header for an HTTP challenge.
    Authorization(HeaderValue),
}

#[derive(Debug, Clone)]
pub enum ChallengeDisposition {
    UseCredential(Credential),
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

/// Rustls verifier that turns the server certificate check into a
/// [`AuthChallenge::ServerTrust`] for the session delegate.
///
/// One bridge is built per connection attempt. When the delegate refuses the
/// challenge the refusal is recorded so the transfer can report a trust
/// failure rather than a generic handshake error.
pub(crate) struct TrustBridge {
    delegate: Arc<dyn SessionDelegate>,
    task: SessionTask,
    platform: Arc<dyn ServerCertVerifier>,
    rejection: Arc<Mutex<Option<SessionError>>>,
}

impl fmt::Debug for TrustBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBridge")
            .field("task", &self.task.id())
            .finish()
    }
}

impl TrustBridge {
    pub(crate) fn new(
        delegate: Arc<dyn SessionDelegate>,
        task: SessionTask,
        platform: Arc<dyn ServerCertVerifier>,
    ) -> Self {
        Self {
            delegate,
            task,
            platform,
            rejection: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn rejection(&self) -> Arc<Mutex<Option<SessionError>>> {
        self.rejection.clone()
    }

    fn reject(&self, host: &str, reason: &str) -> rustls::Error {
        *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(SessionError::TrustEvaluationFailure {
                host: host.to_string(),
                reason: reason.to_string(),
            });
        rustls::Error::General(format!("server trust for {host} rejected: {reason}"))
    }
}

fn host_of(server_name: &ServerName<'_>) -> Option<String> {
    match server_name {
        ServerName::DnsName(name) => Some(name.as_ref().to_string()),
        ServerName::IpAddress(ip) => Some(std::net::IpAddr::from(ip.clone()).to_string()),
        _ => None,
    }
}

impl ServerCertVerifier for TrustBridge {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = host_of(server_name)
            .ok_or_else(|| rustls::Error::General("unsupported server name".to_string()))?;
        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.clone().into_owned())
            .collect();
        let trust = ServerTrust::new(host.clone(), chain, self.platform.clone(), now)
            .with_ocsp_response(ocsp_response.to_vec());

        let challenge = AuthChallenge::ServerTrust(trust.clone());
        match dispatch_challenge(self.delegate.as_ref(), &self.task, &challenge) {
            ChallengeDisposition::UseCredential(Credential::ServerTrust(_)) => {
                debug!("Server trust for {} accepted by delegate", host);
                Ok(ServerCertVerified::assertion())
            }
            ChallengeDisposition::UseCredential(Credential::Authorization(_)) => {
                Err(self.reject(&host, "credential does not answer a server trust challenge"))
            }
            ChallengeDisposition::PerformDefaultHandling => match trust.evaluate() {
                Ok(()) => Ok(ServerCertVerified::assertion()),
                Err(e) => Err(self.reject(&host, &e.to_string())),
            },
            ChallengeDisposition::CancelAuthenticationChallenge
            | ChallengeDisposition::RejectProtectionSpace => {
                Err(self.reject(&host, "server trust challenge cancelled"))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.platform.supported_verify_schemes()
    }
}
