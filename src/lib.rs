//! HTTP session that attaches attestation tokens and pins server keys.
//!
//! Requests created through [`AttestedSession`] are first handed to the
//! [`TokenProvider`], which asks the attestation service for a token and
//! decides whether the request goes out. TLS connections are only accepted
//! when a certificate in the server's chain matches the dynamic pin set the
//! attestation service publishes.

pub mod attestation;
pub mod config;
mod decision;
pub mod engine;
mod error;
pub mod logging;
pub mod pinning;
pub mod session;
mod token;

pub use config::{SessionConfiguration, TokenConfig};
pub use decision::{Decision, Interception};
pub use error::{ErrorKind, Result, SessionError};
pub use session::{AttestedSession, ForwardingDelegate, SessionDelegate};
pub use token::TokenProvider;
