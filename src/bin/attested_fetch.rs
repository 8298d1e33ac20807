//! Fetch a URL through an attested session.
//!
//! Run with:
//! ```bash
//! attested-fetch --config-dir ./config --signing-key signing.pem https://api.example.com/v1/items
//! ```
//!
//! `--config-dir` must hold `attestation-initial.config`, the JSON
//! configuration of the in-process attestation service.

use anyhow::{Context, Result};
use attested_session::attestation::{
    load_signing_key, DirectoryBundle, EphemeralAttestationService, FileStore,
};
use attested_session::engine::{SessionTask, TransferOutcome};
use attested_session::logging::init_logging;
use attested_session::{AttestedSession, SessionConfiguration, TokenConfig, TokenProvider};
use clap::Parser;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request};
use rustls::pki_types::CertificateDer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "attested-fetch")]
#[command(about = "Fetch a URL with an attestation token and pinned TLS")]
struct Args {
    /// URL to fetch
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Extra request header as `Name: value`, may be repeated
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Bind the token to the value of this request header
    #[arg(long, env = "ATTESTED_BIND_HEADER")]
    bind_header: Option<String>,

    /// Prefix for the token header value, e.g. "Bearer "
    #[arg(long, env = "ATTESTED_TOKEN_PREFIX", default_value = "")]
    token_prefix: String,

    /// Directory holding attestation-initial.config
    #[arg(long, env = "ATTESTED_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// File persisting the dynamic attestation configuration
    #[arg(long, env = "ATTESTED_STATE_FILE", default_value = "attested-state.json")]
    state_file: PathBuf,

    /// Path to the token signing key (PEM format, secp256k1)
    #[arg(long, env = "ATTESTED_SIGNING_KEY")]
    signing_key: String,

    /// Extra trust anchors (PEM format)
    #[arg(long, env = "ATTESTED_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Download the response body into this directory
    #[arg(long)]
    download: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging("attested_fetch=info,attested_session=info,warn");

    let args = Args::parse();

    info!("Fetching {} {}", args.method, args.url);
    info!("  Config dir: {}", args.config_dir.display());
    info!("  State file: {}", args.state_file.display());

    let service = Arc::new(EphemeralAttestationService::new(load_signing_key(
        &args.signing_key,
    )?));
    let tokens = Arc::new(TokenProvider::new(
        service,
        Arc::new(FileStore::new(&args.state_file)),
        Arc::new(DirectoryBundle::new(&args.config_dir)),
        TokenConfig::builder()
            .token_prefix(args.token_prefix.clone())
            .build()?,
    ));
    if let Some(bind_header) = &args.bind_header {
        tokens.set_bind_header(bind_header.as_str());
    }

    let mut configuration = SessionConfiguration::builder()
        .additional_headers(parse_headers(&args.headers)?)
        .extra_root_certificates(match &args.ca_file {
            Some(path) => load_certs(path)?,
            None => Vec::new(),
        });
    if let Some(dir) = &args.download {
        configuration = configuration.download_dir(dir.clone());
    }
    let configuration = configuration.build()?;

    let request = build_request(&args)?;
    let download = args.download.is_some();
    let session = AttestedSession::new(configuration, None, tokens, Handle::current())?;

    // Token fetches block, keep them off the runtime's worker threads
    let (tx, rx) = oneshot::channel();
    let (_session, _task): (AttestedSession, SessionTask) =
        tokio::task::spawn_blocking(move || {
            let task = if download {
                session.download_task_with_completion(request, move |location, response, error| {
                    let _ = tx.send(TransferOutcome {
                        body: None,
                        location,
                        response,
                        error,
                    });
                })
            } else {
                session.data_task_with_completion(request, move |body, response, error| {
                    let _ = tx.send(TransferOutcome {
                        body,
                        location: None,
                        response,
                        error,
                    });
                })
            };
            task.resume();
            (session, task)
        })
        .await
        .context("Session task panicked")?;

    let outcome = rx.await.context("Transfer ended without a result")?;
    if let Some(error) = outcome.error {
        anyhow::bail!("Request failed: {error}");
    }

    if let Some(response) = &outcome.response {
        println!("{}", response.status);
        for (name, value) in &response.headers {
            println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
        }
        println!();
    }
    if let Some(body) = &outcome.body {
        println!("{}", String::from_utf8_lossy(body));
    }
    if let Some(location) = &outcome.location {
        println!("Saved to {}", location.display());
    }
    Ok(())
}

fn build_request(args: &Args) -> Result<Request<Bytes>> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid method {}", args.method))?;
    let body = args
        .data
        .as_ref()
        .map(|data| Bytes::from(data.clone()))
        .unwrap_or_default();

    Request::builder()
        .method(method)
        .uri(args.url.as_str())
        .body(body)
        .with_context(|| format!("Invalid URL {}", args.url))
}

fn parse_headers(headers: &[String]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header {header:?} is not `Name: value`"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("Invalid header name in {header:?}"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("Invalid header value in {header:?}"))?;
        map.append(name, value);
    }
    Ok(map)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")
}
