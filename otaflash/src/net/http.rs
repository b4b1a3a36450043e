//! HTTPS fetcher with optional certificate pinning.

use {
    crate::{
        error::{Error, Result},
        net::{FetchRequest, Fetcher},
    },
    log::{debug, trace},
    reqwest::{blocking::Client, tls::TlsInfo},
    sha2::{Digest, Sha256},
    std::time::Duration,
};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking HTTP(S) client.
///
/// Server certificates go through normal CA validation. When the endpoint
/// carries a fingerprint, the SHA-256 digest of the leaf certificate must
/// also match it.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

fn transport(err: impl std::fmt::Display) -> Error {
    Error::Transport(err.to_string())
}

impl HttpFetcher {
    /// Build a client with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .tls_info(true)
            .user_agent(concat!("otaflash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&mut self, request: &FetchRequest) -> Result<String> {
        let url = request.url();
        debug!("GET {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::Transport(format!("{url}: {e}")))?;

        if let Some(expected) = &request.endpoint.fingerprint {
            let expected = parse_fingerprint(expected)?;
            let cert = response
                .extensions()
                .get::<TlsInfo>()
                .and_then(TlsInfo::peer_certificate)
                .ok_or_else(|| {
                    Error::Transport(format!("{url}: no server certificate to pin against"))
                })?;
            let actual = Sha256::digest(cert);
            if actual.as_slice() != expected.as_slice() {
                return Err(Error::Transport(format!(
                    "{url}: certificate fingerprint mismatch (server {})",
                    hex::encode(actual)
                )));
            }
            trace!("Certificate fingerprint verified");
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .map_err(|e| Error::Transport(format!("{url}: {e}")))?;
        let document = request.terminator.apply(&body);
        debug!("{url}: {} bytes", document.len());
        Ok(document.to_string())
    }
}

/// Parse a SHA-256 fingerprint written as hex, optionally separated by
/// spaces or colons (case-insensitive).
pub fn parse_fingerprint(text: &str) -> Result<[u8; 32]> {
    let digits: String = text
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .collect();
    let bytes = hex::decode(&digits)
        .map_err(|e| Error::Config(format!("invalid certificate fingerprint: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::Config(format!(
            "certificate fingerprint must be 32 bytes, got {}",
            bytes.len()
        ))
    })
}
