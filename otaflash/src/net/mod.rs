//! Firmware source.
//!
//! The update cycle pulls two documents from a web server: a one-line
//! version file and the Intel HEX body of that version. Both go through the
//! [`Fetcher`] trait; [`HttpFetcher`] (feature `http`) is the HTTPS client.

#[cfg(feature = "http")]
pub mod http;

use crate::error::Result;
use std::fmt;

#[cfg(feature = "http")]
pub use http::HttpFetcher;

/// Default HTTPS port.
pub const DEFAULT_PORT: u16 = 443;

/// Web server hosting firmware releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Expected SHA-256 fingerprint of the server certificate, hex encoded.
    pub fingerprint: Option<String>,
    /// Use TLS (`https`). Plain `http` is meant for local test servers.
    pub tls: bool,
}

impl Endpoint {
    /// HTTPS endpoint on the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            fingerprint: None,
            tls: true,
        }
    }

    /// Pin the server certificate.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Choose between `https` and `http`.
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// `scheme://host:port` without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Where a fetched document ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Cut the body before the first occurrence of this byte.
    Byte(u8),
    /// Keep the whole body.
    Eof,
}

impl Terminator {
    /// Line terminator used for version files.
    pub const LINE: Self = Self::Byte(b'\n');

    /// Apply the terminator to a response body.
    ///
    /// A NUL byte always ends the document.
    pub fn apply(self, body: &str) -> &str {
        let body = body.split('\0').next().unwrap_or_default();
        match self {
            Self::Byte(b) => match body.bytes().position(|c| c == b) {
                // Splitting on an ASCII byte keeps the slice on a char boundary
                Some(end) if b.is_ascii() => &body[..end],
                _ => body,
            },
            Self::Eof => body,
        }
    }
}

/// One document request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Server to contact.
    pub endpoint: Endpoint,
    /// Absolute path on the server.
    pub path: String,
    /// End of the document.
    pub terminator: Terminator,
}

impl FetchRequest {
    /// Build a request.
    pub fn new(endpoint: Endpoint, path: impl Into<String>, terminator: Terminator) -> Self {
        Self {
            endpoint,
            path: path.into(),
            terminator,
        }
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        if self.path.starts_with('/') {
            format!("{}{}", self.endpoint.base_url(), self.path)
        } else {
            format!("{}/{}", self.endpoint.base_url(), self.path)
        }
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Retrieves documents from a firmware source.
pub trait Fetcher {
    /// Fetch a document, applying the request terminator.
    ///
    /// Failures are reported as [`crate::Error::Transport`].
    fn fetch(&mut self, request: &FetchRequest) -> Result<String>;
}

impl<T: Fetcher + ?Sized> Fetcher for &mut T {
    fn fetch(&mut self, request: &FetchRequest) -> Result<String> {
        (**self).fetch(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let endpoint = Endpoint::new("fw.example.com", 443);
        assert_eq!(endpoint.base_url(), "https://fw.example.com:443");
        assert_eq!(
            endpoint.with_tls(false).base_url(),
            "http://fw.example.com:443"
        );
    }

    #[test]
    fn test_request_url_joins_path() {
        let endpoint = Endpoint::new("h", 8443);
        let a = FetchRequest::new(endpoint.clone(), "/fw/latest.md", Terminator::LINE);
        let b = FetchRequest::new(endpoint, "fw/latest.md", Terminator::LINE);
        assert_eq!(a.url(), "https://h:8443/fw/latest.md");
        assert_eq!(a.url(), b.url());
    }

    #[test]
    fn test_line_terminator() {
        assert_eq!(Terminator::LINE.apply("1.2.0\nignored"), "1.2.0");
        assert_eq!(Terminator::LINE.apply("1.2.0"), "1.2.0");
        assert_eq!(Terminator::LINE.apply(""), "");
    }

    #[test]
    fn test_eof_terminator_stops_at_nul() {
        assert_eq!(Terminator::Eof.apply(":00000001FF\n"), ":00000001FF\n");
        assert_eq!(Terminator::Eof.apply("abc\0def"), "abc");
        assert_eq!(Terminator::LINE.apply("ab\0c\nd"), "ab");
    }
}
