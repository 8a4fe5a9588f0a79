//! Canonical, size-bounded HTTP(S) URLs safe to carry through the crawl pipeline.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Longest accepted source string when parsing a URL.
const MAX_SOURCE_LEN: usize = 2000;
/// Longest accepted host, in bytes, after IDNA encoding.
const MAX_HOST_LEN: usize = 255;
/// Longest accepted path + encoded query, in bytes.
const MAX_PATH_QUERY_LEN: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("url is too long")]
    TooLong,

    #[error("can't parse url: {0}")]
    Unparseable(String),

    #[error("url's scheme is invalid: {0}")]
    InvalidScheme(String),

    #[error("url has userinfo")]
    HasUserInfo,

    #[error("url has a port")]
    HasPort,

    #[error("url has no host")]
    NoHost,

    #[error("url's host is too long")]
    HostTooLong,

    #[error("url's path and query are too long")]
    PathAndQueryTooLong,
}

/// An absolute HTTP(S) URL that passed sanitization.
///
/// The canonical form has a lowercased scheme, an IDNA-encoded host, no
/// userinfo, no fragment and no port (a literal `127.0.0.1:P` is allowed so
/// tests can point at local servers). Two values are equal iff their
/// canonical strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedUrl {
    inner: Url,
}

impl SanitizedUrl {
    pub fn parse(source: &str) -> Result<Self, SanitizeError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(SanitizeError::TooLong);
        }

        let url = Url::parse(source).map_err(|e| SanitizeError::Unparseable(e.to_string()))?;
        Self::from_url(url)
    }

    /// Sanitize an already-parsed URL. The `url` crate has lowercased the
    /// scheme and IDNA-encoded the host by this point; the remaining checks
    /// are ours.
    pub fn from_url(mut url: Url) -> Result<Self, SanitizeError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SanitizeError::InvalidScheme(other.to_string())),
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(SanitizeError::HasUserInfo);
        }

        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return Err(SanitizeError::NoHost),
        };

        // Loopback with an explicit port is tolerated so integration tests can
        // crawl a local stub server; everything else must use default ports.
        if url.port().is_some() && host != "127.0.0.1" {
            return Err(SanitizeError::HasPort);
        }

        if host.len() > MAX_HOST_LEN {
            return Err(SanitizeError::HostTooLong);
        }

        let query_len = url.query().map_or(0, str::len);
        if url.path().len() + query_len > MAX_PATH_QUERY_LEN {
            return Err(SanitizeError::PathAndQueryTooLong);
        }

        url.set_fragment(None);

        Ok(Self { inner: url })
    }

    /// Host part, including the port for the loopback exception.
    pub fn host(&self) -> String {
        match self.inner.port() {
            Some(port) => format!("{}:{}", self.inner.host_str().unwrap_or_default(), port),
            None => self.inner.host_str().unwrap_or_default().to_string(),
        }
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    /// Last DNS label of the host. A single-label host is its own TLD.
    pub fn tld(&self) -> &str {
        let host = self.inner.host_str().unwrap_or_default();
        host.rsplit('.').next().unwrap_or(host)
    }

    /// The last two dot-separated labels of the host, or the whole host when
    /// it has fewer. `www.example.jp` and `example.jp` agree here, which is
    /// what keeps them on the same frontier shard.
    pub fn sld_and_tld(&self) -> String {
        let host = self.inner.host_str().unwrap_or_default();
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() > 2 {
            labels[labels.len() - 2..].join(".")
        } else {
            host.to_string()
        }
    }

    /// The robots.txt URL effective for this URL: same origin, path
    /// `/robots.txt`.
    pub fn robots_txt_url(&self) -> SanitizedUrl {
        let mut url = self.inner.clone();
        url.set_path("/robots.txt");
        url.set_query(None);
        SanitizedUrl { inner: url }
    }

    /// Resolve `reference` against this URL per RFC 3986, then re-sanitize.
    pub fn join(&self, reference: &str) -> Result<SanitizedUrl, SanitizeError> {
        let resolved = self
            .inner
            .join(reference)
            .map_err(|e| SanitizeError::Unparseable(e.to_string()))?;
        Self::from_url(resolved)
    }

    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }
}

impl fmt::Display for SanitizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.as_str())
    }
}
