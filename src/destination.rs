use std::fmt;
use std::str::FromStr;

use http::Uri;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        if text.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if text.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Routing target a pooled connection belongs to.
///
/// Two requests share pooled connections exactly when their destinations are
/// equal. Hosts are compared case-insensitively and missing ports are filled
/// in from the scheme, so `HTTP://Example.com` and `http://example.com:80`
/// name the same destination.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl AsRef<str>, port: u16) -> Result<Self, Error> {
        let host = host.as_ref().trim();
        if host.is_empty() {
            return Err(Error::InvalidDestination {
                destination: format!("{scheme}://:{port}"),
                reason: "host is empty",
            });
        }
        if port == 0 {
            return Err(Error::InvalidDestination {
                destination: format!("{scheme}://{host}:{port}"),
                reason: "port must be non-zero",
            });
        }
        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn http(host: impl AsRef<str>, port: u16) -> Result<Self, Error> {
        Self::new(Scheme::Http, host, port)
    }

    pub fn https(host: impl AsRef<str>, port: u16) -> Result<Self, Error> {
        Self::new(Scheme::Https, host, port)
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let Some(scheme) = uri.scheme_str().and_then(Scheme::parse) else {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
            });
        };
        let Some(host) = uri.host() else {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
            });
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        Self::new(scheme, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` request header; the port is omitted when it is
    /// the scheme default.
    pub(crate) fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }

    pub(crate) fn to_uri(&self) -> Result<Uri, Error> {
        let text = format!("{}://{}/", self.scheme, self.authority());
        text.parse().map_err(|_| Error::InvalidUri { uri: text })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidDestination {
            destination: text.to_owned(),
            reason,
        };
        let parsed = url::Url::parse(text.trim()).map_err(|_| invalid("not an absolute url"))?;
        let scheme = Scheme::parse(parsed.scheme()).ok_or_else(|| invalid("unsupported scheme"))?;
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if !parsed.path().trim_matches('/').is_empty()
            || parsed.query().is_some()
            || parsed.fragment().is_some()
        {
            return Err(invalid("destination must not carry a path or query"));
        }
        let port = parsed.port().unwrap_or(scheme.default_port());
        Self::new(scheme, host, port)
    }
}

impl TryFrom<String> for Destination {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.to_string()
    }
}
