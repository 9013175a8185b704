use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use tokio_util::sync::CancellationToken;

use crate::destination::Destination;
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// Per-request overrides of the client's timeout budgets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestTimeouts {
    pub connect: Option<Duration>,
    pub lease_wait: Option<Duration>,
    pub read: Option<Duration>,
}

impl RequestTimeouts {
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    pub fn lease_wait(mut self, timeout: Duration) -> Self {
        self.lease_wait = Some(timeout);
        self
    }

    pub fn read(mut self, timeout: Duration) -> Self {
        self.read = Some(timeout);
        self
    }
}

/// A request on its way through the interceptor chain.
///
/// The destination is derived from the URI once, at construction, and kept
/// in sync by [`RequestEnvelope::set_uri`].
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    method: Method,
    uri: Uri,
    destination: Destination,
    headers: HeaderMap,
    body: Bytes,
    timeouts: RequestTimeouts,
    cancellation: Option<CancellationToken>,
}

impl RequestEnvelope {
    pub fn new(method: Method, uri: Uri) -> Result<Self, Error> {
        let destination = Destination::from_uri(&uri)?;
        Ok(Self {
            method,
            uri,
            destination,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeouts: RequestTimeouts::default(),
            cancellation: None,
        })
    }

    pub fn parse(method: Method, uri: &str) -> Result<Self, Error> {
        let parsed: Uri = uri.parse().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        Self::new(method, parsed)
    }

    pub fn get(uri: &str) -> Result<Self, Error> {
        Self::parse(Method::GET, uri)
    }

    pub fn post(uri: &str) -> Result<Self, Error> {
        Self::parse(Method::POST, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeouts(mut self, timeouts: RequestTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Points the request at another URI, re-deriving its destination.
    pub fn set_uri(&mut self, uri: Uri) -> Result<(), Error> {
        self.destination = Destination::from_uri(&uri)?;
        self.uri = uri;
        Ok(())
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn request_timeouts(&self) -> RequestTimeouts {
        self.timeouts
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }
}
