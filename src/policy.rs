use std::collections::BTreeSet;
use std::fmt;

use http::{Method, StatusCode};
use tracing::warn;

use crate::response::Response;

/// Coarse classification of a completed exchange by status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    Success,
    ClientError,
    ServerError,
}

impl Outcome {
    /// 400-499 is a client error, 500-599 a server error, anything else
    /// (including 1xx and 3xx) counts as success.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Success,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
}

impl RequestContext {
    pub(crate) fn new(method: Method, uri: String) -> Self {
        Self { method, uri }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI with credentials, query and fragment stripped.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Inspects every completed response before it is handed to the caller.
pub trait ResponsePolicy: Send + Sync {
    fn classify(&self, response: &Response) -> Outcome {
        Outcome::from_status(response.status())
    }

    /// Called for every non-success outcome.
    fn on_error(&self, _context: &RequestContext, _response: &Response, _outcome: Outcome) {}

    /// Whether `outcome` turns the call into [`crate::Error::HttpStatus`].
    fn is_fatal(&self, _outcome: Outcome) -> bool {
        false
    }
}

/// Logs 4xx and 5xx responses; never fails a call unless opted in with
/// [`LoggingResponsePolicy::fatal_on`].
#[derive(Clone, Debug, Default)]
pub struct LoggingResponsePolicy {
    fatal: BTreeSet<Outcome>,
}

impl LoggingResponsePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fatal_on(mut self, outcome: Outcome) -> Self {
        if outcome.is_error() {
            self.fatal.insert(outcome);
        }
        self
    }
}

impl ResponsePolicy for LoggingResponsePolicy {
    fn on_error(&self, context: &RequestContext, response: &Response, outcome: Outcome) {
        warn!(
            method = %context.method(),
            uri = %context.uri(),
            status = response.status().as_u16(),
            outcome = outcome.as_str(),
            body_bytes = response.body().len(),
            "http request completed with error status"
        );
    }

    fn is_fatal(&self, outcome: Outcome) -> bool {
        self.fatal.contains(&outcome)
    }
}
