use http::Method;
use thiserror::Error;

use crate::destination::Destination;
use crate::policy::Outcome;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// The stage of a request a timeout budget applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Lease,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Lease => "lease",
            Self::Read => "read",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidDestination,
    InvalidConfig,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    PoolExhausted,
    PoolClosed,
    ConnectTimeout,
    ReadTimeout,
    Transport,
    Protocol,
    ResponseBodyTooLarge,
    Cancelled,
    HttpStatus,
    ReaperSpawn,
    TlsConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidDestination => "invalid_destination",
            Self::InvalidConfig => "invalid_config",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::ConnectTimeout => "connect_timeout",
            Self::ReadTimeout => "read_timeout",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Cancelled => "cancelled",
            Self::HttpStatus => "http_status",
            Self::ReaperSpawn => "reaper_spawn",
            Self::TlsConfig => "tls_config",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid destination {destination}: {reason}")]
    InvalidDestination {
        destination: String,
        reason: &'static str,
    },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("connection pool exhausted for {destination} after waiting {lease_wait_ms}ms")]
    PoolExhausted {
        destination: Destination,
        lease_wait_ms: u128,
    },
    #[error("connection pool is shut down")]
    PoolClosed,
    /// Connect or read budget ran out. The pool reports lease-wait expiry
    /// as [`Error::PoolExhausted`], never as `Timeout`; a `Lease` phase here
    /// is classified the same way as `PoolExhausted`.
    #[error("{phase} timed out after {timeout_ms}ms for {destination}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        destination: Destination,
    },
    #[error("http transport error ({kind}) for {destination}: {source}")]
    Transport {
        kind: TransportErrorKind,
        destination: Destination,
        #[source]
        source: BoxError,
    },
    #[error("malformed http response from {destination}: {source}")]
    Protocol {
        destination: Destination,
        #[source]
        source: BoxError,
    },
    #[error("response body too large (> {limit_bytes} bytes) for {method} {uri}")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("request cancelled: {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http status {status} ({outcome}) treated as fatal for {method} {uri}")]
    HttpStatus {
        status: u16,
        outcome: Outcome,
        method: Method,
        uri: String,
    },
    #[error("failed to start idle reaper thread: {source}")]
    ReaperSpawn {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidDestination { .. } => ErrorCode::InvalidDestination,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::PoolClosed => ErrorCode::PoolClosed,
            Self::Timeout {
                phase: TimeoutPhase::Connect,
                ..
            } => ErrorCode::ConnectTimeout,
            Self::Timeout {
                phase: TimeoutPhase::Lease,
                ..
            } => ErrorCode::PoolExhausted,
            Self::Timeout {
                phase: TimeoutPhase::Read,
                ..
            } => ErrorCode::ReadTimeout,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::ReaperSpawn { .. } => ErrorCode::ReaperSpawn,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
        }
    }

    /// Which timeout budget ran out, if this error is a timeout.
    ///
    /// Lease-wait expiry is reported as [`Error::PoolExhausted`] and maps to
    /// [`TimeoutPhase::Lease`].
    pub const fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            Self::PoolExhausted { .. } => Some(TimeoutPhase::Lease),
            _ => None,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }
}
