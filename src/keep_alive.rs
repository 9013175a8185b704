//! How long a connection may sit in the pool after a response.

use std::time::Duration;

use http::Version;
use http::header::{CONNECTION, HeaderMap, HeaderName};

use crate::config::DEFAULT_KEEP_ALIVE;
use crate::response::ResponseHead;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Decides the keep-alive window of a connection from the response it just
/// carried. [`Duration::ZERO`] means the connection must be closed.
pub trait KeepAlivePolicy: Send + Sync {
    fn decide(&self, head: &ResponseHead) -> Duration;
}

/// Honors `Connection` and `Keep-Alive: timeout=<seconds>`; anything else
/// falls back to a fixed default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderKeepAlivePolicy {
    default_keep_alive: Duration,
}

impl HeaderKeepAlivePolicy {
    pub fn new(default_keep_alive: Duration) -> Self {
        Self { default_keep_alive }
    }

    pub fn default_keep_alive(&self) -> Duration {
        self.default_keep_alive
    }
}

impl Default for HeaderKeepAlivePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE)
    }
}

impl KeepAlivePolicy for HeaderKeepAlivePolicy {
    fn decide(&self, head: &ResponseHead) -> Duration {
        if has_connection_token(&head.headers, "close") {
            return Duration::ZERO;
        }
        if matches!(head.version, Version::HTTP_09 | Version::HTTP_10)
            && !has_connection_token(&head.headers, "keep-alive")
        {
            return Duration::ZERO;
        }
        keep_alive_timeout(&head.headers).unwrap_or(self.default_keep_alive)
    }
}

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// `timeout` parameter of the `Keep-Alive` header, in seconds.
pub(crate) fn keep_alive_timeout(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(KEEP_ALIVE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|element| {
            let (name, value) = element.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("timeout") {
                return None;
            }
            let value = value.trim().trim_matches('"');
            value.parse::<u64>().ok().map(Duration::from_secs)
        })
}
