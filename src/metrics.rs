use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, TimeoutPhase};
use crate::policy::Outcome;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub in_flight: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub pool_exhausted: u64,
    pub connect_timeouts: u64,
    pub read_timeouts: u64,
    pub transport_errors: u64,
    pub protocol_errors: u64,
    pub response_body_too_large: u64,
    pub cancelled: u64,
    pub http_status_errors: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<ClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    in_flight: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    pool_exhausted: AtomicU64,
    connect_timeouts: AtomicU64,
    read_timeouts: AtomicU64,
    transport_errors: AtomicU64,
    protocol_errors: AtomicU64,
    response_body_too_large: AtomicU64,
    cancelled: AtomicU64,
    http_status_errors: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<ClientMetricsInner>>,
}

impl ClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(ClientMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_request_completed(
        &self,
        result: &Result<Response, Error>,
        outcome: Option<Outcome>,
        latency: Duration,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };

        match result {
            Ok(response) => {
                inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                add_status_count(inner, response.status().as_u16());
            }
            Err(error) => {
                inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                record_error(inner, error);
            }
        }
        match outcome {
            Some(Outcome::ClientError) => {
                inner.client_errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(Outcome::ServerError) => {
                inner.server_errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(Outcome::Success) | None => {}
        }

        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return ClientMetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            client_errors: inner.client_errors.load(Ordering::Relaxed),
            server_errors: inner.server_errors.load(Ordering::Relaxed),
            pool_exhausted: inner.pool_exhausted.load(Ordering::Relaxed),
            connect_timeouts: inner.connect_timeouts.load(Ordering::Relaxed),
            read_timeouts: inner.read_timeouts.load(Ordering::Relaxed),
            transport_errors: inner.transport_errors.load(Ordering::Relaxed),
            protocol_errors: inner.protocol_errors.load(Ordering::Relaxed),
            response_body_too_large: inner.response_body_too_large.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            http_status_errors: inner.http_status_errors.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

fn record_error(inner: &ClientMetricsInner, error: &Error) {
    let counter = match error {
        Error::PoolExhausted { .. }
        | Error::Timeout {
            phase: TimeoutPhase::Lease,
            ..
        } => Some(&inner.pool_exhausted),
        Error::Timeout {
            phase: TimeoutPhase::Connect,
            ..
        } => Some(&inner.connect_timeouts),
        Error::Timeout {
            phase: TimeoutPhase::Read,
            ..
        } => Some(&inner.read_timeouts),
        Error::Transport { .. } => Some(&inner.transport_errors),
        Error::Protocol { .. } => Some(&inner.protocol_errors),
        Error::ResponseBodyTooLarge { .. } => Some(&inner.response_body_too_large),
        Error::Cancelled { .. } => Some(&inner.cancelled),
        Error::HttpStatus { status, .. } => {
            add_status_count(inner, *status);
            Some(&inner.http_status_errors)
        }
        _ => None,
    };
    if let Some(counter) = counter {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    let key = match error {
        Error::Transport { kind, .. } => format!("transport:{kind}"),
        Error::HttpStatus { status, .. } => format!("http_status:{status}"),
        other => other.code().as_str().to_owned(),
    };
    let mut error_counts = lock_unpoisoned(&inner.error_counts);
    *error_counts.entry(key).or_insert(0) += 1;
}

fn add_status_count(inner: &ClientMetricsInner, status: u16) {
    let mut status_counts = lock_unpoisoned(&inner.status_counts);
    *status_counts.entry(status).or_insert(0) += 1;
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
