use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::error::Error;

pub(crate) const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 50;
pub(crate) const DEFAULT_MAX_PER_DESTINATION: usize = 20;
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_LEASE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_IDLE_REAPER_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_IDLE_WAIT_TIME: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Capacity limits of a connection pool.
///
/// Counts cover every open connection, whether free, leased or still
/// connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    max_total: usize,
    default_max_per_destination: usize,
    per_destination: BTreeMap<Destination, usize>,
}

impl PoolLimits {
    pub fn new(max_total: usize, default_max_per_destination: usize) -> Self {
        Self {
            max_total: max_total.max(1),
            default_max_per_destination: default_max_per_destination.max(1),
            per_destination: BTreeMap::new(),
        }
    }

    pub fn max_per_destination(mut self, destination: Destination, max: usize) -> Self {
        self.per_destination.insert(destination, max.max(1));
        self
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    pub fn default_max_per_destination(&self) -> usize {
        self.default_max_per_destination
    }

    pub fn overrides(&self) -> &BTreeMap<Destination, usize> {
        &self.per_destination
    }

    pub fn max_for(&self, destination: &Destination) -> usize {
        self.per_destination
            .get(destination)
            .copied()
            .unwrap_or(self.default_max_per_destination)
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_MAX_PER_DESTINATION)
    }
}

/// Default timeout budgets applied when a request carries no override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub lease_wait: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            lease_wait: DEFAULT_LEASE_WAIT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleReaperSchedule {
    pub interval: Duration,
    pub idle_wait: Duration,
}

impl Default for IdleReaperSchedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_IDLE_REAPER_INTERVAL,
            idle_wait: DEFAULT_IDLE_WAIT_TIME,
        }
    }
}

/// Process-wide client configuration, typically deserialized once at startup.
///
/// ```
/// let config: reqpool::ClientConfig = serde_json::from_str(
///     r#"{ "max_total_connections": 10, "per_destination_overrides": { "https://api.example.com": 4 } }"#,
/// ).unwrap();
/// assert_eq!(config.max_total_connections, 10);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_total_connections: usize,
    pub default_max_per_destination: usize,
    pub per_destination_overrides: BTreeMap<Destination, usize>,
    pub connect_timeout_ms: u64,
    pub lease_wait_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub default_keep_alive_ms: u64,
    pub idle_reaper_interval_ms: u64,
    pub idle_wait_time_ms: u64,
    pub max_response_body_bytes: usize,
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            default_max_per_destination: DEFAULT_MAX_PER_DESTINATION,
            per_destination_overrides: BTreeMap::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            lease_wait_timeout_ms: DEFAULT_LEASE_WAIT_TIMEOUT.as_millis() as u64,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            default_keep_alive_ms: DEFAULT_KEEP_ALIVE.as_millis() as u64,
            idle_reaper_interval_ms: DEFAULT_IDLE_REAPER_INTERVAL.as_millis() as u64,
            idle_wait_time_ms: DEFAULT_IDLE_WAIT_TIME.as_millis() as u64,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_total_connections == 0 {
            return Err(invalid_config("max_total_connections must be at least 1"));
        }
        if self.default_max_per_destination == 0 {
            return Err(invalid_config(
                "default_max_per_destination must be at least 1",
            ));
        }
        for (destination, max) in &self.per_destination_overrides {
            if *max == 0 {
                return Err(invalid_config(format!(
                    "per-destination cap for {destination} must be at least 1"
                )));
            }
            if *max > self.max_total_connections {
                return Err(invalid_config(format!(
                    "per-destination cap for {destination} ({max}) exceeds max_total_connections ({})",
                    self.max_total_connections
                )));
            }
        }
        if self.idle_reaper_interval_ms == 0 {
            return Err(invalid_config("idle_reaper_interval_ms must be non-zero"));
        }
        if self.max_response_body_bytes == 0 {
            return Err(invalid_config("max_response_body_bytes must be non-zero"));
        }
        Ok(())
    }

    pub fn pool_limits(&self) -> PoolLimits {
        let mut limits = PoolLimits::new(
            self.max_total_connections,
            self.default_max_per_destination,
        );
        for (destination, max) in &self.per_destination_overrides {
            limits = limits.max_per_destination(destination.clone(), *max);
        }
        limits
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            lease_wait: Duration::from_millis(self.lease_wait_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn idle_reaper_schedule(&self) -> IdleReaperSchedule {
        IdleReaperSchedule {
            interval: Duration::from_millis(self.idle_reaper_interval_ms),
            idle_wait: Duration::from_millis(self.idle_wait_time_ms),
        }
    }

    pub fn default_keep_alive(&self) -> Duration {
        Duration::from_millis(self.default_keep_alive_ms)
    }
}

fn invalid_config(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}
