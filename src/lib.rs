//! `reqpool` is a pooled HTTP/1.1 client transport: a destination-partitioned
//! connection pool with global and per-destination caps, header-driven
//! keep-alive, a background idle reaper, an interceptor chain and a response
//! policy that classifies (but does not reject) error statuses.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqpool::prelude::{HttpClient, LoggingInterceptor, RequestEnvelope};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .client_name("my-sdk")
//!         .max_total_connections(50)
//!         .lease_wait_timeout(Duration::from_secs(2))
//!         .read_timeout(Duration::from_secs(10))
//!         .interceptor(LoggingInterceptor)
//!         .try_build()?;
//!
//!     let response = client
//!         .execute(RequestEnvelope::get("https://api.example.com/v1/items")?)
//!         .await?;
//!     println!("status={} bytes={}", response.status(), response.body().len());
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep one [`HttpClient`] per process and clone it; clones share the pool.
//! - Leave the idle reaper on so connections closed by servers are evicted
//!   before they are leased.
//! - Opt into failing calls on error statuses with
//!   [`LoggingResponsePolicy::fatal_on`] instead of inspecting every response.

mod body;
mod client;
mod config;
mod connector;
mod destination;
mod error;
mod interceptor;
mod keep_alive;
mod metrics;
mod policy;
mod pool;
mod reaper;
mod request;
mod response;
mod transport;
mod util;

pub use crate::client::{ClientBuilder, HttpClient};
pub use crate::config::{ClientConfig, IdleReaperSchedule, PoolLimits, Timeouts};
pub use crate::connector::{ConnectorOptions, HttpConnection, HttpConnector};
pub use crate::destination::{Destination, Scheme};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::interceptor::{
    FnInterceptor, FnTerminal, Interceptor, InterceptorChain, LoggingInterceptor, Next, Terminal,
};
pub use crate::keep_alive::{HeaderKeepAlivePolicy, KeepAlivePolicy};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::policy::{LoggingResponsePolicy, Outcome, RequestContext, ResponsePolicy};
pub use crate::pool::{
    Connect, Connection, ConnectionPool, DestinationStats, Lease, PoolStats, Poolable,
};
pub use crate::reaper::IdleReaper;
pub use crate::request::{RequestEnvelope, RequestTimeouts};
pub use crate::response::{Response, ResponseHead};
pub use crate::transport::TransportClient;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ClientBuilder, ClientConfig, Destination, Error, ErrorCode, HttpClient, Interceptor,
        LoggingInterceptor, LoggingResponsePolicy, Next, Outcome, RequestEnvelope,
        RequestTimeouts, Response, ResponsePolicy, TimeoutPhase,
    };
}

#[cfg(test)]
mod tests;
