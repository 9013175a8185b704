use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{Instrument, debug, info_span};

use crate::config::{
    ClientConfig, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_RESPONSE_BODY_BYTES, IdleReaperSchedule,
    PoolLimits, Timeouts,
};
use crate::connector::{ConnectorOptions, HttpConnector};
use crate::destination::Destination;
use crate::error::Error;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::keep_alive::{HeaderKeepAlivePolicy, KeepAlivePolicy};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::policy::{LoggingResponsePolicy, Outcome, RequestContext, ResponsePolicy};
use crate::pool::{ConnectionPool, PoolStats};
use crate::reaper::IdleReaper;
use crate::request::RequestEnvelope;
use crate::response::Response;
use crate::transport::TransportClient;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

const DEFAULT_CLIENT_NAME: &str = "reqpool";

pub struct ClientBuilder {
    client_name: String,
    limits: PoolLimits,
    timeouts: Timeouts,
    default_keep_alive: Duration,
    keep_alive_policy: Option<Arc<dyn KeepAlivePolicy>>,
    idle_reaper: Option<IdleReaperSchedule>,
    interceptors: InterceptorChain,
    response_policy: Arc<dyn ResponsePolicy>,
    max_response_body_bytes: usize,
    connector_options: ConnectorOptions,
    metrics_enabled: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            limits: PoolLimits::default(),
            timeouts: Timeouts::default(),
            default_keep_alive: DEFAULT_KEEP_ALIVE,
            keep_alive_policy: None,
            idle_reaper: Some(IdleReaperSchedule::default()),
            interceptors: InterceptorChain::new(),
            response_policy: Arc::new(LoggingResponsePolicy::new()),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            connector_options: ConnectorOptions::default(),
            metrics_enabled: false,
        }
    }

    /// Starts from a deserialized [`ClientConfig`], rejecting invalid values.
    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            limits: config.pool_limits(),
            timeouts: config.timeouts(),
            default_keep_alive: config.default_keep_alive(),
            idle_reaper: Some(config.idle_reaper_schedule()),
            max_response_body_bytes: config.max_response_body_bytes,
            connector_options: ConnectorOptions {
                tcp_nodelay: config.tcp_nodelay,
            },
            ..Self::new()
        })
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_total_connections(mut self, max_total: usize) -> Self {
        let mut limits = PoolLimits::new(max_total, self.limits.default_max_per_destination());
        for (destination, max) in self.limits.overrides() {
            limits = limits.max_per_destination(destination.clone(), *max);
        }
        self.limits = limits;
        self
    }

    pub fn max_per_destination(mut self, destination: Destination, max: usize) -> Self {
        self.limits = self.limits.max_per_destination(destination, max);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    pub fn lease_wait_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.lease_wait = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.read = timeout;
        self
    }

    /// Keep-alive window used when a response carries no usable hint.
    /// Ignored once a custom policy is set with
    /// [`ClientBuilder::keep_alive_policy`].
    pub fn default_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.default_keep_alive = keep_alive;
        self
    }

    pub fn keep_alive_policy<P>(mut self, policy: P) -> Self
    where
        P: KeepAlivePolicy + 'static,
    {
        self.keep_alive_policy = Some(Arc::new(policy));
        self
    }

    pub fn idle_reaper(mut self, schedule: IdleReaperSchedule) -> Self {
        self.idle_reaper = Some(schedule);
        self
    }

    pub fn disable_idle_reaper(mut self) -> Self {
        self.idle_reaper = None;
        self
    }

    pub fn interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push_arc(interceptor);
        self
    }

    pub fn response_policy<P>(mut self, policy: P) -> Self
    where
        P: ResponsePolicy + 'static,
    {
        self.response_policy = Arc::new(policy);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.connector_options.tcp_nodelay = enabled;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Result<HttpClient, Error> {
        let connector = HttpConnector::new(self.connector_options)?;
        let pool = ConnectionPool::new(connector, self.limits);
        let keep_alive_policy: Arc<dyn KeepAlivePolicy> = match self.keep_alive_policy {
            Some(policy) => policy,
            None => Arc::new(HeaderKeepAlivePolicy::new(self.default_keep_alive)),
        };
        let reaper = self
            .idle_reaper
            .map(|schedule| IdleReaper::spawn(&pool, schedule))
            .transpose()?;
        let transport = TransportClient::new(pool)
            .keep_alive_policy(keep_alive_policy)
            .timeouts(self.timeouts)
            .max_response_body_bytes(self.max_response_body_bytes);
        let metrics = if self.metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        debug!(
            client = %self.client_name,
            interceptors = self.interceptors.len(),
            idle_reaper = reaper.is_some(),
            "http client built"
        );

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                client_name: self.client_name,
                transport,
                interceptors: self.interceptors,
                response_policy: self.response_policy,
                metrics,
                reaper: Mutex::new(reaper),
            }),
        })
    }

    pub fn build(self) -> HttpClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqpool http client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    client_name: String,
    transport: TransportClient,
    interceptors: InterceptorChain,
    response_policy: Arc<dyn ResponsePolicy>,
    metrics: ClientMetrics,
    reaper: Mutex<Option<IdleReaper>>,
}

/// Cheaply cloneable handle; clones share one pool, reaper and chain.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    /// Runs `request` through the interceptor chain and the transport, then
    /// applies the response policy.
    ///
    /// 4xx and 5xx responses are returned as `Ok` unless the response policy
    /// marks their outcome fatal.
    pub async fn execute(&self, request: RequestEnvelope) -> Result<Response, Error> {
        let method = request.method().clone();
        let uri = redact_uri_for_logs(&request.uri().to_string());
        let span = info_span!(
            "reqpool.request",
            client = %self.inner.client_name,
            method = %method,
            uri = %uri
        );
        let context = RequestContext::new(method, uri);
        self.execute_with_context(request, context)
            .instrument(span)
            .await
    }

    async fn execute_with_context(
        &self,
        request: RequestEnvelope,
        context: RequestContext,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        inner.metrics.record_request_started();
        let _in_flight = inner.metrics.enter_in_flight();
        let started = Instant::now();

        let (result, outcome) = match inner.interceptors.run(request, &inner.transport).await {
            Ok(response) => {
                let outcome = inner.response_policy.classify(&response);
                (self.apply_response_policy(&context, response, outcome), Some(outcome))
            }
            Err(error) => {
                debug!(error_code = error.code().as_str(), error = %error, "request failed");
                (Err(error), None)
            }
        };

        inner
            .metrics
            .record_request_completed(&result, outcome, started.elapsed());
        result
    }

    fn apply_response_policy(
        &self,
        context: &RequestContext,
        response: Response,
        outcome: Outcome,
    ) -> Result<Response, Error> {
        if !outcome.is_error() {
            return Ok(response);
        }
        let policy = &self.inner.response_policy;
        policy.on_error(context, &response, outcome);
        if policy.is_fatal(outcome) {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                outcome,
                method: context.method().clone(),
                uri: context.uri().to_owned(),
            });
        }
        Ok(response)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.transport.pool().stats()
    }

    /// Closes pooled connections whose keep-alive window has passed, without
    /// waiting for the idle reaper.
    pub fn close_expired(&self) -> usize {
        self.inner.transport.pool().close_expired()
    }

    pub fn close_idle_longer_than(&self, idle: Duration) -> usize {
        self.inner.transport.pool().close_idle_longer_than(idle)
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn has_idle_reaper(&self) -> bool {
        lock_unpoisoned(&self.inner.reaper)
            .as_ref()
            .is_some_and(IdleReaper::is_running)
    }

    /// Stops the idle reaper and closes the pool. Requests issued afterwards
    /// fail with [`Error::PoolClosed`]; connections still leased are closed
    /// when their requests finish.
    pub fn shutdown(&self) {
        if let Some(reaper) = lock_unpoisoned(&self.inner.reaper).take() {
            reaper.cancel();
        }
        self.inner.transport.pool().shutdown();
        debug!(client = %self.inner.client_name, "http client shut down");
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("client_name", &self.inner.client_name)
            .field("interceptors", &self.inner.interceptors.len())
            .finish_non_exhaustive()
    }
}
