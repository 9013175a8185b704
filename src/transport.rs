use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::body::{ReadBodyError, build_http_request, read_all_body_limited};
use crate::config::{DEFAULT_MAX_RESPONSE_BODY_BYTES, Timeouts};
use crate::connector::{HttpConnection, HttpConnector};
use crate::destination::Destination;
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::interceptor::Terminal;
use crate::keep_alive::{HeaderKeepAlivePolicy, KeepAlivePolicy};
use crate::pool::{Connect, ConnectionPool, Lease};
use crate::request::{RequestEnvelope, RequestTimeouts};
use crate::response::{Response, ResponseHead};
use crate::util::{is_idempotent, redact_uri_for_logs};

/// Executes single requests over pooled HTTP/1.1 connections.
pub struct TransportClient<C = HttpConnector>
where
    C: Connect<Connection = HttpConnection>,
{
    pool: ConnectionPool<C>,
    keep_alive: Arc<dyn KeepAlivePolicy>,
    timeouts: Timeouts,
    max_response_body_bytes: usize,
}

impl<C> Clone for TransportClient<C>
where
    C: Connect<Connection = HttpConnection>,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            keep_alive: Arc::clone(&self.keep_alive),
            timeouts: self.timeouts,
            max_response_body_bytes: self.max_response_body_bytes,
        }
    }
}

enum ExchangeError {
    Send(hyper::Error),
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
}

impl ExchangeError {
    /// The peer closed a pooled connection before answering: nothing was
    /// processed, so an idempotent request may go out again.
    fn is_stale_connection(&self) -> bool {
        match self {
            Self::Send(error) => {
                error.is_incomplete_message() || error.is_canceled() || error.is_closed()
            }
            Self::Read(_) | Self::TooLarge { .. } => false,
        }
    }
}

impl<C> TransportClient<C>
where
    C: Connect<Connection = HttpConnection>,
{
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self {
            pool,
            keep_alive: Arc::new(HeaderKeepAlivePolicy::default()),
            timeouts: Timeouts::default(),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    pub fn keep_alive_policy(mut self, policy: Arc<dyn KeepAlivePolicy>) -> Self {
        self.keep_alive = policy;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Sends `request` and reads the complete response.
    ///
    /// The connection goes back to the pool for as long as the keep-alive
    /// policy allows, or is closed on any failure. When the request carries a
    /// cancellation token, cancelling it ends the call with
    /// [`Error::Cancelled`] and closes the in-flight connection.
    pub async fn execute(&self, request: RequestEnvelope) -> Result<Response, Error> {
        let Some(token) = request.cancellation().cloned() else {
            return self.execute_exchange(request).await;
        };

        let method = request.method().clone();
        let uri = redact_uri_for_logs(&request.uri().to_string());
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(method = %method, uri = %uri, "request cancelled");
                Err(Error::Cancelled { method, uri })
            }
            result = self.execute_exchange(request) => result,
        }
    }

    fn resolve_timeouts(&self, overrides: RequestTimeouts) -> Timeouts {
        Timeouts {
            connect: overrides.connect.unwrap_or(self.timeouts.connect),
            lease_wait: overrides.lease_wait.unwrap_or(self.timeouts.lease_wait),
            read: overrides.read.unwrap_or(self.timeouts.read),
        }
    }

    async fn execute_exchange(&self, request: RequestEnvelope) -> Result<Response, Error> {
        let timeouts = self.resolve_timeouts(request.request_timeouts());
        let destination = request.destination().clone();
        let method = request.method().clone();
        let lease_deadline = Instant::now() + timeouts.lease_wait;
        let mut retried_stale = false;

        loop {
            let lease_wait = lease_deadline.saturating_duration_since(Instant::now());
            let mut lease = self
                .pool
                .acquire(&destination, lease_wait, timeouts.connect)
                .await?;
            let reused = lease.is_reused();

            if reused && lease.io_mut().sender_mut().ready().await.is_err() {
                debug!(
                    destination = %destination,
                    connection_id = lease.id(),
                    "pooled connection closed by peer; leasing another"
                );
                lease.destroy();
                continue;
            }

            let http_request = build_http_request(
                method.clone(),
                request.uri(),
                &destination,
                request.headers(),
                request.body_bytes().clone(),
            )?;

            let started = Instant::now();
            let exchange = tokio::time::timeout(
                timeouts.read,
                send_and_read(&mut lease, http_request, self.max_response_body_bytes),
            )
            .await;

            match exchange {
                Ok(Ok((head, body))) => {
                    let keep_alive = self.keep_alive.decide(&head);
                    trace!(
                        destination = %destination,
                        connection_id = lease.id(),
                        status = head.status.as_u16(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        keep_alive_ms = keep_alive.as_millis() as u64,
                        "http exchange completed"
                    );
                    lease.release(keep_alive);
                    return Ok(Response::from_parts(head, body));
                }
                Ok(Err(failure)) => {
                    lease.destroy();
                    if reused
                        && !retried_stale
                        && is_idempotent(&method)
                        && failure.is_stale_connection()
                    {
                        debug!(
                            destination = %destination,
                            method = %method,
                            "pooled connection failed before responding; retrying once"
                        );
                        retried_stale = true;
                        continue;
                    }
                    return Err(self.map_exchange_error(failure, &destination, &request));
                }
                Err(_) => {
                    lease.destroy();
                    debug!(
                        destination = %destination,
                        timeout_ms = timeouts.read.as_millis() as u64,
                        "read timed out"
                    );
                    return Err(Error::Timeout {
                        phase: TimeoutPhase::Read,
                        timeout_ms: timeouts.read.as_millis(),
                        destination,
                    });
                }
            }
        }
    }

    fn map_exchange_error(
        &self,
        failure: ExchangeError,
        destination: &Destination,
        request: &RequestEnvelope,
    ) -> Error {
        match failure {
            ExchangeError::TooLarge { actual_bytes } => {
                debug!(
                    destination = %destination,
                    actual_bytes,
                    limit_bytes = self.max_response_body_bytes,
                    "response body exceeded limit"
                );
                Error::ResponseBodyTooLarge {
                    limit_bytes: self.max_response_body_bytes,
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(&request.uri().to_string()),
                }
            }
            ExchangeError::Send(source) | ExchangeError::Read(source) if source.is_parse() => {
                Error::Protocol {
                    destination: destination.clone(),
                    source: Box::new(source),
                }
            }
            ExchangeError::Send(source) | ExchangeError::Read(source) => Error::Transport {
                kind: classify_exchange_error(&source),
                destination: destination.clone(),
                source: Box::new(source),
            },
        }
    }
}

impl<C> Terminal for TransportClient<C>
where
    C: Connect<Connection = HttpConnection>,
{
    fn call(&self, request: RequestEnvelope) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin(self.execute(request))
    }
}

async fn send_and_read(
    lease: &mut Lease<HttpConnection>,
    request: http::Request<crate::body::ReqBody>,
    max_response_body_bytes: usize,
) -> Result<(ResponseHead, bytes::Bytes), ExchangeError> {
    let sender = lease.io_mut().sender_mut();
    sender.ready().await.map_err(ExchangeError::Send)?;
    let response = sender
        .send_request(request)
        .await
        .map_err(ExchangeError::Send)?;
    let (parts, incoming) = response.into_parts();
    let body = read_all_body_limited(incoming, max_response_body_bytes)
        .await
        .map_err(|error| match error {
            ReadBodyError::Read(source) => ExchangeError::Read(source),
            ReadBodyError::TooLarge { actual_bytes } => ExchangeError::TooLarge { actual_bytes },
        })?;
    let head = ResponseHead {
        status: parts.status,
        version: parts.version,
        headers: parts.headers,
    };
    Ok((head, body))
}

fn classify_exchange_error(error: &hyper::Error) -> TransportErrorKind {
    if error.is_incomplete_message() || error.is_body_write_aborted() || error.is_closed() {
        return TransportErrorKind::Read;
    }
    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}
