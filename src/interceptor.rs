//! Middleware around request execution.
//!
//! Interceptors run in registration order. Each receives the request and a
//! [`Next`] handle; calling [`Next::run`] hands the request to the next
//! interceptor (or the transport when none are left) and resolves to its
//! response. Code after that call runs in reverse registration order. An
//! interceptor that returns without calling `run` short-circuits the rest of
//! the chain.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::Error;
use crate::request::RequestEnvelope;
use crate::response::Response;
use crate::util::{redact_headers_for_logs, redact_uri_for_logs};

pub trait Interceptor: Send + Sync {
    fn intercept<'a>(
        &'a self,
        request: RequestEnvelope,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response, Error>>;
}

/// The innermost step of a chain, normally the transport.
pub trait Terminal: Send + Sync {
    fn call(&self, request: RequestEnvelope) -> BoxFuture<'_, Result<Response, Error>>;
}

/// Remainder of the chain after the current interceptor.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub fn run(self, request: RequestEnvelope) -> BoxFuture<'a, Result<Response, Error>> {
        match self.interceptors.split_first() {
            Some((interceptor, rest)) => interceptor.intercept(
                request,
                Next {
                    interceptors: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.call(request),
        }
    }

    /// Interceptors still ahead of the terminal.
    pub fn remaining(&self) -> usize {
        self.interceptors.len()
    }
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I>(&mut self, interceptor: I)
    where
        I: Interceptor + 'static,
    {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn push_arc(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn run<'a>(
        &'a self,
        request: RequestEnvelope,
        terminal: &'a dyn Terminal,
    ) -> BoxFuture<'a, Result<Response, Error>> {
        Next {
            interceptors: &self.interceptors,
            terminal,
        }
        .run(request)
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

/// Adapts a closure into an [`Interceptor`].
///
/// ```
/// use reqpool::{FnInterceptor, InterceptorChain};
///
/// let mut chain = InterceptorChain::new();
/// chain.push(FnInterceptor::new(|mut request, next| {
///     request.headers_mut().insert("x-trace", http::HeaderValue::from_static("on"));
///     next.run(request)
/// }));
/// assert_eq!(chain.len(), 1);
/// ```
pub struct FnInterceptor<F> {
    function: F,
}

impl<F> FnInterceptor<F>
where
    F: for<'a> Fn(RequestEnvelope, Next<'a>) -> BoxFuture<'a, Result<Response, Error>>
        + Send
        + Sync,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: for<'a> Fn(RequestEnvelope, Next<'a>) -> BoxFuture<'a, Result<Response, Error>>
        + Send
        + Sync,
{
    fn intercept<'a>(
        &'a self,
        request: RequestEnvelope,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response, Error>> {
        (self.function)(request, next)
    }
}

/// Adapts an async closure into a [`Terminal`].
pub struct FnTerminal<F> {
    function: F,
}

impl<F, Fut> FnTerminal<F>
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F, Fut> Terminal for FnTerminal<F>
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    fn call(&self, request: RequestEnvelope) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin((self.function)(request))
    }
}

/// Logs each request line and header set before sending, then the status and
/// latency. Credential headers are masked and bodies are never read.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        request: RequestEnvelope,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let method = request.method().clone();
            let uri = redact_uri_for_logs(&request.uri().to_string());
            debug!(
                method = %method,
                uri = %uri,
                headers = ?redact_headers_for_logs(request.headers()),
                body_bytes = request.body_bytes().len(),
                "sending http request"
            );

            let started = Instant::now();
            let result = next.run(request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => debug!(
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    elapsed_ms,
                    "received http response"
                ),
                Err(error) => debug!(
                    method = %method,
                    uri = %uri,
                    error_code = error.code().as_str(),
                    elapsed_ms,
                    "http request failed"
                ),
            }
            result
        })
    }
}
