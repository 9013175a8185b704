//! TCP (and optionally TLS) connector producing HTTP/1.1 connections.

use std::future::poll_fn;

use futures_util::future::BoxFuture;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::client::legacy::connect::HttpConnector as TcpConnector;
use tower_service::Service;
use tracing::{debug, trace};

use crate::body::ReqBody;
use crate::destination::{Destination, Scheme};
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::pool::{Connect, Poolable};

#[cfg(feature = "tls-rustls")]
type ConnectorStack = hyper_rustls::HttpsConnector<TcpConnector>;
#[cfg(not(feature = "tls-rustls"))]
type ConnectorStack = TcpConnector;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectorOptions {
    pub tcp_nodelay: bool,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self { tcp_nodelay: true }
    }
}

/// Handle to one HTTP/1.1 connection. The connection's I/O is driven by a
/// background task; the handle closes once that task stops.
pub struct HttpConnection {
    sender: SendRequest<ReqBody>,
}

impl HttpConnection {
    pub(crate) fn sender_mut(&mut self) -> &mut SendRequest<ReqBody> {
        &mut self.sender
    }
}

impl Poolable for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpConnection")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

#[derive(Clone)]
pub struct HttpConnector {
    stack: ConnectorStack,
}

impl HttpConnector {
    pub fn new(options: ConnectorOptions) -> Result<Self, Error> {
        let mut tcp = TcpConnector::new();
        tcp.enforce_http(false);
        tcp.set_nodelay(options.tcp_nodelay);
        Ok(Self {
            stack: wrap_tls(tcp)?,
        })
    }
}

impl std::fmt::Debug for HttpConnector {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpConnector")
            .field("tls", &cfg!(feature = "tls-rustls"))
            .finish()
    }
}

impl Connect for HttpConnector {
    type Connection = HttpConnection;

    fn connect<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> BoxFuture<'a, Result<HttpConnection, Error>> {
        Box::pin(async move {
            if destination.scheme() == Scheme::Https && !cfg!(feature = "tls-rustls") {
                return Err(Error::Transport {
                    kind: TransportErrorKind::Tls,
                    destination: destination.clone(),
                    source: "https destinations need the `tls-rustls` feature".into(),
                });
            }

            let uri = destination.to_uri()?;
            let mut stack = self.stack.clone();
            poll_fn(|cx| stack.poll_ready(cx))
                .await
                .map_err(|source| connect_error(destination, source.into()))?;
            trace!(destination = %destination, "opening tcp connection");
            let io = stack
                .call(uri)
                .await
                .map_err(|source| connect_error(destination, source.into()))?;

            let (sender, connection) = http1::handshake::<_, ReqBody>(io)
                .await
                .map_err(|source| Error::Transport {
                    kind: TransportErrorKind::Connect,
                    destination: destination.clone(),
                    source: Box::new(source),
                })?;

            let driver_destination = destination.clone();
            tokio::spawn(async move {
                if let Err(error) = connection.await {
                    debug!(
                        destination = %driver_destination,
                        error = %error,
                        "http connection closed with error"
                    );
                }
            });

            Ok(HttpConnection { sender })
        })
    }
}

fn connect_error(destination: &Destination, source: BoxError) -> Error {
    Error::Transport {
        kind: classify_connect_error(&source),
        destination: destination.clone(),
        source,
    }
}

pub(crate) fn classify_connect_error(error: &BoxError) -> TransportErrorKind {
    let text = error_chain_text(error.as_ref());
    if text.contains("dns")
        || text.contains("name or service not known")
        || text.contains("failed to lookup address")
    {
        return TransportErrorKind::Dns;
    }
    if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Connect
}

fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }
    text
}

#[cfg(feature = "tls-rustls")]
fn wrap_tls(tcp: TcpConnector) -> Result<ConnectorStack, Error> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(build_rustls_tls_config()?)
        .https_or_http()
        .enable_http1()
        .wrap_connector(tcp))
}

#[cfg(not(feature = "tls-rustls"))]
fn wrap_tls(tcp: TcpConnector) -> Result<ConnectorStack, Error> {
    Ok(tcp)
}

#[cfg(feature = "tls-rustls")]
fn build_rustls_tls_config() -> Result<rustls::ClientConfig, Error> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsConfig {
            message: source.to_string(),
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth())
}
