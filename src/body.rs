use bytes::Bytes;
use http::header::HOST;
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::destination::Destination;
use crate::error::Error;

pub(crate) type ReqBody = Full<Bytes>;

/// Builds the wire request: origin-form target plus a `Host` header derived
/// from the destination unless the caller set one.
pub(crate) fn build_http_request(
    method: Method,
    uri: &Uri,
    destination: &Destination,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<ReqBody>, Error> {
    let target = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let mut request_builder = Request::builder().method(method).uri(target.as_str());
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    if !headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&destination.host_header()).map_err(|source| {
            Error::InvalidHeaderValue {
                name: HOST.as_str().to_owned(),
                source,
            }
        })?;
        request_builder = request_builder.header(HOST, host);
    }
    request_builder
        .body(Full::new(body))
        .map_err(|source| Error::RequestBuild { source })
}

pub(crate) enum ReadBodyError {
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
}

pub(crate) async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
