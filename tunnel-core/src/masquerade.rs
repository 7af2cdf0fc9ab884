//! Masquerade: the indistinguishable fallback path for any request that
//! fails authentication (or never attempted it). The request is
//! reverse-proxied byte-for-byte to a configured innocuous origin so a
//! censor probing the server sees an ordinary web site, not a distinct
//! "auth failed" response.
//!
//! Grounded on `server.go`'s `Handler.redirect`.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use crate::error::{Error, Result};

/// Forwards `request` to `pretend_origin`, preserving method, headers,
/// and body, and returns the origin's response unmodified. Any transport
/// failure degrades to a generic 502 rather than leaking why the proxy
/// attempt was made.
pub async fn reverse_proxy(
    request: Request<Incoming>,
    pretend_origin: &Uri,
) -> Result<Response<Full<Bytes>>> {
    let client: Client<HttpConnector, Incoming> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let forwarded_uri = format!(
        "{}://{}{}",
        pretend_origin.scheme_str().unwrap_or("http"),
        pretend_origin
            .authority()
            .map(|a| a.as_str())
            .unwrap_or(""),
        path_and_query
    );
    parts.uri = forwarded_uri
        .parse()
        .map_err(|e| Error::Fatal(format!("invalid masquerade origin: {e}")))?;

    let upstream_request = Request::from_parts(parts, body);

    match client.request(upstream_request).await {
        Ok(upstream_response) => {
            let (parts, body) = upstream_response.into_parts();
            let collected = body
                .collect()
                .await
                .map_err(|e| Error::Transient(format!("reading masquerade body: {e}")))?
                .to_bytes();
            Ok(Response::from_parts(parts, Full::new(collected)))
        }
        Err(e) => {
            warn!(error = %e, "masquerade upstream unreachable");
            Ok(Response::builder()
                .status(hyper::StatusCode::BAD_GATEWAY)
                .body(Full::new(Bytes::from_static(b"Bad Gateway")))
                .expect("static masquerade response is well-formed"))
        }
    }
}
