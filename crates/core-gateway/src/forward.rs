use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::header::{HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::headers;
use crate::target::ProxyTarget;

/// Largest request body the gateway buffers before forwarding.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// `Authorization` value for an upstream bearer.
pub(crate) fn bearer_header(bearer: &str) -> Result<HeaderValue, GatewayError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {bearer}"))
        .map_err(|_| GatewayError::InvalidBearer)?;
    value.set_sensitive(true);
    Ok(value)
}

/// Send `request` to `target` and stream the upstream answer back.
pub(crate) async fn forward_http(
    client: &reqwest::Client,
    request: Request,
    target: &ProxyTarget,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(GatewayError::Body)?;

    let mut upstream_headers = headers::request_headers(&parts.headers);
    if let Some(bearer) = &target.bearer {
        upstream_headers.insert(AUTHORIZATION, bearer_header(bearer)?);
    }

    debug!(method = %parts.method, url = %target.url, "forwarding core request");
    let upstream = client
        .request(parts.method, target.url.clone())
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            warn!(url = %target.url, %err, "core upstream unreachable");
            GatewayError::Upstream(err)
        })?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = upstream.status();
    *response.headers_mut() = headers::response_headers(upstream.headers());
    *response.body_mut() = Body::from_stream(upstream.bytes_stream());
    Ok(response)
}
