use http::header::{self, HeaderMap, HeaderName};

/// Gateway-internal header carrying the upstream base URL.
pub const X_CORE_BASE: HeaderName = HeaderName::from_static("x-core-base");

/// Gateway-internal header carrying the upstream bearer credential.
pub const X_CORE_BEARER: HeaderName = HeaderName::from_static("x-core-bearer");

/// Connection-scoped headers that are never copied across the gateway.
pub const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Headers of an inbound request that may be sent upstream.
///
/// Besides hop-by-hop headers this drops `Host` and `Content-Length`
/// (recomputed by the client), the gateway-internal headers, and the
/// session `Authorization`, which belongs to this server, not the upstream.
pub fn request_headers(src: &HeaderMap) -> HeaderMap {
    copy_except(src, |name| {
        *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::AUTHORIZATION
            || *name == X_CORE_BASE
            || *name == X_CORE_BEARER
    })
}

/// Headers of an upstream response that may be sent back to the browser.
pub fn response_headers(src: &HeaderMap) -> HeaderMap {
    copy_except(src, |name| *name == header::CONTENT_LENGTH)
}

fn copy_except(src: &HeaderMap, skip: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if is_hop_by_hop(name) || skip(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}
