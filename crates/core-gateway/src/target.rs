use http::{HeaderMap, Uri};
use url::form_urlencoded;
use url::Url;

use crate::error::GatewayError;
use crate::headers::{X_CORE_BASE, X_CORE_BEARER};

/// Query parameters consumed by the gateway and never forwarded.
const INTERNAL_PARAMS: [&str; 3] = ["coreBase", "coreBearer", "token"];

/// Where one gateway request is going.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Full upstream URL: validated base, request path and filtered query.
    pub url: Url,
    /// Credential injected as `Authorization: Bearer <bearer>` upstream.
    pub bearer: Option<String>,
}

impl std::fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTarget")
            .field("url", &self.url.as_str())
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyTarget {
    /// Resolve the target of a request whose path relative to the gateway
    /// mount point is `uri.path()`.
    ///
    /// The base comes from `X-Core-Base`, falling back to the `coreBase`
    /// query parameter, and must pass the loopback guard. The bearer comes
    /// from `X-Core-Bearer`, falling back to `coreBearer`.
    pub fn resolve(headers: &HeaderMap, uri: &Uri) -> Result<Self, GatewayError> {
        let query = uri.query().unwrap_or("");
        let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let param = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
        };

        let base = header_str(headers, &X_CORE_BASE)
            .or_else(|| param("coreBase"))
            .unwrap_or("");
        let mut url = net_guard::validate_core_base(base)?;

        let bearer = header_str(headers, &X_CORE_BEARER)
            .or_else(|| param("coreBearer"))
            .map(str::to_string);

        let path = uri.path();
        if path.starts_with('/') {
            url.set_path(path);
        } else {
            url.set_path(&format!("/{path}"));
        }

        let forwarded: Vec<&(String, String)> = params
            .iter()
            .filter(|(k, _)| !INTERNAL_PARAMS.contains(&k.as_str()))
            .collect();
        if forwarded.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(forwarded.iter().map(|(k, v)| (k, v)));
        }
        url.set_fragment(None);

        Ok(Self { url, bearer })
    }

    /// The same target with `http`/`https` mapped to `ws`/`wss`.
    pub fn websocket_url(&self) -> Url {
        let mut url = self.url.clone();
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            // Both are special schemes, so the switch cannot fail.
            let _ = url.set_scheme(scheme);
        }
        url
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &http::HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
