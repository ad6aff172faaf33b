use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

/// Reasons a declared upstream base URL is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    /// No base URL was supplied with the request.
    #[error("missing core base")]
    Missing,

    /// The base URL could not be parsed or has no usable host.
    #[error("invalid core base: {0}")]
    Invalid(String),

    /// The base URL points somewhere other than this host.
    #[error("core base must be loopback (got {host})")]
    NotLoopback { host: String },
}

impl GuardError {
    /// HTTP status a gateway should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::Missing | GuardError::Invalid(_) => 400,
            GuardError::NotLoopback { .. } => 403,
        }
    }
}

const ALLOWED_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

/// Parses `raw` and accepts it only if its host is loopback.
///
/// Accepted hosts are the literal `localhost`, any address in `127.0.0.0/8`,
/// `::1`, and IPv4-mapped IPv6 forms of `127.0.0.0/8`. The check happens on
/// the parsed URL, never on the raw string, so userinfo tricks such as
/// `http://127.0.0.1@example.com` resolve to their real host first.
pub fn validate_core_base(raw: &str) -> Result<Url, GuardError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GuardError::Missing);
    }

    let url = Url::parse(raw).map_err(|e| GuardError::Invalid(e.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(GuardError::Invalid(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| GuardError::Invalid("no host".to_string()))?;
    if !is_loopback_host(&host) {
        let host = host.to_string();
        warn!(%host, "rejected non-loopback core base");
        return Err(GuardError::NotLoopback { host });
    }

    debug!(base = %url, "core base accepted");
    Ok(url)
}

/// Whether a parsed URL host refers to this machine.
pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => is_loopback_v6(ip),
    }
}

/// Whether an IP address is loopback, treating IPv4-mapped IPv6 addresses
/// as their IPv4 form.
pub fn is_loopback_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => is_loopback_v6(&v6),
    }
}

fn is_loopback_v6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
}
