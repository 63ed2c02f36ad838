//! Source IP extraction for span tags.
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::HeaderName;

use crate::request::RequestHead;

const FORWARDED: &str = "forwarded";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Extracts the client source IPs of a request.
///
/// Extraction never fails: an empty string means nothing could be determined.
pub trait SourceIpExtractor: Send + Sync {
    fn source_ips(&self, request: &RequestHead<'_>) -> String;
}

impl<F> SourceIpExtractor for F
where
    F: Fn(&RequestHead<'_>) -> String + Send + Sync,
{
    fn source_ips(&self, request: &RequestHead<'_>) -> String {
        self(request)
    }
}

/// Combines the peer address with the address reported by proxy headers.
///
/// The peer address comes from axum's [`ConnectInfo<SocketAddr>`], so the
/// server must be started with `into_make_service_with_connect_info`.
///
/// Without a custom header the proxy address is read from `Forwarded`,
/// `X-Real-IP` and `X-Forwarded-For`, in that order.
#[derive(Debug, Clone, Default)]
pub struct ForwardedSourceIps {
    header: Option<HeaderName>,
}

impl ForwardedSourceIps {
    /// Creates a [`ForwardedSourceIps`] that reads the standard proxy headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [`ForwardedSourceIps`] that only trusts the given header.
    pub fn with_header(header: HeaderName) -> Self {
        Self {
            header: Some(header),
        }
    }

    fn forwarded_ip(&self, request: &RequestHead<'_>) -> Option<String> {
        if let Some(header) = &self.header {
            return request.header_str(header.as_str()).map(|v| v.trim().to_string());
        }

        if let Some(forwarded) = request.header_str(FORWARDED) {
            return parse_forwarded_for(forwarded);
        }
        if let Some(real_ip) = request.header_str(X_REAL_IP) {
            return Some(real_ip.trim().to_string());
        }
        request
            .header_str(X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
    }
}

impl SourceIpExtractor for ForwardedSourceIps {
    fn source_ips(&self, request: &RequestHead<'_>) -> String {
        let forwarded = self
            .forwarded_ip(request)
            .map(|addr| extract_host(&addr))
            .filter(|addr| !addr.is_empty());
        let remote = request
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        match (remote, forwarded) {
            (None, None) => String::new(),
            (Some(remote), None) => remote,
            (None, Some(forwarded)) => forwarded,
            (Some(remote), Some(forwarded)) if remote == forwarded => remote,
            (Some(remote), Some(forwarded)) => format!("{remote}, {forwarded}"),
        }
    }
}

/// Returns the value of the first `for` parameter of a `Forwarded` header value.
fn parse_forwarded_for(value: &str) -> Option<String> {
    value
        .split([';', ','])
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("for"))
        .map(|(_, addr)| addr.trim().trim_matches('"').to_string())
        .filter(|addr| !addr.is_empty())
}

/// Strips an optional port from `address`.
fn extract_host(address: &str) -> String {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = address.trim_matches(['[', ']']).parse::<IpAddr>() {
        return ip.to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => address.to_string(),
    }
}
