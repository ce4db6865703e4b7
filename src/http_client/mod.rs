//! C2 — Safe outbound HTTP client.
//!
//! A single typed client configured once (connect/overall timeout, max redirects,
//! max response bytes, SSRF mode, insecure-skip-verify). Grounded on the teacher's
//! OG-preview fetcher (`reqwest::Client::builder().timeout(..).redirect(Policy::limited(..))`,
//! scheme allowlist, capped body read), generalized into a reusable client that also
//! enforces the signed-request no-redirect invariant and same-host/no-downgrade
//! redirect discipline.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Method, StatusCode, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrfMode {
    Strict,
    Off,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub max_redirects: u8,
    pub max_response_bytes: u64,
    pub ssrf_mode: SsrfMode,
    pub insecure_skip_verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            max_redirects: 1,
            max_response_bytes: 10 * 1024 * 1024,
            ssrf_mode: SsrfMode::Strict,
            insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum HttpClientError {
    #[error("SSRF blocked: {0}")]
    SsrfBlocked(String),
    #[error("host unresolvable: {0}")]
    HostUnresolvable(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("response too large")]
    ResponseTooLarge,
    #[error("signed request must not follow redirect")]
    SignedNoRedirect,
    #[error("redirect target is not the same host")]
    RedirectNotSameHost,
    #[error("redirect would downgrade https to http")]
    RedirectDowngrade,
    #[error("redirect blocked: {0}")]
    RedirectBlocked(String),
    #[error("network error: {0}")]
    NetworkError(String),
}

/// Checks whether an `IpAddr` falls into a range forbidden under SSRF=strict.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || is_shared_address_space(v4)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_unique_local(v6)
                || is_unicast_link_local(v6)
        }
    }
}

/// 100.64.0.0/10 — carrier-grade NAT space, treated the same as RFC1918 here.
fn is_shared_address_space(v4: Ipv4Addr) -> bool {
    let o = v4.octets();
    o[0] == 100 && (o[1] & 0b1100_0000) == 64
}

/// fc00::/7
fn is_unique_local(v6: Ipv6Addr) -> bool {
    (v6.octets()[0] & 0xfe) == 0xfc
}

/// fe80::/10
fn is_unicast_link_local(v6: Ipv6Addr) -> bool {
    let o = v6.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

fn is_blocked_hostname(host: &str) -> bool {
    let h = host.to_ascii_lowercase();
    h == "localhost" || h == "localhost.localdomain"
}

/// Resolves `host` (literal IP or DNS name) and checks every candidate address.
/// Fails closed: an unresolvable hostname is rejected, never treated as safe.
pub async fn check_host_safe(host: &str, port: u16, mode: SsrfMode) -> Result<(), HttpClientError> {
    if mode == SsrfMode::Off {
        return Ok(());
    }
    if is_blocked_hostname(host) {
        return Err(HttpClientError::SsrfBlocked(host.to_string()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return if is_blocked_ip(ip) {
            Err(HttpClientError::SsrfBlocked(host.to_string()))
        } else {
            Ok(())
        };
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| HttpClientError::HostUnresolvable(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(HttpClientError::HostUnresolvable(host.to_string()));
    }
    for addr in addrs {
        if is_blocked_ip(addr.ip()) {
            return Err(HttpClientError::SsrfBlocked(host.to_string()));
        }
    }
    Ok(())
}

fn normalized_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let default_port = match url.scheme() {
        "https" => Some(443u16),
        "http" => Some(80u16),
        _ => None,
    };
    match url.port() {
        Some(p) if Some(p) != default_port => Some(format!("{host}:{p}")),
        _ => Some(host),
    }
}

fn port_for(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(443)
}

/// The SSRF-hardened outbound client. Proxy environment variables are ignored
/// unconditionally (`reqwest::Client::builder().no_proxy()`).
pub struct SafeHttpClient {
    inner: reqwest::Client,
    config: ClientConfig,
}

/// A request awaiting dispatch, carrying whether it is signed (governs redirect policy).
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub signed: bool,
}

pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl SafeHttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, HttpClientError> {
        let inner = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .no_proxy()
            .build()
            .map_err(|e| HttpClientError::NetworkError(e.to_string()))?;
        Ok(Self { inner, config })
    }

    /// Executes `req`, following redirects per spec §4.2's discipline. Returns the
    /// final response with a body capped at `max_response_bytes`.
    pub async fn execute(&self, mut req: OutboundRequest) -> Result<OutboundResponse, HttpClientError> {
        let mut hops = 0u8;
        loop {
            let host = req.url.host_str().ok_or_else(|| HttpClientError::HostUnresolvable(req.url.to_string()))?;
            check_host_safe(host, port_for(&req.url), self.config.ssrf_mode).await?;

            let resp = self.dispatch(&req).await?;

            if resp.status.is_redirection() {
                if req.signed {
                    return Err(HttpClientError::SignedNoRedirect);
                }
                if hops >= self.config.max_redirects {
                    return Err(HttpClientError::TooManyRedirects);
                }
                let location = resp
                    .headers
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| HttpClientError::RedirectBlocked("missing Location".into()))?;
                let next = req.url.join(location).map_err(|e| HttpClientError::RedirectBlocked(e.to_string()))?;

                if req.url.scheme() == "https" && next.scheme() == "http" {
                    return Err(HttpClientError::RedirectDowngrade);
                }
                if normalized_authority(&req.url) != normalized_authority(&next) {
                    return Err(HttpClientError::RedirectNotSameHost);
                }

                let mut next_headers = HeaderMap::new();
                if let Some(ua) = req.headers.get(USER_AGENT) {
                    next_headers.insert(USER_AGENT, ua.clone());
                }
                if let Some(accept) = req.headers.get(ACCEPT) {
                    next_headers.insert(ACCEPT, accept.clone());
                }
                req = OutboundRequest {
                    method: req.method,
                    url: next,
                    headers: next_headers,
                    body: None,
                    signed: false,
                };
                hops += 1;
                continue;
            }

            return Ok(resp);
        }
    }

    async fn dispatch(&self, req: &OutboundRequest) -> Result<OutboundResponse, HttpClientError> {
        let mut builder = self.inner.request(req.method.clone(), req.url.clone());
        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value.clone());
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await.map_err(|e| HttpClientError::NetworkError(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();

        let limit = self.config.max_response_bytes + 1;
        let bytes = resp.bytes().await.map_err(|e| HttpClientError::NetworkError(e.to_string()))?;
        if bytes.len() as u64 > limit {
            return Err(HttpClientError::ResponseTooLarge);
        }
        if bytes.len() as u64 > self.config.max_response_bytes {
            return Err(HttpClientError::ResponseTooLarge);
        }
        Ok(OutboundResponse { status, headers, body: bytes.to_vec() })
    }
}

pub fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_is_blocked() {
        assert!(is_blocked_ip("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rfc1918_is_blocked() {
        assert!(is_blocked_ip("10.0.0.5".parse().unwrap()));
        assert!(is_blocked_ip("192.168.1.1".parse().unwrap()));
        assert!(is_blocked_ip("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn link_local_is_blocked() {
        assert!(is_blocked_ip("169.254.0.1".parse().unwrap()));
        assert!(is_blocked_ip("fe80::1".parse().unwrap()));
    }

    #[test]
    fn unspecified_and_multicast_are_blocked() {
        assert!(is_blocked_ip("0.0.0.0".parse().unwrap()));
        assert!(is_blocked_ip("::".parse().unwrap()));
        assert!(is_blocked_ip("224.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("ff02::1".parse().unwrap()));
    }

    #[test]
    fn unique_local_v6_is_blocked() {
        assert!(is_blocked_ip("fd00::1".parse().unwrap()));
    }

    #[test]
    fn public_address_is_not_blocked() {
        assert!(!is_blocked_ip("93.184.216.34".parse().unwrap()));
    }

    #[tokio::test]
    async fn ssrf_off_allows_everything() {
        assert!(check_host_safe("127.0.0.1", 80, SsrfMode::Off).await.is_ok());
    }

    #[tokio::test]
    async fn ssrf_strict_blocks_literal_loopback() {
        let err = check_host_safe("127.0.0.1", 80, SsrfMode::Strict).await.unwrap_err();
        assert!(matches!(err, HttpClientError::SsrfBlocked(_)));
    }

    #[tokio::test]
    async fn ssrf_strict_blocks_localhost_name() {
        let err = check_host_safe("localhost", 80, SsrfMode::Strict).await.unwrap_err();
        assert!(matches!(err, HttpClientError::SsrfBlocked(_)));
    }

    #[tokio::test]
    async fn unresolvable_hostname_fails_closed() {
        let err = check_host_safe("this-host-does-not-exist.invalid", 80, SsrfMode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpClientError::HostUnresolvable(_)));
    }

    #[test]
    fn normalized_authority_strips_default_ports() {
        let a = Url::parse("https://example.com:443/x").unwrap();
        let b = Url::parse("https://example.com/x").unwrap();
        assert_eq!(normalized_authority(&a), normalized_authority(&b));
    }

    #[test]
    fn normalized_authority_keeps_nondefault_ports() {
        let a = Url::parse("https://example.com:8443/x").unwrap();
        assert_eq!(normalized_authority(&a), Some("example.com:8443".to_string()));
    }
}
