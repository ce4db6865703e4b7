//! Trusted-proxy-aware client IP resolution (spec.md §6's "Trusted proxies"
//! paragraph): a request is only allowed to claim an identity via
//! `X-Forwarded-For`/`X-Real-IP` when its direct TCP peer matches the configured
//! allowlist of CIDR/IP strings. Every other path must use the direct peer.

use axum::http::HeaderMap;
use std::net::IpAddr;

fn ip_in_list(ip: &IpAddr, trusted: &[String]) -> bool {
    trusted.iter().any(|entry| match entry.split_once('/') {
        Some((base, bits)) => cidr_contains(base, bits, ip),
        None => entry.parse::<IpAddr>().map(|t| &t == ip).unwrap_or(false),
    })
}

fn cidr_contains(base: &str, bits: &str, ip: &IpAddr) -> bool {
    let (Ok(base), Ok(bits)) = (base.parse::<IpAddr>(), bits.parse::<u32>()) else { return false };
    match (base, ip) {
        (IpAddr::V4(b), IpAddr::V4(i)) => {
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits.min(32)) };
            (u32::from(b) & mask) == (u32::from(*i) & mask)
        }
        (IpAddr::V6(b), IpAddr::V6(i)) => {
            let mask = if bits == 0 { 0u128 } else { u128::MAX << (128 - bits.min(128)) };
            (u128::from(b) & mask) == (u128::from(*i) & mask)
        }
        _ => false,
    }
}

/// Resolves the client IP for rate limiting and logging. `direct_peer` is the
/// actual TCP peer address (`None` in contexts, like unit tests, where no real
/// connection exists — forwarded headers are then never trusted).
pub fn client_ip(trusted_proxies: &[String], headers: &HeaderMap, direct_peer: Option<IpAddr>) -> String {
    let Some(peer) = direct_peer else {
        return "unknown".to_string();
    };
    if !ip_in_list(&peer, trusted_proxies) {
        return peer.to_string();
    }
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.trim().is_empty() {
            return xri.trim().to_string();
        }
    }
    peer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_xff(ip: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", ip.parse().unwrap());
        h
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_headers() {
        let peer: IpAddr = "198.51.100.7".parse().unwrap();
        let resolved = client_ip(&[], &headers_with_xff("203.0.113.9"), Some(peer));
        assert_eq!(resolved, "198.51.100.7");
    }

    #[test]
    fn trusted_peer_honors_forwarded_for_first_hop() {
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let trusted = vec!["10.0.0.0/8".to_string()];
        let resolved = client_ip(&trusted, &headers_with_xff("203.0.113.9, 10.0.0.5"), Some(peer));
        assert_eq!(resolved, "203.0.113.9");
    }

    #[test]
    fn cidr_boundary_is_respected() {
        let trusted = vec!["192.168.1.0/24".to_string()];
        let inside: IpAddr = "192.168.1.200".parse().unwrap();
        let outside: IpAddr = "192.168.2.1".parse().unwrap();
        assert!(ip_in_list(&inside, &trusted));
        assert!(!ip_in_list(&outside, &trusted));
    }

    #[test]
    fn exact_ip_entry_matches_only_itself() {
        let trusted = vec!["127.0.0.1".to_string()];
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(ip_in_list(&a, &trusted));
        assert!(!ip_in_list(&b, &trusted));
    }

    #[test]
    fn no_direct_peer_is_unknown() {
        assert_eq!(client_ip(&[], &HeaderMap::new(), None), "unknown");
    }
}
