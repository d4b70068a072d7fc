//! SSRF screen for discovery sources.
//!
//! Discovery pollers call URLs an administrator typed into the settings UI.
//! Homelab services live on private networks, so RFC-1918 targets are allowed
//! (and logged); cloud metadata endpoints, loopback and link-local targets
//! are refused, including when hidden behind IPv4-mapped IPv6 literals or a
//! DNS name that resolves to them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::{Error, Result};

/// Hostnames of cloud instance-metadata services
const METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.azure.com",
    "100.100.100.200",
    "fd00:ec2::254",
];

/// How a resolved address is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrClass {
    /// Never contacted
    Blocked,
    /// Allowed, logged
    Private,
    /// Allowed
    Public,
}

fn classify(addr: IpAddr) -> AddrClass {
    match addr {
        IpAddr::V4(ipv4) => classify_ipv4(ipv4),
        IpAddr::V6(ipv6) => classify_ipv6(ipv6),
    }
}

fn classify_ipv4(addr: Ipv4Addr) -> AddrClass {
    if addr.is_loopback()          // 127.0.0.0/8
        || addr.is_link_local()    // 169.254.0.0/16
        || addr.is_unspecified()   // 0.0.0.0
        || addr.is_broadcast()
    {
        AddrClass::Blocked
    } else if addr.is_private() || is_shared_address(addr) {
        AddrClass::Private
    } else {
        AddrClass::Public
    }
}

/// Check 100.64.0.0/10 (Carrier-Grade NAT / shared address space).
fn is_shared_address(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0xC0) == 64
}

fn classify_ipv6(addr: Ipv6Addr) -> AddrClass {
    if addr.is_loopback() || addr.is_unspecified() {
        return AddrClass::Blocked;
    }

    // IPv4-mapped IPv6 (`::ffff:x.x.x.x`) is judged by the embedded address
    if let Some(ipv4) = extract_ipv4_mapped(&addr) {
        return classify_ipv4(ipv4);
    }

    let segments = addr.segments();

    // Link-local (fe80::/10)
    if segments[0] & 0xFFC0 == 0xFE80 {
        return AddrClass::Blocked;
    }

    // Unique Local Address (fc00::/7)
    if segments[0] & 0xFE00 == 0xFC00 {
        return AddrClass::Private;
    }

    AddrClass::Public
}

/// Extract IPv4 address from IPv4-mapped IPv6 (`::ffff:x.x.x.x`).
#[allow(clippy::cast_possible_truncation)] // Extracting u8 octets from u16 IPv6 segments is intentional
fn extract_ipv4_mapped(addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = addr.segments();
    if segments[..5].iter().all(|s| *s == 0) && segments[5] == 0xFFFF {
        Some(Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        ))
    } else {
        None
    }
}

fn is_metadata_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    METADATA_HOSTS.contains(&host.as_str()) || host.ends_with(".google.internal")
}

fn blocked(url: &str, reason: &str) -> Error {
    Error::Config(format!("SSRF blocked: {url}: {reason}"))
}

/// Screen a URL before any outbound request.
///
/// Rejects empty URLs, schemes other than http(s), cloud metadata hosts,
/// hosts that do not resolve, and hosts resolving to loopback or link-local
/// addresses. Private ranges are allowed.
///
/// # Errors
///
/// Returns `Error::Config` describing why the URL was refused.
pub async fn screen_url(url_str: &str) -> Result<url::Url> {
    let url_str = url_str.trim();
    if url_str.is_empty() {
        return Err(Error::Config("URL is empty".to_string()));
    }

    let parsed =
        url::Url::parse(url_str).map_err(|e| Error::Config(format!("Invalid URL {url_str}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(blocked(url_str, "only http and https are allowed"));
    }

    let Some(host) = parsed.host_str() else {
        return Err(blocked(url_str, "URL has no host"));
    };

    if is_metadata_host(host) {
        return Err(blocked(url_str, "cloud metadata endpoint"));
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let literal = host.trim_start_matches('[').trim_end_matches(']');

    let addrs: Vec<IpAddr> = if let Ok(addr) = literal.parse::<IpAddr>() {
        vec![addr]
    } else {
        tokio::net::lookup_host((literal, port))
            .await
            .map_err(|e| blocked(url_str, &format!("host does not resolve: {e}")))?
            .map(|sa| sa.ip())
            .collect()
    };

    if addrs.is_empty() {
        return Err(blocked(url_str, "host does not resolve"));
    }

    for addr in addrs {
        match classify(addr) {
            AddrClass::Blocked => {
                return Err(blocked(url_str, &format!("resolves to reserved address {addr}")));
            }
            AddrClass::Private => debug!(url = %url_str, %addr, "Outbound request to private address"),
            AddrClass::Public => {}
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_classes() {
        assert_eq!(classify_ipv4(Ipv4Addr::LOCALHOST), AddrClass::Blocked);
        assert_eq!(classify_ipv4(Ipv4Addr::new(169, 254, 1, 1)), AddrClass::Blocked);
        assert_eq!(classify_ipv4(Ipv4Addr::UNSPECIFIED), AddrClass::Blocked);
        assert_eq!(classify_ipv4(Ipv4Addr::new(192, 168, 1, 10)), AddrClass::Private);
        assert_eq!(classify_ipv4(Ipv4Addr::new(10, 0, 0, 1)), AddrClass::Private);
        assert_eq!(classify_ipv4(Ipv4Addr::new(100, 64, 0, 1)), AddrClass::Private);
        assert_eq!(classify_ipv4(Ipv4Addr::new(8, 8, 8, 8)), AddrClass::Public);
    }

    #[test]
    fn ipv6_classes() {
        assert_eq!(classify_ipv6(Ipv6Addr::LOCALHOST), AddrClass::Blocked);
        assert_eq!(classify_ipv6("fe80::1".parse().unwrap()), AddrClass::Blocked);
        assert_eq!(classify_ipv6("fd12::1".parse().unwrap()), AddrClass::Private);
        assert_eq!(
            classify_ipv6("2607:f8b0:4004:800::200e".parse().unwrap()),
            AddrClass::Public
        );
    }

    #[test]
    fn ipv4_mapped_loopback_is_blocked() {
        assert_eq!(classify_ipv6("::ffff:127.0.0.1".parse().unwrap()), AddrClass::Blocked);
        assert_eq!(classify_ipv6("::ffff:10.1.2.3".parse().unwrap()), AddrClass::Private);
    }

    #[test]
    fn metadata_hosts_match() {
        assert!(is_metadata_host("169.254.169.254"));
        assert!(is_metadata_host("METADATA.google.internal"));
        assert!(is_metadata_host("anything.google.internal"));
        assert!(is_metadata_host("[fd00:ec2::254]"));
        assert!(!is_metadata_host("grafana.lan"));
    }

    #[tokio::test]
    async fn rejects_empty_and_non_http() {
        assert!(screen_url("").await.is_err());
        assert!(screen_url("   ").await.is_err());
        assert!(screen_url("file:///etc/passwd").await.is_err());
        assert!(screen_url("ftp://10.0.0.1/").await.is_err());
        assert!(screen_url("not a url").await.is_err());
    }

    #[tokio::test]
    async fn rejects_metadata_and_reserved_literals() {
        assert!(screen_url("http://169.254.169.254/latest/meta-data").await.is_err());
        assert!(screen_url("http://metadata.google.internal/").await.is_err());
        assert!(screen_url("http://100.100.100.200/").await.is_err());
        assert!(screen_url("http://[fd00:ec2::254]/").await.is_err());
        assert!(screen_url("http://127.0.0.1:8080/api").await.is_err());
        assert!(screen_url("http://[::1]/").await.is_err());
        assert!(screen_url("http://[::ffff:127.0.0.1]/").await.is_err());
        assert!(screen_url("http://169.254.10.10/").await.is_err());
    }

    #[tokio::test]
    async fn allows_private_and_public_literals() {
        assert!(screen_url("http://192.168.1.20:8080/api").await.is_ok());
        assert!(screen_url("https://10.0.0.5").await.is_ok());
        assert!(screen_url("http://8.8.8.8/").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_localhost_by_name() {
        assert!(screen_url("http://localhost:8080/").await.is_err());
    }
}
