//! Destination checks applied before any connection is attempted.

use crate::fetch::FetchError;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;
use url::Url;

/// Outbound policy for pointer and JWKS fetches.
///
/// The default is restrictive: HTTPS only, public addresses only. The
/// insecure escape hatch exists for local development against stub origins
/// and must never be enabled in production deployments.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    /// If set, only these hosts may be contacted (case-insensitive).
    pub allowed_hosts: Option<HashSet<String>>,
    /// Allow plain HTTP and private/loopback destinations.
    pub allow_insecure_transport: bool,
}

impl FetchPolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    /// Local-development policy: plain HTTP and private addresses allowed.
    #[must_use]
    pub fn insecure() -> Self {
        Self {
            allowed_hosts: None,
            allow_insecure_transport: true,
        }
    }
}

/// Validate scheme, host allowlist, and every resolved address; return the
/// addresses to pin the connection to.
pub(crate) async fn checked_addrs(
    policy: &FetchPolicy,
    url: &Url,
) -> Result<Vec<SocketAddr>, FetchError> {
    if url.scheme() != "https" && !(policy.allow_insecure_transport && url.scheme() == "http") {
        return Err(FetchError::NotHttps);
    }

    let Some(host) = url.host_str() else {
        return Err(FetchError::Failed("missing URL host".into()));
    };

    if let Some(allowed) = &policy.allowed_hosts
        && !allowed.contains(&host.to_ascii_lowercase())
    {
        return Err(FetchError::Failed(format!("host '{host}' not in allowlist")));
    }

    let port = url
        .port_or_known_default()
        .unwrap_or(if url.scheme() == "http" { 80 } else { 443 });

    // IP literal: no resolution step.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if !policy.allow_insecure_transport {
            deny_ip(ip)?;
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| FetchError::DnsFailure(format!("lookup '{host}': {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(FetchError::DnsFailure(format!(
            "no addresses for host '{host}'"
        )));
    }

    if !policy.allow_insecure_transport {
        for addr in &addrs {
            deny_ip(addr.ip())?;
        }
    }

    Ok(addrs)
}

fn deny_ip(ip: IpAddr) -> Result<(), FetchError> {
    match ip {
        IpAddr::V4(v4) => deny_ipv4(ip, v4),
        IpAddr::V6(v6) => deny_ipv6(ip, v6),
    }
}

fn deny_ipv4(ip: IpAddr, v4: Ipv4Addr) -> Result<(), FetchError> {
    if v4.is_loopback() {
        return Err(FetchError::Loopback(ip));
    }
    // Link-local includes cloud metadata endpoints (169.254.169.254).
    if v4.is_link_local() {
        return Err(FetchError::LinkLocal(ip));
    }
    if v4.is_private() || v4.is_unspecified() || v4.is_broadcast() || v4.is_multicast() {
        return Err(FetchError::PrivateIp(ip));
    }
    let oct = v4.octets();
    // Carrier-grade NAT (100.64.0.0/10) and reserved (240.0.0.0/4).
    if (oct[0] == 100 && (64..=127).contains(&oct[1])) || oct[0] >= 240 {
        return Err(FetchError::PrivateIp(ip));
    }
    Ok(())
}

fn deny_ipv6(ip: IpAddr, v6: Ipv6Addr) -> Result<(), FetchError> {
    if v6.is_loopback() {
        return Err(FetchError::Loopback(ip));
    }
    if v6.is_unicast_link_local() {
        return Err(FetchError::LinkLocal(ip));
    }
    if v6.is_unspecified() || v6.is_multicast() || v6.is_unique_local() {
        return Err(FetchError::PrivateIp(ip));
    }
    // v4-mapped addresses smuggle v4 targets through v6 records.
    if let Some(v4) = v6.to_ipv4_mapped() {
        return deny_ipv4(ip, v4);
    }
    Ok(())
}
