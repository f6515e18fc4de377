//! Server-side request forgery protection
//!
//! Every address a fetch might connect to is classified here. The guard is
//! consulted twice per fetch: once when the URL is accepted and again from
//! inside the HTTP client's resolver, immediately before each connection.
//! The second check is what defeats DNS rebinding, where a name resolves
//! publicly at validation time and privately at connect time.

use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name resolution seam, replaceable in tests
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Why an address is refused, or `None` if it is publicly routable
pub fn blocked_reason(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => blocked_v6(v6).or_else(|| embedded_v4(v6).and_then(blocked_v4)),
    }
}

/// IPv4 address carried inside an IPv6 one: mapped `::ffff:a.b.c.d`,
/// compatible `::a.b.c.d`, NAT64 `64:ff9b::/96` and 6to4 `2002::/16`
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let s = ip.segments();
    let tail = Ipv4Addr::new((s[6] >> 8) as u8, s[6] as u8, (s[7] >> 8) as u8, s[7] as u8);
    if let Some(v4) = ip.to_ipv4_mapped() {
        Some(v4)
    } else if s[..6].iter().all(|&seg| seg == 0) {
        Some(tail)
    } else if s[0] == 0x0064 && s[1] == 0xff9b && s[2..6].iter().all(|&seg| seg == 0) {
        Some(tail)
    } else if s[0] == 0x2002 {
        Some(Ipv4Addr::new(
            (s[1] >> 8) as u8,
            s[1] as u8,
            (s[2] >> 8) as u8,
            s[2] as u8,
        ))
    } else {
        None
    }
}

fn blocked_v4(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, ..] = ip.octets();
    if ip.is_unspecified() || a == 0 {
        Some("unspecified address")
    } else if ip.is_loopback() {
        Some("loopback address")
    } else if ip.is_private() {
        Some("private address")
    } else if ip.is_link_local() {
        Some("link-local address")
    } else if a == 100 && (64..128).contains(&b) {
        Some("carrier-grade NAT address")
    } else if ip.is_broadcast() || ip.is_multicast() || a >= 240 {
        Some("non-unicast address")
    } else if ip.is_documentation() || (a == 198 && (b == 18 || b == 19)) {
        Some("reserved address")
    } else {
        None
    }
}

fn blocked_v6(ip: Ipv6Addr) -> Option<&'static str> {
    let first = ip.segments()[0];
    if ip.is_unspecified() {
        Some("unspecified address")
    } else if ip.is_loopback() {
        Some("loopback address")
    } else if first & 0xfe00 == 0xfc00 {
        Some("unique local address")
    } else if first & 0xffc0 == 0xfe80 {
        Some("link-local address")
    } else if first & 0xffc0 == 0xfec0 {
        Some("site-local address")
    } else if ip.is_multicast() {
        Some("non-unicast address")
    } else if first == 0x2001 && ip.segments()[1] == 0x0db8 {
        Some("reserved address")
    } else {
        None
    }
}

/// Address policy for outbound fetches
pub struct SsrfGuard {
    enabled: bool,
    allowed_domains: Vec<String>,
    resolver: Arc<dyn HostResolver>,
}

impl SsrfGuard {
    pub fn new(enabled: bool, allowed_domains: Vec<String>, resolver: Arc<dyn HostResolver>) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            enabled,
            allowed_domains,
            resolver,
        }
    }

    /// True when the host equals or is a subdomain of an allow-listed domain
    pub fn is_allowed_domain(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    fn exempt(&self, host: &str) -> bool {
        !self.enabled || self.is_allowed_domain(host)
    }

    /// Check a host literal without resolving it
    ///
    /// IP literals are classified directly; names pass and are checked on
    /// resolution.
    pub fn check_literal(&self, host: &str) -> ForgeResult<()> {
        if self.exempt(host) {
            return Ok(());
        }
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if let Some(reason) = blocked_reason(ip) {
                warn!("Refusing fetch to {}: {}", host, reason);
                return Err(ForgeError::ssrf(host, reason));
            }
        }
        if bare.eq_ignore_ascii_case("localhost") || bare.to_ascii_lowercase().ends_with(".localhost") {
            return Err(ForgeError::ssrf(host, "loopback name"));
        }
        Ok(())
    }

    /// Resolve a host and refuse if any address is internal
    ///
    /// All addresses must pass: a single private record is enough for the
    /// connector to reach an internal service.
    pub async fn resolve_checked(&self, host: &str, port: u16) -> ForgeResult<Vec<SocketAddr>> {
        self.check_literal(host)?;
        let addrs = self
            .resolver
            .lookup(host, port)
            .await
            .map_err(|e| ForgeError::fetch(host, format!("DNS resolution failed: {}", e)))?;
        if addrs.is_empty() {
            return Err(ForgeError::fetch(host, "DNS returned no addresses"));
        }
        if !self.exempt(host) {
            for addr in &addrs {
                if let Some(reason) = blocked_reason(addr.ip()) {
                    warn!("Refusing fetch to {} ({}): {}", host, addr.ip(), reason);
                    return Err(ForgeError::ssrf(host, format!("resolves to {}", reason)));
                }
            }
        }
        debug!("Resolved {} to {} address(es)", host, addrs.len());
        Ok(addrs)
    }
}
