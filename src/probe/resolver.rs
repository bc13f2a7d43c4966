//! Local and remote endpoint resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use super::ProbeError;

/// Determine the local endpoint to bind.
///
/// An explicit, non-empty `ip:port` wins. Otherwise the first non-loopback
/// IPv4 interface address is used with port 0.
pub fn resolve_local_endpoint(explicit: Option<&str>) -> Result<SocketAddr, ProbeError> {
    match explicit.map(str::trim) {
        Some(addr) if !addr.is_empty() => addr
            .parse::<SocketAddr>()
            .map_err(|e| ProbeError::Config(format!("invalid source address {:?}: {}", addr, e))),
        _ => {
            let addrs = interface_addrs()
                .map_err(|e| ProbeError::Lookup(format!("failed to list interfaces: {}", e)))?;
            select_source_addr(addrs)
        }
    }
}

/// Resolve the destination `host:port` once at startup.
///
/// Only addresses in the same family as `local` are usable from the bound
/// socket; a hostname resolving to several addresses takes the first match.
pub async fn resolve_remote_endpoint(
    address: &str,
    local: SocketAddr,
) -> Result<SocketAddr, ProbeError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProbeError::Config("destination address is required".to_string()));
    }

    // Try direct parse first
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return select_remote_addr(address, [addr], local);
    }

    let addrs = tokio::net::lookup_host(address)
        .await
        .map_err(|e| ProbeError::Config(format!("invalid destination {:?}: {}", address, e)))?;
    select_remote_addr(address, addrs, local)
}

/// Pick the first destination address whose family matches `local`.
pub fn select_remote_addr<I>(
    address: &str,
    addrs: I,
    local: SocketAddr,
) -> Result<SocketAddr, ProbeError>
where
    I: IntoIterator<Item = SocketAddr>,
{
    addrs
        .into_iter()
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            let family = if local.is_ipv4() { "IPv4" } else { "IPv6" };
            ProbeError::Config(format!(
                "no {} address for destination {} to match source {}",
                family, address, local
            ))
        })
}

/// Pick the first IPv4 address that is not loopback.
pub fn select_source_addr<I>(addrs: I) -> Result<SocketAddr, ProbeError>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs
        .into_iter()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .map(|ip| SocketAddr::new(ip, 0))
        .ok_or_else(|| {
            ProbeError::Lookup("could not find source IP address from interfaces".to_string())
        })
}

/// Addresses of all local interfaces, in the order the kernel reports them.
fn interface_addrs() -> io::Result<Vec<IpAddr>> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    // SAFETY: getifaddrs writes a list head into ifap on success.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addrs = Vec::new();
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: cur is a live node of the list returned by getifaddrs.
        let entry = unsafe { &*cur };
        if let Some(ip) = unsafe { sockaddr_ip(entry.ifa_addr) } {
            addrs.push(ip);
        }
        cur = entry.ifa_next;
    }

    // SAFETY: ifap came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(ifap) };
    Ok(addrs)
}

/// # Safety
/// `sa` must be null or point to a valid sockaddr sized for its family.
unsafe fn sockaddr_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as i32 {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_source() {
        let addr = resolve_local_endpoint(Some("10.1.2.3:5353")).unwrap();
        assert_eq!(addr, "10.1.2.3:5353".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_explicit_source_invalid() {
        for bad in ["10.1.2.3", "not-an-ip:53", "10.1.2.3:99999"] {
            let err = resolve_local_endpoint(Some(bad)).unwrap_err();
            assert!(matches!(err, ProbeError::Config(_)), "{}", bad);
        }
    }

    #[test]
    fn test_loopback_only_fails() {
        let addrs = vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        let err = select_source_addr(addrs).unwrap_err();
        assert!(matches!(err, ProbeError::Lookup(_)));
    }

    #[test]
    fn test_first_non_loopback_ipv4_wins() {
        let addrs = vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "fe80::1".parse::<IpAddr>().unwrap(),
            "192.168.1.20".parse::<IpAddr>().unwrap(),
            "10.0.0.5".parse::<IpAddr>().unwrap(),
        ];
        let addr = select_source_addr(addrs).unwrap();
        assert_eq!(addr, "192.168.1.20:0".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_interface_scan() {
        assert!(interface_addrs().is_ok());
    }

    #[test]
    fn test_auto_detected_source() {
        for explicit in [None, Some(""), Some("   ")] {
            match resolve_local_endpoint(explicit) {
                Ok(addr) => {
                    assert!(addr.is_ipv4());
                    assert!(!addr.ip().is_loopback());
                    assert_eq!(addr.port(), 0);
                }
                Err(err) => assert!(matches!(err, ProbeError::Lookup(_)), "{:?}", err),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_endpoint() {
        let local = "10.0.0.9:0".parse::<SocketAddr>().unwrap();
        let addr = resolve_remote_endpoint("10.0.0.1:53", local).await.unwrap();
        assert_eq!(addr, "10.0.0.1:53".parse::<SocketAddr>().unwrap());

        let err = resolve_remote_endpoint("", local).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));

        let err = resolve_remote_endpoint("10.0.0.1", local).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[tokio::test]
    async fn test_remote_family_mismatch_is_fatal() {
        let local = "10.0.0.9:0".parse::<SocketAddr>().unwrap();
        let err = resolve_remote_endpoint("[fd00::10]:53", local)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[test]
    fn test_remote_prefers_source_family() {
        let addrs: Vec<SocketAddr> = ["[::1]:53", "[fd00::10]:53", "127.0.0.1:53", "10.96.0.10:53"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();

        let v4 = select_remote_addr("dual.example:53", addrs.clone(), "10.0.0.9:0".parse().unwrap())
            .unwrap();
        assert_eq!(v4, "127.0.0.1:53".parse::<SocketAddr>().unwrap());

        let v6 = select_remote_addr("dual.example:53", addrs, "[fd00::9]:0".parse().unwrap())
            .unwrap();
        assert_eq!(v6, "[::1]:53".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_remote_without_matching_family() {
        let addrs = vec!["[::1]:53".parse::<SocketAddr>().unwrap()];
        let err = select_remote_addr("v6only.example:53", addrs, "10.0.0.9:0".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
