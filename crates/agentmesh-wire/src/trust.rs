//! Trust predicate for peers announced by the overlay.
//!
//! A peer is admitted only if the IP in its endpoint URL is loopback, in a
//! non-public range, or inside a subnet from [`TrustConfig::allow`].

use agentmesh_types::TrustConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Whether a peer at `ip` may join this transport's view of the federation.
pub fn is_trusted_ip(ip: IpAddr, trust: &TrustConfig) -> bool {
    ip.is_loopback() || is_private_ip(&ip) || trust.allow_listed(ip)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback() || is_private_v4(&v4),
            None => is_private_v6(v6),
        },
    }
}

/// IANA special-purpose IPv4 blocks that are not globally reachable.
/// Shared address space (100.64.0.0/10) is treated as public.
fn is_private_v4(v4: &Ipv4Addr) -> bool {
    matches!(
        v4.octets(),
        [0, ..]
            | [10, ..]
            | [169, 254, ..]
            | [172, 16..=31, ..]
            | [192, 0, 0, 0..=7]
            | [192, 0, 0, 170..=171]
            | [192, 0, 2, _]
            | [192, 168, ..]
            | [198, 18..=19, ..]
            | [198, 51, 100, _]
            | [203, 0, 113, _]
            | [240..=255, ..]
    )
}

/// Unique-local and link-local IPv6 only. Documentation and other
/// special-purpose IPv6 blocks need an explicit allow-list entry.
fn is_private_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Extract the IP from an overlay endpoint URL of the form `tcp://<ip>:<port>`.
///
/// IPv6 hosts must be bracketed (`tcp://[fd00::1]:5670`). Anything else,
/// including host names, yields `None`.
pub fn endpoint_ip(url: &str) -> Option<IpAddr> {
    let rest = url.strip_prefix("tcp://")?;
    rest.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_loopback_and_private_trusted() {
        let trust = TrustConfig::default();
        assert!(is_trusted_ip(ip("127.0.0.1"), &trust));
        assert!(is_trusted_ip(ip("::1"), &trust));
        assert!(is_trusted_ip(ip("10.0.0.1"), &trust));
        assert!(is_trusted_ip(ip("172.16.0.1"), &trust));
        assert!(is_trusted_ip(ip("172.31.255.255"), &trust));
        assert!(is_trusted_ip(ip("192.168.1.1"), &trust));
        assert!(is_trusted_ip(ip("169.254.169.254"), &trust));
        assert!(is_trusted_ip(ip("fd00::1"), &trust));
        assert!(is_trusted_ip(ip("::ffff:192.168.0.9"), &trust));
    }

    #[test]
    fn test_reserved_v4_blocks_trusted() {
        let trust = TrustConfig::default();
        for addr in [
            "0.0.0.0",
            "0.1.2.3",
            "192.0.0.5",
            "192.0.2.44",
            "198.18.0.1",
            "198.19.255.255",
            "198.51.100.7",
            "203.0.113.9",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            assert!(is_trusted_ip(ip(addr), &trust), "{addr} should be trusted");
        }
        for addr in ["100.64.0.1", "198.20.0.1", "192.0.3.1", "239.255.255.255"] {
            assert!(!is_trusted_ip(ip(addr), &trust), "{addr} should not be trusted");
        }
    }

    #[test]
    fn test_public_rejected_unless_allow_listed() {
        let mut trust = TrustConfig::default();
        assert!(!is_trusted_ip(ip("8.8.8.8"), &trust));
        assert!(!is_trusted_ip(ip("172.32.0.1"), &trust));
        assert!(!is_trusted_ip(ip("192.150.186.135"), &trust));
        assert!(!is_trusted_ip(ip("2001:db8::1"), &trust));

        trust.allow.push("192.150.186.0/24".parse().unwrap());
        assert!(is_trusted_ip(ip("192.150.186.135"), &trust));
        assert!(!is_trusted_ip(ip("192.150.187.135"), &trust));
    }

    #[test]
    fn test_endpoint_ip_parsing() {
        assert_eq!(endpoint_ip("tcp://192.168.0.4:49152"), Some(ip("192.168.0.4")));
        assert_eq!(endpoint_ip("tcp://[fd00::1]:5670"), Some(ip("fd00::1")));
        assert_eq!(endpoint_ip("tcp://192.168.0.4"), None);
        assert_eq!(endpoint_ip("udp://192.168.0.4:1"), None);
        assert_eq!(endpoint_ip("tcp://example.com:80"), None);
        assert_eq!(endpoint_ip("garbage"), None);
    }
}
