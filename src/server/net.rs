//! LAN address discovery for playlist URLs.
//!
//! Cast receivers fetch segments over the LAN, so advertised playlist URLs
//! must carry a reachable non-loopback IPv4 address, preferring the common
//! home range 192.168.0.0/16.

use std::net::Ipv4Addr;

/// First non-internal IPv4 address, 192.168.0.0/16 preferred.
pub fn lan_ip() -> Option<String> {
    let candidates = interface_ips();
    pick_lan_ip(&candidates).map(|ip| ip.to_string())
}

/// Preference order over a candidate list; split out for testing.
pub(crate) fn pick_lan_ip(candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    let usable: Vec<Ipv4Addr> = candidates
        .iter()
        .copied()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local())
        .collect();
    usable
        .iter()
        .copied()
        .find(|ip| ip.octets()[0] == 192 && ip.octets()[1] == 168)
        .or_else(|| usable.first().copied())
}

#[cfg(unix)]
fn interface_ips() -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    if let Ok(addrs) = nix::ifaddrs::getifaddrs() {
        for addr in addrs {
            if let Some(sockaddr) = addr.address {
                if let Some(v4) = sockaddr.as_sockaddr_in() {
                    ips.push(v4.ip());
                }
            }
        }
    }
    if ips.is_empty() {
        ips.extend(probe_via_udp());
    }
    ips
}

#[cfg(not(unix))]
fn interface_ips() -> Vec<Ipv4Addr> {
    probe_via_udp().into_iter().collect()
}

/// Fallback: a connected UDP socket reveals the outbound interface address
/// without sending a packet.
fn probe_via_udp() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.168.255.255:9").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}
