//! Choosing the LAN address to advertise.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Interface name prefixes of virtual adapters that never carry LAN traffic.
pub const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "vmnet", "vbox", "utun", "tun", "tap", "virbr", "zt", "lo",
];

/// A candidate address and the interface it belongs to, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub interface: Option<String>,
    pub ip: IpAddr,
}

impl Candidate {
    pub fn new(interface: Option<&str>, ip: IpAddr) -> Self {
        Self {
            interface: interface.map(str::to_string),
            ip,
        }
    }
}

pub fn is_virtual_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Preference rank of a private range; lower is better. `None` for
/// addresses that must never be advertised.
fn rank(ip: Ipv4Addr) -> Option<u8> {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast() {
        return None;
    }
    let [a, b, ..] = ip.octets();
    Some(match (a, b) {
        (192, 168) => 0,
        (10, _) => 1,
        (172, 16..=31) => 2,
        _ => 3,
    })
}

/// Pick the best address: 192.168/16, then 10/8, then 172.16/12, then
/// anything else routable. Loopback, link-local, IPv6 and virtual adapters
/// are skipped.
pub fn select(candidates: &[Candidate]) -> Option<Ipv4Addr> {
    candidates
        .iter()
        .filter(|c| !c.interface.as_deref().is_some_and(is_virtual_interface))
        .filter_map(|c| match c.ip {
            IpAddr::V4(ip) => rank(ip).map(|r| (r, ip)),
            IpAddr::V6(_) => None,
        })
        .min_by_key(|(r, _)| *r)
        .map(|(_, ip)| ip)
}

/// Source address the OS would use to reach `target`. No packet is sent.
fn route_source(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Addresses this host would use for LAN traffic.
pub fn local_candidates() -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = ["192.168.0.1:9", "10.0.0.1:9", "172.16.0.1:9", "8.8.8.8:9"]
        .iter()
        .filter_map(|target| route_source(target))
        .map(|ip| Candidate::new(None, ip))
        .collect();
    candidates.dedup();
    candidates
}

/// The address to advertise: `configured` when given, otherwise the best
/// local candidate.
pub fn advertise_address(configured: Option<&str>) -> Option<String> {
    if let Some(addr) = configured.filter(|a| !a.is_empty()) {
        return Some(addr.to_string());
    }
    select(&local_candidates()).map(|ip| ip.to_string())
}
