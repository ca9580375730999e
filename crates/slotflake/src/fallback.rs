//! Best-effort instance value derived from the local network address.
//!
//! Used only when neither a static pair nor a lease manager is configured.
//! Two hosts whose IPv4 addresses agree in the low bits collide, so this
//! carries no uniqueness guarantee across a fleet.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

/// Documentation range (RFC 5737); connecting a UDP socket sends nothing and
/// only asks the OS which local address would route there.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// Picks the first non-loopback, non-unspecified IPv4 address.
pub fn first_non_loopback(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
        _ => None,
    })
}

/// Discovers this host's IPv4 address.
///
/// Candidates are the addresses the local hostname resolves to, followed by
/// the source address the OS would use for an outbound route.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let resolved = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(|name| (name.as_str(), 0).to_socket_addrs().ok())
        .into_iter()
        .flatten()
        .map(|addr| addr.ip());

    first_non_loopback(resolved).or_else(|| {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect(PROBE_ADDR).ok()?;
        first_non_loopback([socket.local_addr().ok()?.ip()])
    })
}

/// Reduces an address to its low `bits` bits, treating the octets as a
/// big-endian 32-bit integer.
pub fn instance_from_ipv4(addr: Ipv4Addr, bits: u8) -> u64 {
    let value = u64::from(u32::from(addr));
    if bits >= 32 {
        value
    } else {
        value % (1u64 << bits)
    }
}

/// The fallback instance value for an instance field of `bits` bits.
/// Hosts without a usable IPv4 address get `0`.
pub fn network_instance(bits: u8) -> u64 {
    let addr = local_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    let instance = instance_from_ipv4(addr, bits);
    tracing::debug!(%addr, instance, "derived fallback instance from network address");
    instance
}
