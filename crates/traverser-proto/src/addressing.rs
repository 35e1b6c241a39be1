//! Tunnel address helpers.

use crate::error::ProtoError;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr};

/// Lowest host id accepted by [`host_address`]
pub const MIN_HOST_ID: u32 = 1;

/// Highest host id accepted by [`host_address`]
pub const MAX_HOST_ID: u32 = 254;

/// Parse a bare IP address token.
///
/// # Errors
///
/// Returns `ProtoError::InvalidAddress` if `text` is not an IPv4 or IPv6 address.
pub fn parse_address(text: &str) -> Result<IpAddr, ProtoError> {
    text.trim()
        .parse()
        .map_err(|_| ProtoError::InvalidAddress(text.to_string()))
}

/// Host route covering exactly `addr` (`/32` or `/128`).
#[must_use]
pub fn host_route(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// The "all addresses" range used for full-tunnel peers.
#[must_use]
pub fn all_addresses() -> IpNet {
    // Ipv4Net's default is 0.0.0.0/0
    IpNet::V4(Ipv4Net::default())
}

/// Interface address for host `host_id` inside `network`.
///
/// The result keeps the network's prefix length, so `host_address(10.1.0.0/24, 5)`
/// is `10.1.0.5/24`.
///
/// # Errors
///
/// Returns `ProtoError::InvalidHostId` if the id is outside
/// `MIN_HOST_ID..=MAX_HOST_ID` or does not name a usable host of the network.
pub fn host_address(network: Ipv4Net, host_id: u32) -> Result<Ipv4Net, ProtoError> {
    let invalid = || ProtoError::InvalidHostId {
        host_id,
        network: network.to_string(),
    };

    if !(MIN_HOST_ID..=MAX_HOST_ID).contains(&host_id) {
        return Err(invalid());
    }

    let base = u32::from(network.network());
    let addr = base.checked_add(host_id).map(Ipv4Addr::from).ok_or_else(invalid)?;

    if addr >= network.broadcast() {
        return Err(invalid());
    }

    Ipv4Net::new(addr, network.prefix_len()).map_err(|_| invalid())
}
