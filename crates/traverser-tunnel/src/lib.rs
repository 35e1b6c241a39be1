//! # Traverser Tunnel
//!
//! Local WireGuard interface control for the rendezvous roles.
//!
//! This crate provides:
//! - The [`TunnelManager`] trait both roles are written against
//! - [`WgCommandTunnel`], a kernel WireGuard implementation driven through
//!   the `ip`, `wg` and `resolvconf` tools
//! - [`MemoryTunnel`], a recording implementation for tests
//! - Key generation and a parser for `wg show <interface> dump`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod dump;
pub mod error;
pub mod keys;
pub mod manager;
pub mod memory;
pub mod wg;

pub use command::{CommandRunner, SystemRunner};
pub use error::{TunnelError, TunnelResult};
pub use keys::PrivateKey;
pub use manager::TunnelManager;
pub use memory::{MemoryPeer, MemoryTunnel, TunnelCall};
pub use wg::WgCommandTunnel;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Interface name used when none is configured
pub const DEFAULT_INTERFACE_NAME: &str = "wg0";

/// Resolver installed while routing all traffic through a peer
pub const DEFAULT_DNS_SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Tunnel interface configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Interface name
    pub interface_name: String,
    /// Persistent keepalive applied to every peer
    pub keepalive: Duration,
    /// Firewall mark, also used as the routing table number in consumer mode
    pub firewall_mark: u32,
    /// DNS server registered in consumer mode
    pub dns_server: IpAddr,
    /// Run tools through `sudo`
    pub sudo: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            keepalive: traverser_proto::DEFAULT_KEEPALIVE,
            firewall_mark: traverser_proto::DEFAULT_FIREWALL_MARK,
            dns_server: DEFAULT_DNS_SERVER,
            sudo: false,
        }
    }
}
