//! Tunnel manager trait.
//!
//! Both rendezvous roles configure their local tunnel exclusively through
//! [`TunnelManager`]. Implementations serialize their own mutating calls, but
//! callers that pair a mutation with a reply still hold their own lock around
//! the pair.

use crate::error::TunnelResult;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use traverser_proto::{PeerDescriptor, PublicKey};

/// Control over one local tunnel interface
#[async_trait]
pub trait TunnelManager: Send + Sync {
    /// Create the interface with a fresh key pair, listening on `listen_port`.
    ///
    /// # Errors
    /// `TunnelError::DeviceExists` if the interface is already present.
    async fn initialize(&self, listen_port: u16) -> TunnelResult<()>;

    /// The interface's public key.
    ///
    /// # Errors
    /// `TunnelError::NotInitialized` before [`initialize`](Self::initialize).
    async fn public_key(&self) -> TunnelResult<PublicKey>;

    /// The interface's tunnel address.
    ///
    /// # Errors
    /// `TunnelError::NoAddress` if no address has been assigned.
    async fn interface_address(&self) -> TunnelResult<IpAddr>;

    /// Replace the interface's address with `address`.
    async fn set_interface_address(&self, address: IpNet) -> TunnelResult<()>;

    /// Add `public_key` as a peer, replacing any existing entry for that key.
    ///
    /// Every peer gets the configured persistent keepalive. Without an
    /// `endpoint` the peer is reachable only after it initiates a handshake.
    /// With `replace_all` every other peer is removed.
    async fn add_peer(
        &self,
        public_key: &PublicKey,
        allowed_range: IpNet,
        endpoint: Option<SocketAddr>,
        replace_all: bool,
    ) -> TunnelResult<()>;

    /// Descriptor of a configured peer.
    ///
    /// # Errors
    /// `TunnelError::PeerNotFound` unless the peer exists and has a known
    /// endpoint and allowed range.
    async fn peer_descriptor(&self, public_key: &PublicKey) -> TunnelResult<PeerDescriptor>;

    /// Remove every peer that has `allowed_range` among its allowed ranges.
    ///
    /// # Returns
    /// Number of peers removed
    async fn remove_peer_by_allowed_range(&self, allowed_range: IpNet) -> TunnelResult<usize>;

    /// Route all host traffic and DNS through the tunnel.
    async fn create_consumer_rules(&self) -> TunnelResult<()>;

    /// Undo [`create_consumer_rules`](Self::create_consumer_rules).
    async fn remove_consumer_rules(&self) -> TunnelResult<()>;

    /// Delete the interface, if [`initialize`](Self::initialize) created it.
    async fn cleanup(&self) -> TunnelResult<()>;
}
