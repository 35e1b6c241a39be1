//! Recording tunnel manager.
//!
//! Keeps peers in memory and logs every mutating call, so role handlers can be
//! checked against exactly what they asked the tunnel to do.

use crate::error::{TunnelError, TunnelResult};
use crate::manager::TunnelManager;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use traverser_proto::{PeerDescriptor, PublicKey};

const INTERFACE_NAME: &str = "mem0";

/// A mutating call made on a [`MemoryTunnel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCall {
    /// `initialize(listen_port)`
    Initialize {
        /// Requested listen port
        listen_port: u16,
    },
    /// `set_interface_address(address)`
    SetInterfaceAddress(IpNet),
    /// `add_peer(..)`
    AddPeer {
        /// Peer key
        public_key: PublicKey,
        /// Allowed range
        allowed_range: IpNet,
        /// Endpoint, if given
        endpoint: Option<SocketAddr>,
        /// Whether all other peers were dropped
        replace_all: bool,
    },
    /// `remove_peer_by_allowed_range(range)`
    RemovePeerByAllowedRange(IpNet),
    /// `create_consumer_rules()`
    CreateConsumerRules,
    /// `remove_consumer_rules()`
    RemoveConsumerRules,
    /// `cleanup()`
    Cleanup,
}

/// A peer held by a [`MemoryTunnel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPeer {
    /// Peer key
    pub public_key: PublicKey,
    /// Allowed range
    pub allowed_range: IpNet,
    /// Current endpoint
    pub endpoint: Option<SocketAddr>,
}

#[derive(Debug)]
struct State {
    public_key: PublicKey,
    listen_port: Option<u16>,
    address: Option<IpNet>,
    peers: Vec<MemoryPeer>,
    consumer_rules: bool,
    calls: Vec<TunnelCall>,
    failure: Option<String>,
}

/// In-memory [`TunnelManager`].
///
/// Behaves like a kernel device that has already seen every peer's handshake
/// once [`set_endpoint`](Self::set_endpoint) is called for it: re-adding a
/// peer without an endpoint keeps the one last observed.
#[derive(Debug)]
pub struct MemoryTunnel {
    state: Mutex<State>,
}

impl MemoryTunnel {
    /// Create a tunnel whose interface key is `public_key`.
    ///
    /// The tunnel starts uninitialized, without an address or peers.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            state: Mutex::new(State {
                public_key,
                listen_port: None,
                address: None,
                peers: Vec::new(),
                consumer_rules: false,
                calls: Vec::new(),
                failure: None,
            }),
        }
    }

    /// Same tunnel with `address` already assigned.
    #[must_use]
    pub fn with_address(self, address: IpNet) -> Self {
        self.state().address = Some(address);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next mutating call fail without side effects.
    pub fn fail_next(&self, reason: &str) {
        self.state().failure = Some(reason.to_string());
    }

    /// Record `endpoint` as observed for `public_key`, as a handshake would.
    ///
    /// Returns `false` if no such peer is configured.
    pub fn set_endpoint(&self, public_key: &PublicKey, endpoint: SocketAddr) -> bool {
        let mut state = self.state();
        match state.peers.iter_mut().find(|p| p.public_key == *public_key) {
            Some(peer) => {
                peer.endpoint = Some(endpoint);
                true
            }
            None => false,
        }
    }

    /// Successful mutating calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<TunnelCall> {
        self.state().calls.clone()
    }

    /// Configured peers in insertion order.
    #[must_use]
    pub fn peers(&self) -> Vec<MemoryPeer> {
        self.state().peers.clone()
    }

    /// Configured peer with `public_key`.
    #[must_use]
    pub fn peer(&self, public_key: &PublicKey) -> Option<MemoryPeer> {
        self.state()
            .peers
            .iter()
            .find(|p| p.public_key == *public_key)
            .cloned()
    }

    /// Assigned interface address
    #[must_use]
    pub fn address(&self) -> Option<IpNet> {
        self.state().address
    }

    /// Whether consumer rules are currently installed
    #[must_use]
    pub fn consumer_rules_installed(&self) -> bool {
        self.state().consumer_rules
    }

    /// Listen port, once initialized
    #[must_use]
    pub fn listen_port(&self) -> Option<u16> {
        self.state().listen_port
    }

    /// Run `apply` unless a failure is pending, recording `call` on success.
    fn mutate<T>(
        &self,
        call: TunnelCall,
        apply: impl FnOnce(&mut State) -> TunnelResult<T>,
    ) -> TunnelResult<T> {
        let mut state = self.state();
        if let Some(stderr) = state.failure.take() {
            return Err(TunnelError::Command {
                program: INTERFACE_NAME.to_string(),
                status: "injected failure".to_string(),
                stderr,
            });
        }

        let result = apply(&mut *state)?;
        state.calls.push(call);
        Ok(result)
    }
}

#[async_trait]
impl TunnelManager for MemoryTunnel {
    async fn initialize(&self, listen_port: u16) -> TunnelResult<()> {
        self.mutate(TunnelCall::Initialize { listen_port }, |state| {
            if state.listen_port.is_some() {
                return Err(TunnelError::DeviceExists(INTERFACE_NAME.to_string()));
            }
            state.listen_port = Some(listen_port);
            Ok(())
        })
    }

    async fn public_key(&self) -> TunnelResult<PublicKey> {
        Ok(self.state().public_key)
    }

    async fn interface_address(&self) -> TunnelResult<IpAddr> {
        self.state()
            .address
            .map(|net| net.addr())
            .ok_or_else(|| TunnelError::NoAddress(INTERFACE_NAME.to_string()))
    }

    async fn set_interface_address(&self, address: IpNet) -> TunnelResult<()> {
        self.mutate(TunnelCall::SetInterfaceAddress(address), |state| {
            state.address = Some(address);
            Ok(())
        })
    }

    async fn add_peer(
        &self,
        public_key: &PublicKey,
        allowed_range: IpNet,
        endpoint: Option<SocketAddr>,
        replace_all: bool,
    ) -> TunnelResult<()> {
        let call = TunnelCall::AddPeer {
            public_key: *public_key,
            allowed_range,
            endpoint,
            replace_all,
        };

        self.mutate(call, |state| {
            if replace_all {
                state.peers.retain(|p| p.public_key == *public_key);
            }

            match state.peers.iter_mut().find(|p| p.public_key == *public_key) {
                Some(peer) => {
                    peer.allowed_range = allowed_range;
                    if endpoint.is_some() {
                        peer.endpoint = endpoint;
                    }
                }
                None => state.peers.push(MemoryPeer {
                    public_key: *public_key,
                    allowed_range,
                    endpoint,
                }),
            }
            Ok(())
        })
    }

    async fn peer_descriptor(&self, public_key: &PublicKey) -> TunnelResult<PeerDescriptor> {
        self.state()
            .peers
            .iter()
            .filter(|p| p.public_key == *public_key)
            .find_map(|p| {
                p.endpoint
                    .map(|ep| PeerDescriptor::new(p.public_key, p.allowed_range, Some(ep)))
            })
            .ok_or(TunnelError::PeerNotFound(*public_key))
    }

    async fn remove_peer_by_allowed_range(&self, allowed_range: IpNet) -> TunnelResult<usize> {
        self.mutate(TunnelCall::RemovePeerByAllowedRange(allowed_range), |state| {
            let before = state.peers.len();
            state.peers.retain(|p| p.allowed_range != allowed_range);
            Ok(before - state.peers.len())
        })
    }

    async fn create_consumer_rules(&self) -> TunnelResult<()> {
        self.mutate(TunnelCall::CreateConsumerRules, |state| {
            state.consumer_rules = true;
            Ok(())
        })
    }

    async fn remove_consumer_rules(&self) -> TunnelResult<()> {
        self.mutate(TunnelCall::RemoveConsumerRules, |state| {
            state.consumer_rules = false;
            Ok(())
        })
    }

    async fn cleanup(&self) -> TunnelResult<()> {
        self.mutate(TunnelCall::Cleanup, |state| {
            state.listen_port = None;
            state.peers.clear();
            state.address = None;
            Ok(())
        })
    }
}
