//! Client-side rendezvous session state.

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use traverser_proto::{PeerDescriptor, all_addresses};

/// Where the server is reached and how peers are applied.
///
/// The server starts out at its public address. Once it has acknowledged a
/// registration, control traffic moves into the tunnel and targets the
/// server's tunnel address on the same port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousSession {
    initial_server: SocketAddr,
    current_server: SocketAddr,
    consumer: bool,
    consumer_rules_installed: bool,
}

impl RendezvousSession {
    /// New session reaching the server at `server`, in provider mode.
    #[must_use]
    pub fn new(server: SocketAddr) -> Self {
        Self {
            initial_server: server,
            current_server: server,
            consumer: false,
            consumer_rules_installed: false,
        }
    }

    /// Public server address given at start
    #[must_use]
    pub fn initial_server(&self) -> SocketAddr {
        self.initial_server
    }

    /// Address control messages are currently sent to
    #[must_use]
    pub fn current_server(&self) -> SocketAddr {
        self.current_server
    }

    /// Server tunnel address, if control traffic has moved into the tunnel
    #[must_use]
    pub fn server_tunnel_ip(&self) -> Option<IpAddr> {
        (self.current_server != self.initial_server).then_some(self.current_server.ip())
    }

    /// Send control traffic to `tunnel_ip` from now on, keeping the port.
    pub fn rebind(&mut self, tunnel_ip: IpAddr) {
        self.current_server = SocketAddr::new(tunnel_ip, self.current_server.port());
    }

    /// Go back to the server's public address.
    pub fn reset(&mut self) {
        self.current_server = self.initial_server;
    }

    /// Whether peers route all traffic (consumer) or only their own range
    #[must_use]
    pub fn is_consumer(&self) -> bool {
        self.consumer
    }

    /// Switch between consumer and provider mode.
    pub fn set_consumer(&mut self, consumer: bool) {
        self.consumer = consumer;
    }

    /// Whether consumer routing rules have been installed
    #[must_use]
    pub fn consumer_rules_installed(&self) -> bool {
        self.consumer_rules_installed
    }

    /// Record whether consumer routing rules are installed.
    pub fn set_consumer_rules_installed(&mut self, installed: bool) {
        self.consumer_rules_installed = installed;
    }

    /// Range to configure for `descriptor` under the current mode.
    #[must_use]
    pub fn effective_range(&self, descriptor: &PeerDescriptor) -> IpNet {
        if self.consumer {
            all_addresses()
        } else {
            descriptor.allowed_range()
        }
    }
}
