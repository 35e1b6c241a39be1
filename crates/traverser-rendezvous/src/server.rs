//! Rendezvous server.
//!
//! The server keeps no peer directory of its own. Registrations go straight
//! into the local tunnel, and lookups read back what the tunnel has observed,
//! including the endpoint a peer's handshake arrived from.
//!
//! # Message Flow
//!
//! ```text
//! add <key> <addr>  → add_peer(key, addr/32, no endpoint) → reply add <own key> <own addr>
//! get <key>         → peer_descriptor(key)                → reply peer <json>
//! remove | exit     → logged
//! anything else     → ignored
//! ```

use crate::error::{RendezvousError, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use traverser_proto::{Message, PublicKey, host_route, parse_address};
use traverser_transport::{DatagramHandler, Transport};
use traverser_tunnel::{TunnelError, TunnelManager};

/// Rendezvous server role
pub struct RendezvousServer {
    tunnel: Arc<dyn TunnelManager>,
    transport: Arc<dyn Transport>,
    /// Held across every tunnel mutation and its reply, and around every send.
    lock: Mutex<()>,
}

impl RendezvousServer {
    /// Create a server answering on `transport` and registering peers in `tunnel`.
    #[must_use]
    pub fn new(tunnel: Arc<dyn TunnelManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            tunnel,
            transport,
            lock: Mutex::new(()),
        }
    }

    /// Bring up the tunnel on `wireguard_port` and give it `address`.
    ///
    /// # Errors
    ///
    /// Returns the tunnel error if the device cannot be created or addressed.
    pub async fn setup(&self, wireguard_port: u16, address: IpNet) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.tunnel.initialize(wireguard_port).await?;
        self.tunnel.set_interface_address(address).await?;

        tracing::info!(
            "Rendezvous server ready: tunnel address {}, public key {}",
            address,
            self.tunnel.public_key().await?
        );
        Ok(())
    }

    /// Handle one decoded message from `from`.
    ///
    /// # Errors
    ///
    /// Returns why the message was dropped. No reply has been sent in that case.
    pub async fn handle(&self, message: Message, from: SocketAddr) -> Result<()> {
        match message {
            Message::Add {
                public_key,
                address,
            } => self.handle_add(&public_key, &address, from).await,
            Message::Get { public_key } => self.handle_get(&public_key, from).await,
            Message::Remove | Message::Exit => {
                tracing::debug!("Received {} from {}", message.verb(), from);
                Ok(())
            }
            Message::Peer { .. } => {
                tracing::debug!("Ignoring peer message from {}", from);
                Ok(())
            }
            Message::Unknown { verb, .. } => {
                tracing::trace!("Ignoring unknown verb {:?} from {}", verb, from);
                Ok(())
            }
        }
    }

    async fn handle_add(&self, public_key: &str, address: &str, from: SocketAddr) -> Result<()> {
        let public_key: PublicKey = public_key.parse()?;
        let address = parse_address(address)?;

        let _guard = self.lock.lock().await;
        self.tunnel
            .add_peer(&public_key, host_route(address), None, false)
            .await?;

        let own_key = self.tunnel.public_key().await?;
        let own_address = self.tunnel.interface_address().await?;
        self.send(&Message::add(&own_key, own_address), from).await?;

        tracing::info!(
            "Registered peer {} with tunnel address {} from {}",
            public_key,
            address,
            from
        );
        Ok(())
    }

    async fn handle_get(&self, public_key: &str, from: SocketAddr) -> Result<()> {
        let public_key: PublicKey = public_key.parse()?;

        // Lookups only read tunnel state and run outside the lock.
        let descriptor = match self.tunnel.peer_descriptor(&public_key).await {
            Ok(descriptor) => descriptor,
            Err(TunnelError::PeerNotFound(key)) => return Err(RendezvousError::Lookup(key)),
            Err(e) => return Err(e.into()),
        };
        let reply = Message::peer(&descriptor)?;

        let _guard = self.lock.lock().await;
        self.send(&reply, from).await?;

        tracing::info!("Sent descriptor of {} to {}", public_key, from);
        Ok(())
    }

    async fn send(&self, message: &Message, to: SocketAddr) -> Result<()> {
        self.transport.send_to(&message.to_bytes(), to).await?;
        tracing::debug!("Sent {} to {}", message.verb(), to);
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for RendezvousServer {
    async fn handle_datagram(&self, payload: String, from: SocketAddr) {
        let message = Message::parse(&payload);
        let verb = message.verb().to_string();

        if let Err(e) = self.handle(message, from).await {
            tracing::warn!("Dropped {} from {}: {} ({:?})", verb, from, e, e.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use traverser_proto::PeerDescriptor;
    use traverser_transport::MemoryTransport;
    use traverser_tunnel::{MemoryTunnel, TunnelCall};

    const SERVER_KEY: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";
    const PEER_A: &str = "uDXRpjBVjdMKyXm1Tv1ECDfszZ2T3ZuvKT5Vp0LwTTE=";
    const PEER_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

    struct Fixture {
        server: Arc<RendezvousServer>,
        tunnel: Arc<MemoryTunnel>,
        transport: Arc<MemoryTransport>,
    }

    fn fixture() -> Fixture {
        let tunnel = Arc::new(
            MemoryTunnel::new(SERVER_KEY.parse().unwrap())
                .with_address("10.1.0.1/24".parse().unwrap()),
        );
        let transport = Arc::new(MemoryTransport::new("0.0.0.0:2000".parse().unwrap()));
        let server = Arc::new(RendezvousServer::new(tunnel.clone(), transport.clone()));
        Fixture {
            server,
            tunnel,
            transport,
        }
    }

    fn client_addr() -> SocketAddr {
        "198.51.100.20:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_registers_and_replies() {
        let f = fixture();

        f.server
            .handle_datagram(format!("add {PEER_A} 203.0.113.5"), client_addr())
            .await;

        assert_eq!(
            f.tunnel.calls(),
            vec![TunnelCall::AddPeer {
                public_key: PEER_A.parse().unwrap(),
                allowed_range: "203.0.113.5/32".parse().unwrap(),
                endpoint: None,
                replace_all: false,
            }]
        );

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text(), format!("add {SERVER_KEY} 10.1.0.1"));
        assert_eq!(sent[0].to, client_addr());
    }

    #[tokio::test]
    async fn test_add_with_invalid_key() {
        let f = fixture();

        let err = f
            .server
            .handle(Message::parse("add not-a-key 10.1.0.5"), client_addr())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(f.tunnel.calls().is_empty());
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_add_with_invalid_address() {
        let f = fixture();

        let err = f
            .server
            .handle(Message::parse(&format!("add {PEER_A} 10.1.0")), client_addr())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_add_facade_failure_sends_nothing() {
        let f = fixture();
        f.tunnel.fail_next("RTNETLINK answers: Operation not permitted");

        let err = f
            .server
            .handle(
                Message::parse(&format!("add {PEER_A} 10.1.0.5")),
                client_addr(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Facade);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_add_without_own_address() {
        let tunnel = Arc::new(MemoryTunnel::new(SERVER_KEY.parse().unwrap()));
        let transport = Arc::new(MemoryTransport::new("0.0.0.0:2000".parse().unwrap()));
        let server = RendezvousServer::new(tunnel, transport.clone());

        let err = server
            .handle(
                Message::parse(&format!("add {PEER_A} 10.1.0.5")),
                client_addr(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RendezvousError::Tunnel(TunnelError::NoAddress(_))
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_key() {
        let f = fixture();

        let err = f
            .server
            .handle(Message::parse(&format!("get {PEER_B}")), client_addr())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Lookup);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_get_registered_without_handshake() {
        let f = fixture();
        f.server
            .handle_datagram(format!("add {PEER_A} 10.1.0.5"), client_addr())
            .await;
        f.transport.clear_sent();

        f.server
            .handle_datagram(format!("get {PEER_A}"), client_addr())
            .await;
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_get_replies_with_descriptor() {
        let f = fixture();
        let a: PublicKey = PEER_A.parse().unwrap();
        let observed: SocketAddr = "203.0.113.5:41234".parse().unwrap();

        f.server
            .handle_datagram(format!("add {PEER_A} 10.1.0.5"), observed)
            .await;
        f.tunnel.set_endpoint(&a, observed);
        f.transport.clear_sent();

        let requester: SocketAddr = "192.0.2.44:2000".parse().unwrap();
        f.server
            .handle_datagram(format!("get {PEER_A}"), requester)
            .await;

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, requester);

        let Message::Peer { descriptor } = Message::from_bytes(&sent[0].payload) else {
            panic!("expected peer reply, got {}", sent[0].text());
        };
        assert_eq!(
            PeerDescriptor::from_json(&descriptor).unwrap(),
            PeerDescriptor::new(a, "10.1.0.5/32".parse().unwrap(), Some(observed))
        );
    }

    #[tokio::test]
    async fn test_hints_and_unknown_verbs_are_ignored() {
        let f = fixture();

        for payload in ["remove", "exit", "hello world", "", "add onlyone", "peer {}"] {
            f.server
                .handle(Message::parse(payload), client_addr())
                .await
                .unwrap();
        }

        assert!(f.tunnel.calls().is_empty());
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let f = fixture();
        f.transport.set_failing_sends(true);

        let err = f
            .server
            .handle(
                Message::parse(&format!("add {PEER_A} 10.1.0.5")),
                client_addr(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_setup() {
        let tunnel = Arc::new(MemoryTunnel::new(SERVER_KEY.parse().unwrap()));
        let transport = Arc::new(MemoryTransport::new("0.0.0.0:2000".parse().unwrap()));
        let server = RendezvousServer::new(tunnel.clone(), transport);

        server
            .setup(2001, "10.1.0.1/24".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(
            tunnel.calls(),
            vec![
                TunnelCall::Initialize { listen_port: 2001 },
                TunnelCall::SetInterfaceAddress("10.1.0.1/24".parse().unwrap()),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let f = fixture();
        let keys = [PEER_A, PEER_B];

        let tasks: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let server = f.server.clone();
                let payload = format!("add {key} 10.1.0.{}", i + 5);
                tokio::spawn(async move { server.handle_datagram(payload, client_addr()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(f.tunnel.peers().len(), 2);
        assert_eq!(f.transport.sent().len(), 2);
    }
}
