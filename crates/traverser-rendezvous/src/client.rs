//! Rendezvous client.
//!
//! Two inputs drive the client: operator commands, one at a time, and server
//! replies, which arrive on the serve loop in any order and possibly
//! concurrently with a command. Both paths take the same session lock for the
//! whole of their tunnel calls and sends.
//!
//! # Registration Flow
//!
//! ```text
//! operator: add 5
//!   → set tunnel address 10.1.0.5/24
//!   → send "add <own key> 10.1.0.5" to the server's public address
//! server:   add <server key> 10.1.0.1
//!   → add server peer 10.1.0.1/32, endpoint <server public ip>:<server wireguard port>
//!   → control traffic now goes to 10.1.0.1:<server control port>
//! ```

pub mod command;
pub mod session;

pub use command::{Command, HELP, Mode};
pub use session::RendezvousSession;

use crate::error::{RendezvousError, Result};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use traverser_proto::{
    Message, PeerDescriptor, ProtoError, PublicKey, host_address, host_route, parse_address,
};
use traverser_transport::{DatagramHandler, Transport};
use traverser_tunnel::TunnelManager;

/// Client settings fixed at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server's public control address
    pub server: SocketAddr,
    /// Port the server's tunnel listens on
    pub server_wireguard_port: u16,
    /// Network host ids are mapped into
    pub tunnel_network: Ipv4Net,
}

/// Rendezvous client role
pub struct RendezvousClient {
    tunnel: Arc<dyn TunnelManager>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    session: Mutex<RendezvousSession>,
    finished: watch::Sender<bool>,
}

impl RendezvousClient {
    /// Create a client talking to `config.server` over `transport`.
    #[must_use]
    pub fn new(
        tunnel: Arc<dyn TunnelManager>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            tunnel,
            transport,
            session: Mutex::new(RendezvousSession::new(config.server)),
            config,
            finished,
        }
    }

    /// Bring up the tunnel on `wireguard_port`.
    ///
    /// # Errors
    ///
    /// Returns the tunnel error if the device cannot be created.
    pub async fn setup(&self, wireguard_port: u16) -> Result<()> {
        let _session = self.session.lock().await;
        self.tunnel.initialize(wireguard_port).await?;
        tracing::info!(
            "Rendezvous client ready, public key {}",
            self.tunnel.public_key().await?
        );
        Ok(())
    }

    /// Snapshot of the session state.
    pub async fn session(&self) -> RendezvousSession {
        self.session.lock().await.clone()
    }

    /// Whether `exit` has been executed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until `exit` has been executed.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Execute one operator command.
    ///
    /// # Errors
    ///
    /// Returns why the command had no effect. `exit` finishes the client even
    /// if notifying the server failed.
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Add(host_id) => self.register(host_id).await,
            Command::Connect(public_key) => self.connect(&public_key).await,
            Command::SetMode(mode) => {
                self.set_mode(mode).await;
                Ok(())
            }
            Command::Remove => self.remove().await,
            Command::Exit => self.exit().await,
            Command::Help | Command::Empty | Command::Invalid(_) => Ok(()),
        }
    }

    async fn register(&self, host_id: u32) -> Result<()> {
        let address = host_address(self.config.tunnel_network, host_id)?;

        let session = self.session.lock().await;
        let public_key = self.tunnel.public_key().await?;
        self.tunnel
            .set_interface_address(IpNet::V4(address))
            .await?;
        let assigned = self.tunnel.interface_address().await?;

        self.send(&Message::add(&public_key, assigned), session.current_server())
            .await?;
        tracing::info!(
            "Registering as {} with server {}",
            assigned,
            session.current_server()
        );
        Ok(())
    }

    async fn connect(&self, public_key: &PublicKey) -> Result<()> {
        let session = self.session.lock().await;
        self.send(&Message::get(public_key), session.current_server())
            .await?;
        tracing::info!("Requested peer {}", public_key);
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) {
        let mut session = self.session.lock().await;
        session.set_consumer(mode == Mode::Consumer);
        tracing::info!("{:?} mode set", mode);
    }

    async fn remove(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        let notified = self.send(&Message::Remove, session.current_server()).await;
        if let Err(e) = &notified {
            tracing::warn!("Could not notify server of removal: {}", e);
        }

        let mut removed: Result<()> = Ok(());
        if let Some(server_ip) = session.server_tunnel_ip() {
            if let Err(e) = self
                .tunnel
                .remove_peer_by_allowed_range(host_route(server_ip))
                .await
            {
                tracing::warn!("Could not remove server peer {}: {}", server_ip, e);
                removed = Err(e.into());
            }
        }
        session.reset();

        tracing::info!(
            "Removed server connection, using {} again",
            session.current_server()
        );
        notified.and(removed)
    }

    async fn exit(&self) -> Result<()> {
        let session = self.session.lock().await;
        let notified = self.send(&Message::Exit, session.current_server()).await;
        self.finished.send_replace(true);
        notified
    }

    /// Handle one decoded message from `from`.
    ///
    /// # Errors
    ///
    /// Returns why the message was dropped. Nothing has been configured in
    /// that case.
    pub async fn handle(&self, message: Message, from: SocketAddr) -> Result<()> {
        match message {
            Message::Add {
                public_key,
                address,
            } => self.handle_add_reply(&public_key, &address).await,
            Message::Peer { descriptor } => self.handle_peer_reply(&descriptor).await,
            Message::Get { .. } | Message::Remove | Message::Exit => {
                tracing::debug!("Ignoring {} from {}", message.verb(), from);
                Ok(())
            }
            Message::Unknown { verb, .. } => {
                tracing::trace!("Ignoring unknown verb {:?} from {}", verb, from);
                Ok(())
            }
        }
    }

    async fn handle_add_reply(&self, public_key: &str, address: &str) -> Result<()> {
        let public_key: PublicKey = public_key.parse()?;
        let tunnel_ip = parse_address(address)?;

        let mut session = self.session.lock().await;
        // The NAT already maps the public address from the registration we sent.
        let endpoint = SocketAddr::new(
            session.initial_server().ip(),
            self.config.server_wireguard_port,
        );
        self.tunnel
            .add_peer(&public_key, host_route(tunnel_ip), Some(endpoint), false)
            .await?;
        session.rebind(tunnel_ip);

        tracing::info!(
            "Server connection added, control traffic now goes to {}",
            session.current_server()
        );
        Ok(())
    }

    async fn handle_peer_reply(&self, json: &str) -> Result<()> {
        let descriptor = PeerDescriptor::from_json(json)?;
        let public_key = *descriptor.public_key();
        let endpoint = descriptor
            .endpoint()
            .ok_or(RendezvousError::MissingEndpoint(public_key))?;

        let mut session = self.session.lock().await;
        let range = session.effective_range(&descriptor);
        self.tunnel
            .add_peer(&public_key, range, Some(endpoint), false)
            .await?;

        if session.is_consumer() && !session.consumer_rules_installed() {
            self.tunnel.create_consumer_rules().await?;
            session.set_consumer_rules_installed(true);
        }

        tracing::info!(
            "Added peer {}, allowed {}, endpoint {}",
            public_key,
            range,
            endpoint
        );
        Ok(())
    }

    /// Read commands from `input` until `exit` or end of input.
    ///
    /// Help text and complaints about invalid input are written to `output`.
    /// Failed commands are logged and reading continues.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading `input` or writing `output` fails.
    pub async fn run_commands<R, W>(&self, input: R, mut output: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            let command = Command::parse(&line);
            match command {
                Command::Empty => continue,
                Command::Help => output.write_all(HELP.as_bytes()).await?,
                Command::Invalid(reason) => {
                    output
                        .write_all(format!("{reason}\n{HELP}").as_bytes())
                        .await?;
                }
                command => {
                    let exiting = command == Command::Exit;
                    match self.execute(command).await {
                        Ok(()) => {}
                        Err(RendezvousError::Parse(e @ ProtoError::InvalidHostId { .. })) => {
                            output.write_all(format!("{e}\n{HELP}").as_bytes()).await?;
                        }
                        Err(e) => tracing::warn!("Command failed: {} ({:?})", e, e.kind()),
                    }
                    if exiting {
                        output.flush().await?;
                        return Ok(());
                    }
                }
            }
            output.flush().await?;
        }

        tracing::debug!("Command input closed");
        Ok(())
    }

    /// Undo consumer routing if it was installed.
    ///
    /// # Errors
    ///
    /// Returns the tunnel error if the rules could not be removed.
    pub async fn shutdown(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.consumer_rules_installed() {
            self.tunnel.remove_consumer_rules().await?;
            session.set_consumer_rules_installed(false);
        }
        Ok(())
    }

    async fn send(&self, message: &Message, to: SocketAddr) -> Result<()> {
        self.transport.send_to(&message.to_bytes(), to).await?;
        tracing::debug!("Sent {} to {}", message.verb(), to);
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for RendezvousClient {
    async fn handle_datagram(&self, payload: String, from: SocketAddr) {
        let message = Message::parse(&payload);
        let verb = message.verb().to_string();

        if let Err(e) = self.handle(message, from).await {
            tracing::warn!("Dropped {} from {}: {} ({:?})", verb, from, e, e.kind());
        }
    }
}
