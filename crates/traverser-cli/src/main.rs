//! Traverser CLI
//!
//! WireGuard NAT traversal through a UDP rendezvous server

mod config;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;
use traverser_rendezvous::{RendezvousClient, RendezvousServer};
use traverser_transport::{Transport, TransportResult, UdpTransport, serve};
use traverser_tunnel::{TunnelManager, WgCommandTunnel};

use config::Config;

/// Traverser - connect WireGuard peers behind NAT through a rendezvous server
#[derive(Parser)]
#[command(name = "traverser")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to ~/.config/traverser/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Server {
        #[command(flatten)]
        local: LocalArgs,

        /// Server tunnel address (CIDR)
        #[arg(long)]
        address: Option<String>,
    },

    /// Run an interactive rendezvous client
    Client {
        #[command(flatten)]
        local: LocalArgs,

        /// Public address of the rendezvous server
        #[arg(short, long)]
        server: Option<IpAddr>,

        /// Control port of the rendezvous server
        #[arg(long)]
        server_port: Option<u16>,

        /// WireGuard port of the rendezvous server
        #[arg(long)]
        server_wireguard_port: Option<u16>,

        /// Network host ids are mapped into (CIDR)
        #[arg(long)]
        network: Option<String>,
    },
}

/// Local socket and tunnel settings shared by both roles
#[derive(Args)]
struct LocalArgs {
    /// Local control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Local WireGuard listen port
    #[arg(short, long)]
    wireguard_port: Option<u16>,

    /// WireGuard interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// Run ip, wg and resolvconf through sudo
    #[arg(long)]
    sudo: bool,
}

impl LocalArgs {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.network.udp_port = port;
        }
        if let Some(port) = self.wireguard_port {
            config.tunnel.wireguard_port = port;
        }
        if let Some(interface) = self.interface {
            config.tunnel.interface_name = interface;
        }
        if self.sudo {
            config.tunnel.sudo = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    let verbose = cli.verbose;
    let role = apply_overrides(cli.command, &mut config);

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        match role {
            Role::Server => run_server(&config).await,
            Role::Client => run_client(&config).await,
        }
    });

    // A pending read of stdin cannot be cancelled.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

enum Role {
    Server,
    Client,
}

fn apply_overrides(command: Commands, config: &mut Config) -> Role {
    match command {
        Commands::Server { local, address } => {
            local.apply(config);
            if let Some(address) = address {
                config.tunnel.server_address = address;
            }
            Role::Server
        }
        Commands::Client {
            local,
            server,
            server_port,
            server_wireguard_port,
            network,
        } => {
            local.apply(config);
            if server.is_some() {
                config.rendezvous.server_ip = server;
            }
            if let Some(port) = server_port {
                config.rendezvous.server_udp_port = port;
            }
            if let Some(port) = server_wireguard_port {
                config.rendezvous.server_wireguard_port = port;
            }
            if let Some(network) = network {
                config.tunnel.network = network;
            }
            Role::Client
        }
    }
}

/// Run the rendezvous server until interrupted or the socket fails
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let address = config.parse_server_address()?;

    let transport = Arc::new(
        UdpTransport::bind(config.bind_addr())
            .await
            .context("Failed to bind control socket")?,
    );
    let tunnel = Arc::new(WgCommandTunnel::new(config.tunnel_config()));
    let server = Arc::new(RendezvousServer::new(tunnel.clone(), transport.clone()));

    if let Err(e) = server.setup(config.tunnel.wireguard_port, address).await {
        cleanup_tunnel(tunnel.as_ref()).await;
        return Err(e).context("Failed to set up tunnel device");
    }

    tracing::info!(
        "Rendezvous server listening on {} (tunnel {} on {}, WireGuard port {})",
        config.bind_addr(),
        tunnel.interface_name(),
        address,
        config.tunnel.wireguard_port
    );

    let mut serving = tokio::spawn(serve(transport.clone(), server, config.serve_config()));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            signal.map_err(anyhow::Error::from)
        }
        result = &mut serving => serve_outcome(result),
    };

    transport.close().await;
    tracing::info!("Control socket totals: {}", transport.stats());
    cleanup_tunnel(tunnel.as_ref()).await;
    outcome
}

/// Run an interactive client until `exit`, end of input, interrupt or socket failure
async fn run_client(config: &Config) -> anyhow::Result<()> {
    let client_config = config.client_config()?;

    let transport = Arc::new(
        UdpTransport::bind(config.bind_addr())
            .await
            .context("Failed to bind control socket")?,
    );
    let tunnel = Arc::new(WgCommandTunnel::new(config.tunnel_config()));
    let client = Arc::new(RendezvousClient::new(
        tunnel.clone(),
        transport.clone(),
        client_config.clone(),
    ));

    if let Err(e) = client.setup(config.tunnel.wireguard_port).await {
        cleanup_tunnel(tunnel.as_ref()).await;
        return Err(e).context("Failed to set up tunnel device");
    }

    tracing::info!(
        "Rendezvous client on {} using server {} (tunnel {}, WireGuard port {})",
        config.bind_addr(),
        client_config.server,
        tunnel.interface_name(),
        config.tunnel.wireguard_port
    );

    let mut serving = tokio::spawn(serve(
        transport.clone(),
        client.clone(),
        config.serve_config(),
    ));

    let reader = client.clone();
    let mut commands = tokio::spawn(async move {
        let input = BufReader::new(tokio::io::stdin());
        reader.run_commands(input, tokio::io::stdout()).await
    });

    print!("{}", traverser_rendezvous::HELP);

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            signal.map_err(anyhow::Error::from)
        }
        result = &mut serving => serve_outcome(result),
        () = client.wait_finished() => {
            tracing::info!("Exit requested, shutting down");
            Ok(())
        }
        result = &mut commands => match result {
            Ok(Ok(())) => {
                tracing::info!("Command input finished, shutting down");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::from(e).context("Failed to read commands")),
            Err(e) => Err(anyhow::Error::from(e).context("Command reader panicked")),
        },
    };

    commands.abort();
    transport.close().await;
    tracing::info!("Control socket totals: {}", transport.stats());
    if let Err(e) = client.shutdown().await {
        tracing::warn!("Failed to remove consumer routing rules: {}", e);
    }
    cleanup_tunnel(tunnel.as_ref()).await;
    outcome
}

fn serve_outcome(
    result: Result<TransportResult<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::from(e).context("Control socket failed")),
        Err(e) => Err(anyhow::Error::from(e).context("Serve loop panicked")),
    }
}

async fn cleanup_tunnel(tunnel: &dyn TunnelManager) {
    if let Err(e) = tunnel.cleanup().await {
        tracing::warn!("Failed to remove tunnel device: {}", e);
    }
}
