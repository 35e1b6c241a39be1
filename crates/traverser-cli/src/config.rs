//! Configuration system for the Traverser CLI.

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use traverser_proto::{
    DEFAULT_FIREWALL_MARK, DEFAULT_KEEPALIVE, DEFAULT_SERVER_TUNNEL_ADDRESS,
    DEFAULT_TUNNEL_NETWORK, DEFAULT_UDP_PORT, DEFAULT_WIREGUARD_PORT,
};
use traverser_rendezvous::ClientConfig;
use traverser_transport::ServeConfig;
use traverser_transport::serve::DEFAULT_MAX_IN_FLIGHT;
use traverser_tunnel::{DEFAULT_DNS_SERVER, DEFAULT_INTERFACE_NAME, TunnelConfig};

/// Traverser configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Rendezvous configuration
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local control port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// WireGuard interface name
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    /// WireGuard listen port
    #[serde(default = "default_wireguard_port")]
    pub wireguard_port: u16,
    /// Network host ids are mapped into (CIDR)
    #[serde(default = "default_network")]
    pub network: String,
    /// Server's own tunnel address (CIDR)
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Persistent keepalive in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Firewall mark and routing table for consumer mode
    #[serde(default = "default_firewall_mark")]
    pub firewall_mark: u32,
    /// DNS server used in consumer mode
    #[serde(default = "default_dns_server")]
    pub dns_server: IpAddr,
    /// Run `ip`, `wg` and `resolvconf` through sudo
    #[serde(default)]
    pub sudo: bool,
}

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Public address of the server (client only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<IpAddr>,
    /// Server control port
    #[serde(default = "default_udp_port")]
    pub server_udp_port: u16,
    /// Server WireGuard port
    #[serde(default = "default_wireguard_port")]
    pub server_wireguard_port: u16,
    /// Maximum datagram handlers running at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_wireguard_port() -> u16 {
    DEFAULT_WIREGUARD_PORT
}

fn default_interface_name() -> String {
    DEFAULT_INTERFACE_NAME.to_string()
}

fn default_network() -> String {
    DEFAULT_TUNNEL_NETWORK.to_string()
}

fn default_server_address() -> String {
    DEFAULT_SERVER_TUNNEL_ADDRESS.to_string()
}

fn default_keepalive_secs() -> u64 {
    DEFAULT_KEEPALIVE.as_secs()
}

fn default_firewall_mark() -> u32 {
    DEFAULT_FIREWALL_MARK
}

fn default_dns_server() -> IpAddr {
    DEFAULT_DNS_SERVER
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            wireguard_port: default_wireguard_port(),
            network: default_network(),
            server_address: default_server_address(),
            keepalive_secs: default_keepalive_secs(),
            firewall_mark: default_firewall_mark(),
            dns_server: default_dns_server(),
            sudo: false,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            server_ip: None,
            server_udp_port: default_udp_port(),
            server_wireguard_port: default_wireguard_port(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("traverser/config.toml")
    }

    /// Load `path`, or the default path if none is given.
    ///
    /// A missing file at the default path yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path cannot be read, or if any file
    /// found cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Local control socket address
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.network.udp_port)
    }

    /// Tunnel settings for the local WireGuard interface
    #[must_use]
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            interface_name: self.tunnel.interface_name.clone(),
            keepalive: Duration::from_secs(self.tunnel.keepalive_secs),
            firewall_mark: self.tunnel.firewall_mark,
            dns_server: self.tunnel.dns_server,
            sudo: self.tunnel.sudo,
        }
    }

    /// Serve loop settings
    #[must_use]
    pub fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            max_in_flight: self.rendezvous.max_in_flight,
            ..ServeConfig::default()
        }
    }

    /// Parse the tunnel network
    ///
    /// # Errors
    ///
    /// Returns an error if the network is not IPv4 CIDR.
    pub fn parse_network(&self) -> anyhow::Result<Ipv4Net> {
        self.tunnel
            .network
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid tunnel network {:?}: {}", self.tunnel.network, e))
    }

    /// Parse the server's own tunnel address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not IPv4 CIDR.
    pub fn parse_server_address(&self) -> anyhow::Result<IpNet> {
        let address: Ipv4Net = self.tunnel.server_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid server address {:?}: {}",
                self.tunnel.server_address,
                e
            )
        })?;
        Ok(IpNet::V4(address))
    }

    /// Client settings
    ///
    /// # Errors
    ///
    /// Returns an error if no server address is configured.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let Some(server_ip) = self.rendezvous.server_ip else {
            anyhow::bail!("No server address configured (use --server or [rendezvous] server_ip)");
        };

        Ok(ClientConfig {
            server: SocketAddr::new(server_ip, self.rendezvous.server_udp_port),
            server_wireguard_port: self.rendezvous.server_wireguard_port,
            tunnel_network: self.parse_network()?,
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        // Validate ports
        let ports = [
            ("udp_port", self.network.udp_port),
            ("wireguard_port", self.tunnel.wireguard_port),
            ("server_udp_port", self.rendezvous.server_udp_port),
            ("server_wireguard_port", self.rendezvous.server_wireguard_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                anyhow::bail!("{} must not be 0", name);
            }
        }

        if self.tunnel.interface_name.is_empty() {
            anyhow::bail!("Interface name must not be empty");
        }

        if self.tunnel.keepalive_secs == 0 {
            anyhow::bail!("Keepalive must be at least 1 second");
        }

        if self.rendezvous.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be at least 1");
        }

        // Validate tunnel network
        let network = self.parse_network()?;
        if !(8..=30).contains(&network.prefix_len()) {
            anyhow::bail!(
                "Tunnel network {} must have a prefix between /8 and /30",
                network
            );
        }

        let server_address = self.parse_server_address()?;
        if !IpNet::V4(network).contains(&server_address.addr()) {
            anyhow::bail!(
                "Server address {} is outside the tunnel network {}",
                server_address,
                network
            );
        }

        Ok(())
    }
}
