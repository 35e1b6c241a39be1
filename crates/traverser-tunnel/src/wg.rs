//! Kernel WireGuard tunnel driven through `ip` and `wg`.

use crate::TunnelConfig;
use crate::command::{CommandRunner, SystemRunner};
use crate::dump::{DeviceDump, parse_dump};
use crate::error::{TunnelError, TunnelResult};
use crate::keys::PrivateKey;
use crate::manager::TunnelManager;
use async_trait::async_trait;
use ipnet::IpNet;
use rand_core::OsRng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use traverser_proto::{PeerDescriptor, PublicKey};

/// Kernel WireGuard interface.
///
/// Mutating operations are serialized by an internal lock, since several of
/// them read the device state before changing it.
pub struct WgCommandTunnel {
    config: TunnelConfig,
    runner: Arc<dyn CommandRunner>,
    /// Set once the device has a key. Held for the duration of every mutation.
    public_key: Mutex<Option<PublicKey>>,
}

impl WgCommandTunnel {
    /// Create a manager for `config.interface_name`. Nothing is run until
    /// [`TunnelManager::initialize`].
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        let runner = Arc::new(SystemRunner::new(config.sudo));
        Self::with_runner(config, runner)
    }

    /// Create a manager that runs its tools through `runner`.
    #[must_use]
    pub fn with_runner(config: TunnelConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            public_key: Mutex::new(None),
        }
    }

    /// Interface name
    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.config.interface_name
    }

    async fn ip(&self, args: &[&str]) -> TunnelResult<String> {
        self.runner.run("ip", args, None).await
    }

    async fn wg(&self, args: &[&str]) -> TunnelResult<String> {
        self.runner.run("wg", args, None).await
    }

    async fn dump(&self) -> TunnelResult<DeviceDump> {
        let output = self.wg(&["show", self.interface_name(), "dump"]).await?;
        parse_dump(&output)
    }

    async fn remove_peer(&self, public_key: &PublicKey) -> TunnelResult<()> {
        let key = public_key.to_base64();
        self.wg(&["set", self.interface_name(), "peer", &key, "remove"])
            .await?;
        tracing::debug!("Removed peer {} from {}", key, self.interface_name());
        Ok(())
    }

    async fn configure_device(&self, private_key: &PrivateKey, listen_port: u16) -> TunnelResult<()> {
        let iface = self.interface_name();
        self.ip(&["link", "set", "dev", iface, "up"]).await?;

        let port = listen_port.to_string();
        let mut secret = private_key.to_base64();
        secret.push('\n');
        self.runner
            .run(
                "wg",
                &["set", iface, "listen-port", &port, "private-key", "/dev/stdin"],
                Some(secret.as_bytes()),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TunnelManager for WgCommandTunnel {
    async fn initialize(&self, listen_port: u16) -> TunnelResult<()> {
        let mut state = self.public_key.lock().await;
        let iface = self.interface_name();

        if self.ip(&["link", "show", "dev", iface]).await.is_ok() {
            return Err(TunnelError::DeviceExists(iface.to_string()));
        }
        self.ip(&["link", "add", "dev", iface, "type", "wireguard"])
            .await?;

        let private_key = PrivateKey::generate(&mut OsRng);
        if let Err(e) = self.configure_device(&private_key, listen_port).await {
            if let Err(cleanup) = self.ip(&["link", "del", "dev", iface]).await {
                tracing::warn!("Failed to remove half-configured {}: {}", iface, cleanup);
            }
            return Err(e);
        }

        let public_key = private_key.public_key();
        *state = Some(public_key);
        tracing::info!(
            "Tunnel interface {} up on port {} with public key {}",
            iface,
            listen_port,
            public_key
        );
        Ok(())
    }

    async fn public_key(&self) -> TunnelResult<PublicKey> {
        let public_key = *self.public_key.lock().await;
        public_key.ok_or(TunnelError::NotInitialized)
    }

    async fn interface_address(&self) -> TunnelResult<IpAddr> {
        let iface = self.interface_name();
        let output = self.ip(&["-o", "address", "show", "dev", iface]).await?;
        parse_interface_address(&output).ok_or_else(|| TunnelError::NoAddress(iface.to_string()))
    }

    async fn set_interface_address(&self, address: IpNet) -> TunnelResult<()> {
        let _guard = self.public_key.lock().await;
        let iface = self.interface_name();
        let address = address.to_string();

        self.ip(&["address", "flush", "dev", iface]).await?;
        self.ip(&["address", "replace", &address, "dev", iface])
            .await?;
        tracing::info!("Interface {} address set to {}", iface, address);
        Ok(())
    }

    async fn add_peer(
        &self,
        public_key: &PublicKey,
        allowed_range: IpNet,
        endpoint: Option<SocketAddr>,
        replace_all: bool,
    ) -> TunnelResult<()> {
        let state = self.public_key.lock().await;
        if state.is_none() {
            return Err(TunnelError::NotInitialized);
        }

        if replace_all {
            for peer in self.dump().await?.peers {
                if peer.public_key != *public_key {
                    self.remove_peer(&peer.public_key).await?;
                }
            }
        }

        let key = public_key.to_base64();
        let keepalive = self.config.keepalive.as_secs().to_string();
        let range = allowed_range.to_string();
        let endpoint = endpoint.map(|ep| ep.to_string());

        let mut args: Vec<&str> = vec![
            "set",
            self.interface_name(),
            "peer",
            &key,
            "persistent-keepalive",
            &keepalive,
            "allowed-ips",
            &range,
        ];
        if let Some(ep) = &endpoint {
            args.extend(["endpoint", ep.as_str()]);
        }
        self.wg(&args).await?;

        tracing::debug!(
            "Configured peer {} allowed {} endpoint {}",
            key,
            range,
            endpoint.as_deref().unwrap_or("(none)")
        );
        Ok(())
    }

    async fn peer_descriptor(&self, public_key: &PublicKey) -> TunnelResult<PeerDescriptor> {
        self.dump()
            .await?
            .peers
            .iter()
            .filter(|peer| peer.public_key == *public_key)
            .find_map(|peer| peer.descriptor())
            .ok_or(TunnelError::PeerNotFound(*public_key))
    }

    async fn remove_peer_by_allowed_range(&self, allowed_range: IpNet) -> TunnelResult<usize> {
        let _guard = self.public_key.lock().await;

        let mut removed = 0;
        for peer in self.dump().await?.peers {
            if peer.allows(&allowed_range) {
                self.remove_peer(&peer.public_key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn create_consumer_rules(&self) -> TunnelResult<()> {
        let _guard = self.public_key.lock().await;
        let iface = self.interface_name();
        let mark = self.config.firewall_mark.to_string();
        let resolv_iface = format!("tun.{iface}");
        let nameserver = format!("nameserver {}\n", self.config.dns_server);

        self.wg(&["set", iface, "fwmark", &mark]).await?;
        self.ip(&["route", "add", "default", "dev", iface, "table", &mark])
            .await?;
        self.runner
            .run(
                "resolvconf",
                &["-a", &resolv_iface, "-m", "0", "-x"],
                Some(nameserver.as_bytes()),
            )
            .await?;
        self.ip(&["rule", "add", "not", "fwmark", &mark, "table", &mark])
            .await?;

        tracing::info!("All traffic now routed through {}", iface);
        Ok(())
    }

    async fn remove_consumer_rules(&self) -> TunnelResult<()> {
        let _guard = self.public_key.lock().await;
        let iface = self.interface_name();
        let mark = self.config.firewall_mark.to_string();
        let resolv_iface = format!("tun.{iface}");

        // Each step is attempted even if an earlier one failed.
        let results = [
            self.ip(&["route", "del", "default", "dev", iface, "table", &mark])
                .await,
            self.runner
                .run("resolvconf", &["-d", &resolv_iface, "-f"], None)
                .await,
            self.ip(&["rule", "del", "not", "fwmark", &mark, "table", &mark])
                .await,
        ];

        let mut first_error = None;
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!("Removing consumer rule failed: {}", err);
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::info!("Consumer routing through {} removed", iface);
                Ok(())
            }
        }
    }

    async fn cleanup(&self) -> TunnelResult<()> {
        let mut state = self.public_key.lock().await;
        let iface = self.interface_name();

        // Only delete an interface this tunnel created.
        if state.is_none() {
            return Ok(());
        }
        self.ip(&["link", "del", "dev", iface]).await?;
        *state = None;
        tracing::info!("Tunnel interface {} removed", iface);
        Ok(())
    }
}

/// First address in `ip -o address show` output, preferring IPv4.
fn parse_interface_address(output: &str) -> Option<IpAddr> {
    let mut tokens = output.split_whitespace();
    let mut v6 = None;

    while let Some(token) = tokens.next() {
        let family_v4 = match token {
            "inet" => true,
            "inet6" => false,
            _ => continue,
        };
        let Some(addr) = tokens.next().and_then(|t| t.parse::<IpNet>().ok()) else {
            continue;
        };
        if family_v4 {
            return Some(addr.addr());
        }
        v6.get_or_insert(addr.addr());
    }

    v6
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    const PEER_A: &str = "uDXRpjBVjdMKyXm1Tv1ECDfszZ2T3ZuvKT5Vp0LwTTE=";
    const PEER_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";
    const SELF_PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const SELF_PUBLIC: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    /// Records command lines and answers from a table; unknown commands succeed
    /// with no output.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: StdMutex<Vec<String>>,
        stdin: StdMutex<Vec<String>>,
        responses: StdMutex<HashMap<String, Result<String, String>>>,
    }

    impl ScriptedRunner {
        fn respond(&self, command: &str, output: Result<&str, &str>) {
            self.responses.lock().unwrap().insert(
                command.to_string(),
                output.map(str::to_string).map_err(str::to_string),
            );
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            stdin: Option<&[u8]>,
        ) -> TunnelResult<String> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().unwrap().push(line.clone());
            if let Some(input) = stdin {
                self.stdin
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(input).into_owned());
            }

            match self.responses.lock().unwrap().get(&line) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(stderr)) => Err(TunnelError::Command {
                    program: program.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: stderr.clone(),
                }),
                None => Ok(String::new()),
            }
        }
    }

    fn scripted() -> (WgCommandTunnel, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("ip link show dev wg0", Err("Device \"wg0\" does not exist."));
        let tunnel = WgCommandTunnel::with_runner(TunnelConfig::default(), runner.clone());
        (tunnel, runner)
    }

    async fn initialized() -> (WgCommandTunnel, Arc<ScriptedRunner>) {
        let (tunnel, runner) = scripted();
        tunnel.initialize(2001).await.unwrap();
        runner.clear();
        (tunnel, runner)
    }

    fn dump_with_peers() -> String {
        format!(
            "{SELF_PRIVATE}\t{SELF_PUBLIC}\t2001\toff\n\
             {PEER_A}\t(none)\t203.0.113.5:41234\t10.1.0.5/32\t1700000000\t10\t20\t5\n\
             {PEER_B}\t(none)\t(none)\t10.1.0.1/32\t0\t0\t0\t5\n"
        )
    }

    #[tokio::test]
    async fn test_initialize() {
        let (tunnel, runner) = scripted();
        assert!(matches!(
            tunnel.public_key().await,
            Err(TunnelError::NotInitialized)
        ));

        tunnel.initialize(2001).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ip link show dev wg0",
                "ip link add dev wg0 type wireguard",
                "ip link set dev wg0 up",
                "wg set wg0 listen-port 2001 private-key /dev/stdin",
            ]
        );

        let stdin = runner.stdin.lock().unwrap().clone();
        assert_eq!(stdin.len(), 1);
        assert_eq!(stdin[0].trim_end().len(), 44);

        let public_key = tunnel.public_key().await.unwrap();
        assert_ne!(public_key.as_bytes(), &[0u8; 32]);
    }

    #[tokio::test]
    async fn test_initialize_existing_device() {
        let runner = Arc::new(ScriptedRunner::default());
        let tunnel = WgCommandTunnel::with_runner(TunnelConfig::default(), runner.clone());

        let err = tunnel.initialize(2001).await.unwrap_err();
        assert!(matches!(err, TunnelError::DeviceExists(ref name) if name == "wg0"));
        assert_eq!(runner.calls(), vec!["ip link show dev wg0"]);
    }

    #[tokio::test]
    async fn test_initialize_rolls_back_link() {
        let (tunnel, runner) = scripted();
        runner.respond("ip link set dev wg0 up", Err("Operation not permitted"));

        assert!(tunnel.initialize(2001).await.is_err());
        assert_eq!(runner.calls().last().unwrap(), "ip link del dev wg0");
        assert!(tunnel.public_key().await.is_err());
    }

    #[tokio::test]
    async fn test_add_peer_arguments() {
        let (tunnel, runner) = initialized().await;
        let key: PublicKey = PEER_A.parse().unwrap();

        tunnel
            .add_peer(&key, "10.1.0.5/32".parse().unwrap(), None, false)
            .await
            .unwrap();
        tunnel
            .add_peer(
                &key,
                "0.0.0.0/0".parse().unwrap(),
                Some("203.0.113.5:2001".parse().unwrap()),
                false,
            )
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                format!("wg set wg0 peer {PEER_A} persistent-keepalive 5 allowed-ips 10.1.0.5/32"),
                format!(
                    "wg set wg0 peer {PEER_A} persistent-keepalive 5 allowed-ips 0.0.0.0/0 endpoint 203.0.113.5:2001"
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_add_peer_requires_initialize() {
        let (tunnel, runner) = scripted();
        let key: PublicKey = PEER_A.parse().unwrap();

        let err = tunnel
            .add_peer(&key, "10.1.0.5/32".parse().unwrap(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NotInitialized));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_add_peer_replace_all() {
        let (tunnel, runner) = initialized().await;
        runner.respond("wg show wg0 dump", Ok(&dump_with_peers()));
        let key: PublicKey = PEER_A.parse().unwrap();

        tunnel
            .add_peer(&key, "10.1.0.5/32".parse().unwrap(), None, true)
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], "wg show wg0 dump");
        assert_eq!(calls[1], format!("wg set wg0 peer {PEER_B} remove"));
        assert!(!calls.contains(&format!("wg set wg0 peer {PEER_A} remove")));
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_peer_descriptor() {
        let (tunnel, runner) = initialized().await;
        runner.respond("wg show wg0 dump", Ok(&dump_with_peers()));

        let a: PublicKey = PEER_A.parse().unwrap();
        let descriptor = tunnel.peer_descriptor(&a).await.unwrap();
        assert_eq!(descriptor.public_key(), &a);
        assert_eq!(descriptor.allowed_range().to_string(), "10.1.0.5/32");
        assert_eq!(
            descriptor.endpoint(),
            Some("203.0.113.5:41234".parse().unwrap())
        );

        // Registered but no handshake yet
        let b: PublicKey = PEER_B.parse().unwrap();
        let err = tunnel.peer_descriptor(&b).await.unwrap_err();
        assert!(matches!(err, TunnelError::PeerNotFound(key) if key == b));
    }

    #[tokio::test]
    async fn test_remove_peer_by_allowed_range() {
        let (tunnel, runner) = initialized().await;
        runner.respond("wg show wg0 dump", Ok(&dump_with_peers()));

        let removed = tunnel
            .remove_peer_by_allowed_range("10.1.0.1/32".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            runner.calls(),
            vec![
                "wg show wg0 dump".to_string(),
                format!("wg set wg0 peer {PEER_B} remove"),
            ]
        );

        let removed = tunnel
            .remove_peer_by_allowed_range("10.9.9.9/32".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_set_interface_address() {
        let (tunnel, runner) = initialized().await;
        tunnel
            .set_interface_address("10.1.0.5/24".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "ip address flush dev wg0",
                "ip address replace 10.1.0.5/24 dev wg0",
            ]
        );
    }

    #[tokio::test]
    async fn test_interface_address() {
        let (tunnel, runner) = initialized().await;
        runner.respond(
            "ip -o address show dev wg0",
            Ok("4: wg0    inet 10.1.0.5/24 scope global wg0\\       valid_lft forever preferred_lft forever\n"),
        );
        assert_eq!(
            tunnel.interface_address().await.unwrap(),
            "10.1.0.5".parse::<IpAddr>().unwrap()
        );

        runner.respond("ip -o address show dev wg0", Ok(""));
        assert!(matches!(
            tunnel.interface_address().await,
            Err(TunnelError::NoAddress(_))
        ));
    }

    #[test]
    fn test_parse_interface_address_prefers_ipv4() {
        let output = "4: wg0    inet6 fd00::5/64 scope global\n4: wg0    inet 10.1.0.5/24 scope global wg0\n";
        assert_eq!(
            parse_interface_address(output),
            Some("10.1.0.5".parse().unwrap())
        );

        let output = "4: wg0    inet6 fd00::5/64 scope global\n";
        assert_eq!(
            parse_interface_address(output),
            Some("fd00::5".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_consumer_rules() {
        let (tunnel, runner) = initialized().await;

        tunnel.create_consumer_rules().await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "wg set wg0 fwmark 2349",
                "ip route add default dev wg0 table 2349",
                "resolvconf -a tun.wg0 -m 0 -x",
                "ip rule add not fwmark 2349 table 2349",
            ]
        );
        assert!(
            runner
                .stdin
                .lock()
                .unwrap()
                .contains(&"nameserver 8.8.8.8\n".to_string())
        );

        runner.clear();
        tunnel.remove_consumer_rules().await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "ip route del default dev wg0 table 2349",
                "resolvconf -d tun.wg0 -f",
                "ip rule del not fwmark 2349 table 2349",
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_consumer_rules_attempts_every_step() {
        let (tunnel, runner) = initialized().await;
        runner.respond("ip route del default dev wg0 table 2349", Err("No such process"));

        let err = tunnel.remove_consumer_rules().await.unwrap_err();
        assert!(matches!(err, TunnelError::Command { .. }));
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let (tunnel, runner) = initialized().await;
        tunnel.cleanup().await.unwrap();

        assert_eq!(runner.calls(), vec!["ip link del dev wg0"]);
        assert!(matches!(
            tunnel.public_key().await,
            Err(TunnelError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_leaves_foreign_device() {
        let (tunnel, runner) = scripted();
        runner.respond("ip link show dev wg0", Ok(""));

        let err = tunnel.initialize(2001).await.unwrap_err();
        assert!(matches!(err, TunnelError::DeviceExists(_)));

        tunnel.cleanup().await.unwrap();
        assert!(!runner.calls().iter().any(|c| c.starts_with("ip link del")));
    }
}
