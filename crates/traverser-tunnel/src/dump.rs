//! Parser for `wg show <interface> dump`.
//!
//! The first line describes the interface:
//!
//! ```text
//! private-key  public-key  listen-port  fwmark
//! ```
//!
//! Every following line describes one peer:
//!
//! ```text
//! public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  persistent-keepalive
//! ```
//!
//! Fields are tab separated. Absent values are printed as `(none)` or `off`.
//! Only peer keys, endpoints and allowed ranges are read; the interface line
//! is checked for shape and otherwise skipped.

use crate::error::{TunnelError, TunnelResult};
use ipnet::IpNet;
use std::net::SocketAddr;
use traverser_proto::{PeerDescriptor, PublicKey};

const NONE: &str = "(none)";

/// Interface state reported by `wg`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDump {
    /// Configured peers
    pub peers: Vec<PeerDump>,
}

/// One peer as reported by `wg`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    /// Peer key
    pub public_key: PublicKey,
    /// Last known endpoint
    pub endpoint: Option<SocketAddr>,
    /// Allowed ranges
    pub allowed_ips: Vec<IpNet>,
}

impl PeerDump {
    /// Descriptor for this peer.
    ///
    /// `None` until the peer has both an endpoint and an allowed range. The
    /// first allowed range is reported.
    #[must_use]
    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        let endpoint = self.endpoint?;
        let range = *self.allowed_ips.first()?;
        Some(PeerDescriptor::new(self.public_key, range, Some(endpoint)))
    }

    /// Whether `range` is one of this peer's allowed ranges.
    #[must_use]
    pub fn allows(&self, range: &IpNet) -> bool {
        self.allowed_ips.contains(range)
    }
}

/// Parse the output of `wg show <interface> dump`.
///
/// # Errors
///
/// Returns `TunnelError::Parse` if a line has the wrong number of fields or
/// a peer key, endpoint or allowed range is malformed.
pub fn parse_dump(output: &str) -> TunnelResult<DeviceDump> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| TunnelError::Parse("empty dump".to_string()))?;

    if header.split('\t').count() != 4 {
        return Err(parse_error("interface line", header));
    }

    let peers = lines.map(parse_peer).collect::<TunnelResult<Vec<_>>>()?;
    Ok(DeviceDump { peers })
}

fn parse_peer(line: &str) -> TunnelResult<PeerDump> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [
        public_key,
        _preshared_key,
        endpoint,
        allowed_ips,
        _latest_handshake,
        _rx,
        _tx,
        _keepalive,
    ] = fields.as_slice()
    else {
        return Err(parse_error("peer line", line));
    };

    let endpoint = match *endpoint {
        NONE => None,
        ep => Some(ep.parse().map_err(|_| parse_error("endpoint", ep))?),
    };

    let allowed_ips = match *allowed_ips {
        NONE | "" => Vec::new(),
        ips => ips
            .split(',')
            .map(|ip| ip.trim().parse().map_err(|_| parse_error("allowed ip", ip)))
            .collect::<TunnelResult<_>>()?,
    };

    Ok(PeerDump {
        public_key: parse_key(public_key)?,
        endpoint,
        allowed_ips,
    })
}

fn parse_key(key: &str) -> TunnelResult<PublicKey> {
    key.parse()
        .map_err(|e| TunnelError::Parse(format!("public key: {e}")))
}

fn parse_error(what: &str, value: &str) -> TunnelError {
    TunnelError::Parse(format!("bad {what}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const SELF_KEY: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";
    const PEER_A: &str = "uDXRpjBVjdMKyXm1Tv1ECDfszZ2T3ZuvKT5Vp0LwTTE=";
    const PEER_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

    fn sample() -> String {
        format!(
            "{PRIVATE}\t{SELF_KEY}\t2001\t2349\n\
             {PEER_A}\t(none)\t203.0.113.5:41234\t10.1.0.5/32\t1700000000\t1024\t2048\t5\n\
             {PEER_B}\t(none)\t(none)\t10.1.0.6/32,10.2.0.0/16\t0\t0\t0\toff\n"
        )
    }

    #[test]
    fn test_parse_peers() {
        let dump = parse_dump(&sample()).unwrap();
        assert_eq!(dump.peers.len(), 2);

        let a = &dump.peers[0];
        assert_eq!(a.public_key, PEER_A.parse().unwrap());
        assert_eq!(a.endpoint, Some("203.0.113.5:41234".parse().unwrap()));
        assert_eq!(a.allowed_ips, vec!["10.1.0.5/32".parse::<IpNet>().unwrap()]);

        let b = &dump.peers[1];
        assert_eq!(b.endpoint, None);
        assert_eq!(b.allowed_ips.len(), 2);
    }

    #[test]
    fn test_descriptor_requires_endpoint() {
        let dump = parse_dump(&sample()).unwrap();

        let descriptor = dump.peers[0].descriptor().unwrap();
        assert_eq!(descriptor.allowed_range().to_string(), "10.1.0.5/32");
        assert_eq!(
            descriptor.endpoint(),
            Some("203.0.113.5:41234".parse().unwrap())
        );

        assert!(dump.peers[1].descriptor().is_none());
    }

    #[test]
    fn test_fresh_device() {
        let dump = parse_dump("(none)\t(none)\t0\toff\n").unwrap();
        assert!(dump.peers.is_empty());
    }

    #[test]
    fn test_unread_fields_are_not_validated() {
        // Handshake, transfer and keepalive columns vary across wg versions
        let dump = parse_dump(&format!(
            "{PRIVATE}\t{SELF_KEY}\t2001\t0x92d\n\
             {PEER_A}\t(none)\t203.0.113.5:41234\t10.1.0.5/32\tsoon\t-\t-\tevery 25s\n"
        ))
        .unwrap();

        assert_eq!(dump.peers.len(), 1);
        assert_eq!(
            dump.peers[0].descriptor().unwrap().endpoint(),
            Some("203.0.113.5:41234".parse().unwrap())
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_dump("").is_err());
        assert!(parse_dump("garbage").is_err());
        assert!(parse_dump(&format!("{PRIVATE}\t{SELF_KEY}\t2001\toff\nshort\tline\n")).is_err());
        assert!(
            parse_dump(&format!(
                "{PRIVATE}\t{SELF_KEY}\t2001\toff\n\
                 {PEER_A}\t(none)\tnowhere\t10.1.0.5/32\t0\t0\t0\toff\n"
            ))
            .is_err()
        );
    }

    #[test]
    fn test_allows() {
        let dump = parse_dump(&sample()).unwrap();
        assert!(dump.peers[1].allows(&"10.2.0.0/16".parse().unwrap()));
        assert!(!dump.peers[1].allows(&"10.2.0.0/24".parse().unwrap()));
    }
}
