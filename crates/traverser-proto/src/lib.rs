//! # Traverser Protocol
//!
//! Wire protocol spoken between the rendezvous server and its clients.
//!
//! This crate provides:
//! - The line-oriented message codec (`add`, `get`, `peer`, `remove`, `exit`)
//! - WireGuard public keys in their base64 text form
//! - The JSON peer descriptor carried by `peer` replies
//! - Tunnel address helpers (host routes, host-id mapping)
//!
//! ## Example
//!
//! ```rust
//! use traverser_proto::Message;
//!
//! let msg = Message::parse("get uDXRpjBVjdMKyXm1Tv1ECDfszZ2T3ZuvKT5Vp0LwTTE=");
//! assert!(matches!(msg, Message::Get { .. }));
//! assert_eq!(Message::from_bytes(&msg.to_bytes()), msg);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addressing;
pub mod descriptor;
pub mod error;
pub mod key;
pub mod message;

pub use addressing::{all_addresses, host_address, host_route, parse_address};
pub use descriptor::PeerDescriptor;
pub use error::ProtoError;
pub use key::PublicKey;
pub use message::Message;

use std::time::Duration;

/// Default UDP port used for rendezvous signaling
pub const DEFAULT_UDP_PORT: u16 = 2000;

/// Default WireGuard listen port
pub const DEFAULT_WIREGUARD_PORT: u16 = 2001;

/// Persistent keepalive applied to every configured peer
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);

/// Firewall mark and routing table used for full-tunnel (consumer) mode
pub const DEFAULT_FIREWALL_MARK: u32 = 2349;

/// Default tunnel network
pub const DEFAULT_TUNNEL_NETWORK: &str = "10.1.0.0/24";

/// Default tunnel address of the rendezvous server
pub const DEFAULT_SERVER_TUNNEL_ADDRESS: &str = "10.1.0.1/24";

/// Largest signaling datagram accepted by either role
pub const MAX_DATAGRAM_SIZE: usize = 1024;
