//! # Traverser Transport
//!
//! Datagram transport shared by the rendezvous server and client.
//!
//! This crate provides:
//! - The [`Transport`] trait used by both roles
//! - A Tokio UDP implementation bound through `socket2`
//! - A receive loop that hands every datagram to its own task, with a bound
//!   on how many handlers run at once
//! - An in-memory transport for driving handlers in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod serve;
pub mod transport;
pub mod udp;

pub use memory::{MemoryTransport, SentDatagram};
pub use serve::{DatagramHandler, ServeConfig, serve};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;
