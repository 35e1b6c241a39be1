//! # Traverser Rendezvous
//!
//! Server and client roles of the rendezvous protocol.
//!
//! The server registers clients as tunnel peers and answers lookups with the
//! public endpoint its tunnel observed for the requested peer. The client
//! registers, moves its control traffic into the tunnel once acknowledged, and
//! applies looked-up peers in provider (split) or consumer (full) mode.
//!
//! Both roles implement [`traverser_transport::DatagramHandler`] and are run
//! by [`traverser_transport::serve`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod server;

pub use client::{ClientConfig, Command, HELP, Mode, RendezvousClient, RendezvousSession};
pub use error::{ErrorKind, RendezvousError, Result};
pub use server::RendezvousServer;
