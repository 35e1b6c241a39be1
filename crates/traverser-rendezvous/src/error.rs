//! Rendezvous error types.

use thiserror::Error;
use traverser_proto::{ProtoError, PublicKey};
use traverser_transport::TransportError;
use traverser_tunnel::TunnelError;

/// Why a message or command was dropped
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Malformed key, address or descriptor
    #[error("parse error: {0}")]
    Parse(#[from] ProtoError),

    /// The tunnel rejected a change or could not report its state
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Sending a message failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No reachable peer is registered under this key
    #[error("no reachable peer registered for {0}")]
    Lookup(PublicKey),

    /// Descriptor carries no endpoint to reach the peer at
    #[error("descriptor for {0} has no endpoint")]
    MissingEndpoint(PublicKey),
}

/// Coarse classification of [`RendezvousError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input could not be interpreted
    Parse,
    /// Tunnel subsystem failure
    Facade,
    /// Socket failure
    Transport,
    /// Unknown or unreachable peer
    Lookup,
}

impl RendezvousError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RendezvousError::Parse(_) | RendezvousError::MissingEndpoint(_) => ErrorKind::Parse,
            RendezvousError::Tunnel(_) => ErrorKind::Facade,
            RendezvousError::Transport(_) => ErrorKind::Transport,
            RendezvousError::Lookup(_) => ErrorKind::Lookup,
        }
    }
}

/// Result type for rendezvous operations
pub type Result<T> = std::result::Result<T, RendezvousError>;
