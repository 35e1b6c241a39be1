//! Tunnel error types.

use std::io;
use thiserror::Error;
use traverser_proto::PublicKey;

/// Errors raised by tunnel managers
#[derive(Debug, Error)]
pub enum TunnelError {
    /// An external tool exited unsuccessfully
    #[error("{program} failed ({status}): {stderr}")]
    Command {
        /// Program that was run
        program: String,
        /// Exit status as reported by the OS
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// Spawning or talking to a tool failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No peer with this key has a known endpoint
    #[error("peer {0} not found")]
    PeerNotFound(PublicKey),

    /// Interface has no address assigned yet
    #[error("interface {0} has no address")]
    NoAddress(String),

    /// Interface already exists
    #[error("device with interface name {0} already exists")]
    DeviceExists(String),

    /// Device has not been initialized
    #[error("tunnel device is not initialized")]
    NotInitialized,

    /// Tool output could not be understood
    #[error("unexpected tool output: {0}")]
    Parse(String),
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;
