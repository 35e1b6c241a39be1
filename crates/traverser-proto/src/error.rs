//! Protocol error types.

use thiserror::Error;

/// Errors raised while interpreting protocol values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Public key is not 32 bytes of base64
    #[error("invalid public key {key:?}: {reason}")]
    InvalidKey {
        /// Offending key text
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Address is not a valid IP or `ip:port`
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// Address range is not valid CIDR
    #[error("invalid address range: {0:?}")]
    InvalidRange(String),

    /// Peer descriptor JSON could not be decoded or encoded
    #[error("invalid peer descriptor: {0}")]
    InvalidDescriptor(String),

    /// Host id does not map into the tunnel network
    #[error("host id {host_id} is not a usable host in {network}")]
    InvalidHostId {
        /// Requested host id
        host_id: u32,
        /// Tunnel network
        network: String,
    },
}
