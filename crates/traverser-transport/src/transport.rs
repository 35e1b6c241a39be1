//! Transport trait abstraction.
//!
//! The rendezvous roles only ever talk to a `Transport`, which lets the same
//! handler code run over a real UDP socket or over the in-memory transport
//! used in tests.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Requested local address
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// Implementations must be safe to share between the receive loop and any
/// number of concurrent senders.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`.
    ///
    /// # Returns
    /// The number of bytes sent
    ///
    /// # Errors
    /// Returns `TransportError` if the send fails. Failures are not retried.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive the next datagram.
    ///
    /// Datagrams longer than `buf` are truncated.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport has been closed,
    /// or the underlying I/O error.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport.
    ///
    /// Pending and future receives return `TransportError::Closed`.
    async fn close(&self);

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl fmt::Display for TransportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} datagrams ({} bytes) received, {} datagrams ({} bytes) sent, {} receive errors, {} send errors",
            self.packets_received,
            self.bytes_received,
            self.packets_sent,
            self.bytes_sent,
            self.recv_errors,
            self.send_errors
        )
    }
}
