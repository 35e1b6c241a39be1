//! Receive loop with per-datagram dispatch.
//!
//! # Datagram Flow
//!
//! ```text
//! Transport → recv_from → acquire permit → spawn task → handler.handle_datagram
//!                 |
//!                 └→ error → loop ends, error returned to the supervisor
//! ```
//!
//! The transport's counters are logged when the loop ends.
//!
//! Each datagram is handled on its own Tokio task, so handlers run
//! concurrently with each other and with whatever else is sending on the
//! transport. The number of handlers in flight is capped by a semaphore; when
//! the cap is reached the loop stops reading until a handler finishes, leaving
//! excess datagrams in the socket buffer.

use crate::transport::{Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default cap on concurrently running handlers
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Default receive buffer; longer datagrams are truncated
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;

/// Something that reacts to received datagrams
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Handle one datagram.
    ///
    /// `payload` is the datagram decoded as UTF-8, with invalid sequences
    /// replaced. Handlers report their own failures; nothing is returned to
    /// the loop.
    async fn handle_datagram(&self, payload: String, from: SocketAddr);
}

/// Serve loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeConfig {
    /// Maximum handlers running at once
    pub max_in_flight: usize,
    /// Receive buffer size
    pub recv_buffer_size: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// Receive datagrams until the transport fails, dispatching each to `handler`.
///
/// Handlers still running when the loop ends are not awaited.
///
/// # Errors
///
/// Returns the receive error that ended the loop. A transport closed on
/// purpose ends the loop with `Ok(())`.
pub async fn serve<H>(
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
    config: ServeConfig,
) -> TransportResult<()>
where
    H: DatagramHandler + ?Sized,
{
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut buf = vec![0u8; config.recv_buffer_size.max(1)];

    if let Ok(addr) = transport.local_addr() {
        tracing::debug!(
            "Serving datagrams on {} (max in flight: {})",
            addr,
            config.max_in_flight
        );
    }

    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            // The semaphore is never closed while the loop owns it.
            return Ok(());
        };

        let (size, from) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(TransportError::Closed) => {
                tracing::debug!("Transport closed, serve loop finished: {}", transport.stats());
                return Ok(());
            }
            Err(e) => {
                tracing::error!(
                    "Receive failed, serve loop stopping: {} ({})",
                    e,
                    transport.stats()
                );
                return Err(e);
            }
        };

        let payload = String::from_utf8_lossy(&buf[..size]).into_owned();
        tracing::trace!("Received {} bytes from {}", size, from);

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler.handle_datagram(payload, from).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, SocketAddr)>>,
    }

    #[async_trait]
    impl DatagramHandler for Recorder {
        async fn handle_datagram(&self, payload: String, from: SocketAddr) {
            self.seen.lock().await.push((payload, from));
        }
    }

    impl Recorder {
        async fn wait_for(&self, count: usize) {
            while self.seen.lock().await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn peer() -> SocketAddr {
        "198.51.100.7:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_every_datagram() {
        let transport = Arc::new(MemoryTransport::new("127.0.0.1:2000".parse().unwrap()));
        let recorder = Arc::new(Recorder::default());

        let loop_task = tokio::spawn(serve(
            transport.clone(),
            recorder.clone(),
            ServeConfig::default(),
        ));

        transport.inject(b"get a", peer());
        transport.inject(b"get b", peer());

        tokio::time::timeout(Duration::from_secs(1), recorder.wait_for(2))
            .await
            .expect("handler not called");
        let mut seen: Vec<String> = recorder
            .seen
            .lock()
            .await
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["get a", "get b"]);

        transport.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_counts_served_datagrams() {
        let transport = Arc::new(MemoryTransport::new("127.0.0.1:2000".parse().unwrap()));
        let recorder = Arc::new(Recorder::default());

        let loop_task = tokio::spawn(serve(
            transport.clone(),
            recorder.clone(),
            ServeConfig::default(),
        ));

        transport.inject(b"remove", peer());
        transport.inject(b"exit", peer());
        tokio::time::timeout(Duration::from_secs(1), recorder.wait_for(2))
            .await
            .expect("handler not called");

        transport.close().await;
        tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let stats = transport.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.bytes_received, 10);
        assert_eq!(stats.recv_errors, 0);
    }

    #[tokio::test]
    async fn test_receive_error_is_counted() {
        let transport = Arc::new(MemoryTransport::new("127.0.0.1:2000".parse().unwrap()));
        let recorder = Arc::new(Recorder::default());

        transport.fail_next_recv(std::io::Error::other("socket gone"));
        let result = serve(transport.clone(), recorder, ServeConfig::default()).await;

        assert!(result.is_err());
        assert_eq!(transport.stats().recv_errors, 1);
    }

    #[tokio::test]
    async fn test_receive_error_ends_loop() {
        let transport = Arc::new(MemoryTransport::new("127.0.0.1:2000".parse().unwrap()));
        let recorder = Arc::new(Recorder::default());

        transport.fail_next_recv(std::io::Error::other("socket gone"));
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            serve(transport.clone(), recorder, ServeConfig::default()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    struct Blocking {
        running: AtomicUsize,
        peak: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl DatagramHandler for Blocking {
        async fn handle_datagram(&self, _payload: String, _from: SocketAddr) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_in_flight_cap() {
        let transport = Arc::new(MemoryTransport::new("127.0.0.1:2000".parse().unwrap()));
        let handler = Arc::new(Blocking {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            release: Notify::new(),
        });

        let config = ServeConfig {
            max_in_flight: 2,
            ..ServeConfig::default()
        };
        let loop_task = tokio::spawn(serve(transport.clone(), handler.clone(), config));

        for _ in 0..5 {
            transport.inject(b"exit", peer());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(transport.pending_inbound(), 3);

        handler.release.notify_waiters();
        transport.close().await;
        loop_task.abort();
    }
}
