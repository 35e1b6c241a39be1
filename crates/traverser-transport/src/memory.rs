//! In-memory transport.
//!
//! Records every datagram sent and delivers datagrams injected by the caller,
//! so role handlers can be driven deterministically without sockets.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, watch};

/// A datagram recorded by [`MemoryTransport::send_to`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Destination
    pub to: SocketAddr,
}

impl SentDatagram {
    /// Payload as text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct State {
    inbound: VecDeque<io::Result<(Vec<u8>, SocketAddr)>>,
    sent: Vec<SentDatagram>,
    failing_sends: bool,
    stats: TransportStats,
}

/// Transport backed by in-process queues
pub struct MemoryTransport {
    local_addr: SocketAddr,
    state: Mutex<State>,
    arrived: Notify,
    closed: watch::Sender<bool>,
}

impl MemoryTransport {
    /// Create a transport that reports `local_addr` as its bound address.
    #[must_use]
    pub fn new(local_addr: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            local_addr,
            state: Mutex::new(State::default()),
            arrived: Notify::new(),
            closed,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a datagram for the next `recv_from`.
    pub fn inject(&self, payload: &[u8], from: SocketAddr) {
        self.state().inbound.push_back(Ok((payload.to_vec(), from)));
        self.arrived.notify_one();
    }

    /// Make a queued `recv_from` fail with `error`.
    pub fn fail_next_recv(&self, error: io::Error) {
        self.state().inbound.push_back(Err(error));
        self.arrived.notify_one();
    }

    /// Make every subsequent send fail (or succeed again).
    pub fn set_failing_sends(&self, failing: bool) {
        self.state().failing_sends = failing;
    }

    /// Datagrams sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state().sent.clone()
    }

    /// Forget recorded sends.
    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    /// Injected datagrams not yet received.
    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut state = self.state();
        if state.failing_sends {
            state.stats.send_errors += 1;
            return Err(TransportError::Io(io::Error::other("send failure injected")));
        }

        state.sent.push(SentDatagram {
            payload: buf.to_vec(),
            to: addr,
        });
        state.stats.packets_sent += 1;
        state.stats.bytes_sent += buf.len() as u64;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Err(TransportError::Closed);
            }

            let next = self.state().inbound.pop_front();
            match next {
                Some(Ok((payload, from))) => {
                    let size = payload.len().min(buf.len());
                    buf[..size].copy_from_slice(&payload[..size]);

                    let mut state = self.state();
                    state.stats.packets_received += 1;
                    state.stats.bytes_received += size as u64;
                    return Ok((size, from));
                }
                Some(Err(e)) => {
                    self.state().stats.recv_errors += 1;
                    return Err(TransportError::Io(e));
                }
                None => {}
            }

            tokio::select! {
                () = self.arrived.notified() => {}
                () = async {
                    let _ = closed.wait_for(|closed| *closed).await;
                } => return Err(TransportError::Closed),
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        self.state().stats
    }
}
