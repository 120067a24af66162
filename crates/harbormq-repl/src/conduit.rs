//! Replication conduit: an ordered, in-process channel between a live node and
//! its backup.
//!
//! Sending is synchronous so storage mirrors can forward ops from inside the
//! journal write path; receiving is async and drives the backup task.

use crate::error::ReplError;
use crate::packet::ReplicationFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Internal stats with atomic fields for lock-free updates.
#[derive(Debug)]
struct ConduitStatsInner {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
}

impl ConduitStatsInner {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

/// Statistics for one end of a conduit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConduitStats {
    /// Frames handed to the channel.
    pub frames_sent: u64,
    /// Frames taken off the channel.
    pub frames_received: u64,
    /// Sends refused because the conduit or the peer was gone.
    pub send_errors: u64,
}

/// State of one end of the conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConduitState {
    /// Connected and operational.
    #[default]
    Connected,
    /// Shutdown complete; sends fail.
    Shutdown,
}

/// One end of a bidirectional replication channel.
pub struct Conduit {
    state: Arc<parking_lot::Mutex<ConduitState>>,
    stats: Arc<ConduitStatsInner>,
    sender: mpsc::UnboundedSender<ReplicationFrame>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<ReplicationFrame>>>,
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("state", &*self.state.lock())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Clone for Conduit {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            sender: self.sender.clone(),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl Conduit {
    /// Creates a connected pair: frames sent on one end arrive on the other.
    pub fn new_pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel::<ReplicationFrame>();
        let (tx_b, rx_b) = mpsc::unbounded_channel::<ReplicationFrame>();

        let conduit_a = Self {
            state: Arc::new(parking_lot::Mutex::new(ConduitState::Connected)),
            stats: Arc::new(ConduitStatsInner::new()),
            sender: tx_a,
            receiver: Arc::new(Mutex::new(rx_b)),
        };

        let conduit_b = Self {
            state: Arc::new(parking_lot::Mutex::new(ConduitState::Connected)),
            stats: Arc::new(ConduitStatsInner::new()),
            sender: tx_b,
            receiver: Arc::new(Mutex::new(rx_a)),
        };

        (conduit_a, conduit_b)
    }

    /// Queues a frame for the peer. Frames arrive in the order they were sent.
    pub fn send_frame(&self, frame: ReplicationFrame) -> Result<(), ReplError> {
        if *self.state.lock() == ConduitState::Shutdown {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::Shutdown);
        }

        if self.sender.send(frame).is_err() {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::NetworkError {
                msg: "failed to send frame: channel closed".to_string(),
            });
        }

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Waits for the next frame. Returns None once every sender on the peer
    /// side has been dropped and the channel is drained.
    pub async fn recv_frame(&self) -> Option<ReplicationFrame> {
        let mut receiver = self.receiver.lock().await;
        let frame = receiver.recv().await?;
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Takes a frame if one is ready, without waiting.
    pub fn try_recv_frame(&self) -> Option<ReplicationFrame> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let frame = receiver.try_recv().ok()?;
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Current state of this end.
    pub fn state(&self) -> ConduitState {
        *self.state.lock()
    }

    /// Refuses further sends on this end.
    pub fn shutdown(&self) {
        *self.state.lock() = ConduitState::Shutdown;
    }

    /// Snapshot of current statistics.
    pub fn stats(&self) -> ConduitStats {
        ConduitStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ReplicationPacket;

    fn heartbeat(seq: u64) -> ReplicationFrame {
        ReplicationFrame::new(seq, ReplicationPacket::Heartbeat { timestamp: seq })
    }

    #[tokio::test]
    async fn test_create_pair() {
        let (a, b) = Conduit::new_pair();
        assert_eq!(a.state(), ConduitState::Connected);
        assert_eq!(b.state(), ConduitState::Connected);
    }

    #[tokio::test]
    async fn test_send_and_recv_in_order() {
        let (a, b) = Conduit::new_pair();
        for seq in 1..=3 {
            a.send_frame(heartbeat(seq)).unwrap();
        }
        for seq in 1..=3 {
            assert_eq!(b.recv_frame().await.unwrap().seq, seq);
        }
        assert_eq!(a.stats().frames_sent, 3);
        assert_eq!(b.stats().frames_received, 3);
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (a, b) = Conduit::new_pair();
        b.send_frame(heartbeat(7)).unwrap();
        assert_eq!(a.recv_frame().await.unwrap().seq, 7);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (a, _b) = Conduit::new_pair();
        a.shutdown();
        assert_eq!(a.state(), ConduitState::Shutdown);
        assert!(matches!(a.send_frame(heartbeat(1)), Err(ReplError::Shutdown)));
        assert_eq!(a.stats().send_errors, 1);
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (a, b) = Conduit::new_pair();
        drop(b);
        assert!(matches!(
            a.send_frame(heartbeat(1)),
            Err(ReplError::NetworkError { .. })
        ));
    }

    #[tokio::test]
    async fn test_recv_ends_when_peer_dropped() {
        let (a, b) = Conduit::new_pair();
        a.send_frame(heartbeat(1)).unwrap();
        drop(a);
        assert!(b.recv_frame().await.is_some());
        assert!(b.recv_frame().await.is_none());
    }

    #[test]
    fn test_try_recv() {
        let (a, b) = Conduit::new_pair();
        assert!(b.try_recv_frame().is_none());
        a.send_frame(heartbeat(1)).unwrap();
        assert_eq!(b.try_recv_frame().unwrap().seq, 1);
    }
}
