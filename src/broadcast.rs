//! Snapshot fan-out to every open connection.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver buffering up to `capacity`
//! snapshots; a slow or dead connection lags and drops messages on its own
//! receiver without ever blocking delivery to the others.
//!
//! There is one group for the whole hub — the presence map is global, so
//! there is no room routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{PresenceSnapshot, ProtocolError};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub snapshots_sent: u64,
    pub active_receivers: usize,
}

/// Lock-free counters so the broadcast hot path never takes a lock.
struct AtomicBroadcastStats {
    snapshots_sent: AtomicU64,
}

/// Hub-wide broadcast group.
///
/// Snapshots are encoded once and shared as `Arc<String>` across all
/// receivers, so fan-out cost is independent of the snapshot size.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                snapshots_sent: AtomicU64::new(0),
            },
        }
    }

    /// Subscribe a new connection to snapshot fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<String>> {
        self.sender.subscribe()
    }

    /// Encode and broadcast a snapshot to all subscribers.
    ///
    /// Returns the number of receivers the message was delivered to. Zero
    /// receivers is not an error — the hub may momentarily have no open
    /// connections.
    pub fn broadcast(&self, snapshot: &PresenceSnapshot) -> Result<usize, ProtocolError> {
        let encoded = snapshot.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast a pre-encoded snapshot (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<String>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Number of currently subscribed receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            snapshots_sent: self.stats.snapshots_sent.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientReport;

    fn snapshot_with(id: &str, lat: f64, lng: f64) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert(id.into(), ClientReport::new(lat, lng).into());
        snapshot
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);

        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let snapshot = snapshot_with("alice", 10.0, 20.0);
        let count = group.broadcast(&snapshot).unwrap();
        assert_eq!(count, 3);

        let expected = snapshot.encode().unwrap();
        assert_eq!(*rx1.recv().await.unwrap(), expected);
        assert_eq!(*rx2.recv().await.unwrap(), expected);
        assert_eq!(*rx3.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(16);
        let count = group.broadcast(&snapshot_with("a", 1.0, 2.0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_broadcast_raw_shared_encoding() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.subscribe();

        let encoded = Arc::new(r#"{"a":{"lat":1.0,"lng":2.0}}"#.to_string());
        let count = group.broadcast_raw(encoded.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &encoded));
    }

    #[tokio::test]
    async fn test_lagging_receiver_does_not_block_others() {
        let group = BroadcastGroup::new(2);

        let mut slow = group.subscribe();
        let mut fast = group.subscribe();

        // Overflow the slow receiver's buffer.
        for i in 0..5 {
            group.broadcast(&snapshot_with("a", i as f64, 0.0)).unwrap();
            // The fast receiver keeps up.
            let _ = fast.recv().await.unwrap();
        }

        // The slow receiver lags but the channel stays usable.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            Ok(_) => {} // capacity-dependent; receiving is also fine
            Err(e) => panic!("unexpected recv error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.subscribe();

        group.broadcast(&snapshot_with("a", 1.0, 2.0)).unwrap();
        group.broadcast(&snapshot_with("a", 2.0, 3.0)).unwrap();

        let stats = group.stats();
        assert_eq!(stats.snapshots_sent, 2);
        assert_eq!(stats.active_receivers, 1);
    }

    #[test]
    fn test_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
