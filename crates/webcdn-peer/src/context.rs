//! Per-node identity and transfer counters
//!
//! Created once at startup and handed to every component that needs the local
//! id or records statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::PeerId;

#[derive(Debug, Clone)]
pub struct NodeContext {
    pub local_id: PeerId,
    pub stats: Arc<TransferStats>,
}

impl NodeContext {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            stats: Arc::new(TransferStats::default()),
        }
    }

    /// Fresh random identity
    pub fn generate() -> Self {
        Self::new(PeerId::new(uuid::Uuid::new_v4().to_string()))
    }
}

/// Monotonic transfer counters
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    peer_deliveries: AtomicU64,
    fallback_deliveries: AtomicU64,
    integrity_failures: AtomicU64,
    evicted_transfers: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub peer_deliveries: u64,
    pub fallback_deliveries: u64,
    pub integrity_failures: u64,
    pub evicted_transfers: u64,
}

impl TransferStats {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_peer_delivery(&self) {
        self.peer_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_delivery(&self) {
        self.fallback_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.evicted_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            peer_deliveries: self.peer_deliveries.load(Ordering::Relaxed),
            fallback_deliveries: self.fallback_deliveries.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            evicted_transfers: self.evicted_transfers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        let a = NodeContext::generate();
        let b = NodeContext::generate();
        assert_ne!(a.local_id, b.local_id);
    }

    #[test]
    fn test_stats_shared_between_clones() {
        let ctx = NodeContext::new(PeerId::from("node"));
        let clone = ctx.clone();
        clone.stats.record_sent(100);
        clone.stats.record_received(40);
        ctx.stats.record_fallback_delivery();

        let snap = ctx.stats.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 40);
        assert_eq!(snap.fallback_deliveries, 1);
        assert_eq!(snap.peer_deliveries, 0);
    }
}
