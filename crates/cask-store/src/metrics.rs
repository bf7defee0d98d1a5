//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters maintained by the block manager. Cheap enough to update on
/// every state transition; the host scrapes them via [`snapshot`].
///
/// [`snapshot`]: BlockManagerMetrics::snapshot
#[derive(Debug, Default)]
pub struct BlockManagerMetrics {
    blocks_under_management: AtomicU64,
    bytes_under_management: AtomicU64,
    containers: AtomicU64,
    full_containers: AtomicU64,
    holes_punched: AtomicU64,
    dead_containers_deleted: AtomicU64,
    metadata_files_compacted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks_under_management: u64,
    pub bytes_under_management: u64,
    pub containers: u64,
    pub full_containers: u64,
    pub holes_punched: u64,
    pub dead_containers_deleted: u64,
    pub metadata_files_compacted: u64,
}

impl BlockManagerMetrics {
    pub(crate) fn block_added(&self, bytes: u64) {
        self.blocks_under_management.fetch_add(1, Ordering::Relaxed);
        self.bytes_under_management
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn block_removed(&self, bytes: u64) {
        self.blocks_under_management.fetch_sub(1, Ordering::Relaxed);
        self.bytes_under_management
            .fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn container_added(&self) {
        self.containers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn container_full(&self) {
        self.full_containers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hole_punched(&self) {
        self.holes_punched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_container_deleted(&self) {
        self.dead_containers_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn metadata_file_compacted(&self) {
        self.metadata_files_compacted.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_under_management: self.blocks_under_management.load(Ordering::Relaxed),
            bytes_under_management: self.bytes_under_management.load(Ordering::Relaxed),
            containers: self.containers.load(Ordering::Relaxed),
            full_containers: self.full_containers.load(Ordering::Relaxed),
            holes_punched: self.holes_punched.load(Ordering::Relaxed),
            dead_containers_deleted: self.dead_containers_deleted.load(Ordering::Relaxed),
            metadata_files_compacted: self.metadata_files_compacted.load(Ordering::Relaxed),
        }
    }
}
