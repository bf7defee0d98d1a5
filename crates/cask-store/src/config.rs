//! Block manager configuration.

use cask_fs::kernel;

/// When a leased container is returned to the available pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerAvailability {
    /// As soon as the writer finalizes its block. Maximizes container
    /// utilization: later writers extend the container while earlier
    /// writers are still committing, at the cost of shared failure (a
    /// failed commit tombstones the container for everyone).
    #[default]
    AfterFinalize,
    /// Only after the creation transaction has committed and synced. One
    /// writer's commit failure cannot strand another writer's block.
    AfterCommit,
}

/// Options consumed from the host at construction time.
#[derive(Debug, Clone)]
pub struct BlockManagerOptions {
    /// If set, `open` skips all repair steps and every mutating operation
    /// fails.
    pub read_only: bool,
    /// Soft cap on a container data file. A container whose cursor reaches
    /// this after an append is marked full and set aside.
    pub max_container_size: u64,
    /// When false, deletions leave reclamation entirely to startup GC.
    pub hole_punch_enabled: bool,
    /// When containers return to the available pool.
    pub availability: ContainerAvailability,
    /// Containers whose live/total record ratio falls below this are
    /// candidates for metadata compaction at startup.
    pub low_live_ratio: f64,
    /// Metadata files smaller than this are never worth compacting.
    pub metadata_compact_min_size: u64,
    /// Override of the per-FS-block-size block-count cap table applied on
    /// kernels with the hole-punch bug. `None` uses the built-in table.
    pub per_fs_block_size_block_limits: Option<Vec<(u64, u64)>>,
    /// Override of kernel-bug detection; tests use this to exercise the
    /// block-count cap on healthy kernels.
    pub buggy_kernel_override: Option<bool>,
    /// Capacity of the default read-handle cache.
    pub file_cache_capacity: usize,
}

impl Default for BlockManagerOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            max_container_size: 10 * 1024 * 1024 * 1024,
            hole_punch_enabled: true,
            availability: ContainerAvailability::default(),
            low_live_ratio: 0.125,
            metadata_compact_min_size: 32 * 1024,
            per_fs_block_size_block_limits: None,
            buggy_kernel_override: None,
            file_cache_capacity: 256,
        }
    }
}

/// Known-good upper bounds on blocks per container for kernels vulnerable
/// to the el6 hole-punch bug, keyed by filesystem block size.
pub(crate) const BUILTIN_BLOCK_LIMITS: &[(u64, u64)] = &[(1024, 168), (2048, 338), (4096, 680)];

impl BlockManagerOptions {
    /// Whether the running kernel needs the per-container block-count cap.
    #[must_use]
    pub(crate) fn kernel_is_buggy(&self) -> bool {
        self.buggy_kernel_override.unwrap_or_else(|| {
            kernel::current_kernel_release()
                .map(|release| kernel::is_buggy_el6_kernel(&release))
                .unwrap_or(false)
        })
    }

    /// The block-count cap for a container on a filesystem with the given
    /// block size, if the kernel requires one.
    #[must_use]
    pub(crate) fn block_limit_for(&self, buggy_kernel: bool, fs_block_size: u64) -> Option<u64> {
        if !buggy_kernel {
            return None;
        }
        let table = self
            .per_fs_block_size_block_limits
            .as_deref()
            .unwrap_or(BUILTIN_BLOCK_LIMITS);
        lookup_block_limit(table, fs_block_size)
    }
}

/// The limit for the largest table entry whose block size does not exceed
/// `fs_block_size`; no limit below the smallest entry.
fn lookup_block_limit(table: &[(u64, u64)], fs_block_size: u64) -> Option<u64> {
    table
        .iter()
        .filter(|(size, _)| *size <= fs_block_size)
        .max_by_key(|(size, _)| *size)
        .map(|(_, limit)| *limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_uses_largest_entry_at_or_below() {
        assert_eq!(lookup_block_limit(BUILTIN_BLOCK_LIMITS, 1024), Some(168));
        assert_eq!(lookup_block_limit(BUILTIN_BLOCK_LIMITS, 2048), Some(338));
        assert_eq!(lookup_block_limit(BUILTIN_BLOCK_LIMITS, 4096), Some(680));
        assert_eq!(lookup_block_limit(BUILTIN_BLOCK_LIMITS, 65536), Some(680));
        assert_eq!(lookup_block_limit(BUILTIN_BLOCK_LIMITS, 512), None);
    }

    #[test]
    fn no_limit_on_healthy_kernels() {
        let opts = BlockManagerOptions::default();
        assert_eq!(opts.block_limit_for(false, 4096), None);
        assert_eq!(opts.block_limit_for(true, 4096), Some(680));
    }

    #[test]
    fn override_table_wins() {
        let opts = BlockManagerOptions {
            per_fs_block_size_block_limits: Some(vec![(4096, 10)]),
            ..Default::default()
        };
        assert_eq!(opts.block_limit_for(true, 4096), Some(10));
    }
}
