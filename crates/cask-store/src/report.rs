//! Startup consistency report.
//!
//! `open` returns an [`FsReport`] describing every inconsistency found
//! while replaying container metadata, and every repair applied. Fatal
//! inconsistencies (short data files, duplicate block IDs) fail their
//! directory; everything else is repaired in place and merely reported.

use cask_types::BlockId;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// A metadata log ending in a torn or corrupt frame. Repair truncates the
/// log back to the last valid record.
#[derive(Debug, Clone, Serialize)]
pub struct PartialRecordReport {
    pub container: String,
    /// Byte offset of the defective tail.
    pub offset: u64,
    pub detail: String,
}

/// A record that replayed but made no sense (a DELETE without a CREATE, a
/// duplicate CREATE). The record is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct MalformedRecordReport {
    pub container: String,
    pub block_id: BlockId,
    pub detail: String,
}

/// A live block whose offset is not filesystem-block-aligned. The block
/// stays readable; its extent just cannot be fully reclaimed by punching.
#[derive(Debug, Clone, Serialize)]
pub struct MisalignedBlockReport {
    pub container: String,
    pub block_id: BlockId,
    pub offset: u64,
}

/// A container missing one of its files, or created and never written.
/// Repair deletes what is left of it.
#[derive(Debug, Clone, Serialize)]
pub struct IncompleteContainerReport {
    pub container: String,
    pub reason: String,
}

/// A fatal inconsistency. The owning directory is failed.
#[derive(Debug, Clone, Serialize)]
pub struct CorruptionReport {
    pub container: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsReportStats {
    pub data_dirs: usize,
    pub failed_data_dirs: usize,
    pub containers: u64,
    pub full_containers: u64,
    pub dead_containers: u64,
    pub low_live_containers: u64,
    pub live_blocks: u64,
    pub live_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub tmp_files_deleted: u64,
    pub partial_records_truncated: u64,
    pub orphan_tail_bytes_truncated: u64,
    pub dead_containers_deleted: u64,
    pub incomplete_containers_deleted: u64,
    pub holes_repunched: u64,
    pub metadata_files_compacted: u64,
}

/// Everything `open` found and fixed, per run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FsReport {
    pub stats: FsReportStats,
    pub repairs: RepairStats,
    pub partial_records: Vec<PartialRecordReport>,
    pub malformed_records: Vec<MalformedRecordReport>,
    pub misaligned_blocks: Vec<MisalignedBlockReport>,
    pub incomplete_containers: Vec<IncompleteContainerReport>,
    pub corruptions: Vec<CorruptionReport>,
    pub failed_dirs: Vec<PathBuf>,
}

impl FsReport {
    /// Fold a per-directory fragment into the aggregate.
    pub(crate) fn merge(&mut self, other: FsReport) {
        self.stats.data_dirs += other.stats.data_dirs;
        self.stats.failed_data_dirs += other.stats.failed_data_dirs;
        self.stats.containers += other.stats.containers;
        self.stats.full_containers += other.stats.full_containers;
        self.stats.dead_containers += other.stats.dead_containers;
        self.stats.low_live_containers += other.stats.low_live_containers;
        self.stats.live_blocks += other.stats.live_blocks;
        self.stats.live_bytes += other.stats.live_bytes;

        self.repairs.tmp_files_deleted += other.repairs.tmp_files_deleted;
        self.repairs.partial_records_truncated += other.repairs.partial_records_truncated;
        self.repairs.orphan_tail_bytes_truncated += other.repairs.orphan_tail_bytes_truncated;
        self.repairs.dead_containers_deleted += other.repairs.dead_containers_deleted;
        self.repairs.incomplete_containers_deleted += other.repairs.incomplete_containers_deleted;
        self.repairs.holes_repunched += other.repairs.holes_repunched;
        self.repairs.metadata_files_compacted += other.repairs.metadata_files_compacted;

        self.partial_records.extend(other.partial_records);
        self.malformed_records.extend(other.malformed_records);
        self.misaligned_blocks.extend(other.misaligned_blocks);
        self.incomplete_containers.extend(other.incomplete_containers);
        self.corruptions.extend(other.corruptions);
        self.failed_dirs.extend(other.failed_dirs);
    }

    /// Whether any directory had an unrepairable inconsistency.
    #[must_use]
    pub fn has_fatal_errors(&self) -> bool {
        !self.corruptions.is_empty() || !self.failed_dirs.is_empty()
    }

    /// Machine-readable form for hosts that archive startup reports.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for FsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "opened {} data dir(s) ({} failed): {} container(s), {} live block(s), {} live byte(s)",
            self.stats.data_dirs,
            self.stats.failed_data_dirs,
            self.stats.containers,
            self.stats.live_blocks,
            self.stats.live_bytes
        )?;
        writeln!(
            f,
            "inconsistencies: {} partial record(s), {} malformed record(s), {} misaligned block(s), \
             {} incomplete container(s), {} corruption(s)",
            self.partial_records.len(),
            self.malformed_records.len(),
            self.misaligned_blocks.len(),
            self.incomplete_containers.len(),
            self.corruptions.len()
        )?;
        write!(
            f,
            "repairs: {} tmp file(s) deleted, {} partial record(s) truncated, {} orphan tail byte(s) \
             truncated, {} dead container(s) deleted, {} incomplete container(s) deleted, \
             {} hole(s) repunched, {} metadata file(s) compacted",
            self.repairs.tmp_files_deleted,
            self.repairs.partial_records_truncated,
            self.repairs.orphan_tail_bytes_truncated,
            self.repairs.dead_containers_deleted,
            self.repairs.incomplete_containers_deleted,
            self.repairs.holes_repunched,
            self.repairs.metadata_files_compacted
        )
    }
}
