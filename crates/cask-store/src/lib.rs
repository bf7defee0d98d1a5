#![forbid(unsafe_code)]
//! Log-structured block storage engine.
//!
//! Opaque binary blocks, identified by 64-bit IDs, are clustered into
//! *containers* to keep the number of files on disk small. A container is
//! a pair of sequentially written files: block payloads go into a data
//! file at filesystem-block-aligned offsets, and a small framed record per
//! creation or deletion goes into a metadata log. All metadata requests
//! are served from an in-memory index rebuilt at startup by replaying the
//! logs.
//!
//! Data and metadata operations are ordered so the persistent state is
//! recoverable after a crash at any point: when creating a block, data is
//! flushed before its CREATE record, so a lost record merely orphans data
//! that the next startup reclaims; when deleting, the index drops the
//! block before the DELETE record is appended, so the worst case is a
//! resurrected block, never a dangling index entry. A block becomes
//! visible in memory only after every on-disk step of its commit has
//! succeeded.
//!
//! Writers batch through [`BlockCreationTransaction`]: each writer leases
//! an available container, streams its block, and returns the container on
//! finalize so the next writer can extend it, possibly while the first is
//! still fsyncing its commit. The cost of that utilization is shared
//! failure: if any writer's commit fails, the container is tombstoned
//! read-only and in-flight writers on it fail too
//! ([`ContainerAvailability`] selects the safer return-after-commit policy
//! instead). Deleted block extents are reclaimed by punching holes, at
//! delete time and again during startup repair; containers with no live
//! blocks are deleted at startup, and metadata logs that are mostly
//! deletion residue are compacted then.

pub mod block;
pub mod cache;
pub mod config;
pub mod container;
pub mod dir;
pub mod latch;
pub mod manager;
pub mod metrics;
pub mod oid;
pub mod report;
mod startup;
pub mod transaction;

pub use block::{LogReadableBlock, LogWritableBlock, WritableBlockState};
pub use cache::{BasicFileCache, CountingMemTracker, FileCache, MemTracker};
pub use cask_error::{CaskError, Result};
pub use cask_types::BlockId;
pub use config::{BlockManagerOptions, ContainerAvailability};
pub use container::LogBlockContainer;
pub use dir::{DataDir, DirectoryManager, ErrorManager, LocalDirectoryManager, LoggingErrorManager};
pub use latch::CountDownLatch;
pub use manager::{CreateBlockOptions, LogBlockManager};
pub use metrics::{BlockManagerMetrics, MetricsSnapshot};
pub use oid::ObjectIdGenerator;
pub use report::FsReport;
pub use transaction::{BlockCreationTransaction, BlockDeletionTransaction, DeletionOutcome};
