//! Block descriptors and the writable/readable block handles.

use cask_error::{CaskError, Result};
use cask_types::BlockId;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::cache::MemTracker;
use crate::config::ContainerAvailability;
use crate::container::LogBlockContainer;
use crate::manager::LogBlockManager;

/// Rough per-entry footprint of an index entry (descriptor plus map
/// overhead), reported to the host's memory tracker.
pub(crate) const LOG_BLOCK_FOOTPRINT: u64 = 88;

/// Immutable descriptor of a committed block: where its bytes live.
///
/// Shared between the live index and any open readers. The container
/// back-pointer is weak: containers outlive every descriptor in practice
/// (they are only unlinked by startup repair), and the index must not keep
/// a retired container's file handles alive through a cycle.
pub struct LogBlock {
    id: BlockId,
    container: Weak<LogBlockContainer>,
    offset: u64,
    length: u64,
    deleted: AtomicBool,
    mem_tracker: Arc<dyn MemTracker>,
}

impl LogBlock {
    pub(crate) fn new(
        container: &Arc<LogBlockContainer>,
        id: BlockId,
        offset: u64,
        length: u64,
        mem_tracker: Arc<dyn MemTracker>,
    ) -> Arc<Self> {
        mem_tracker.consume(LOG_BLOCK_FOOTPRINT);
        Arc::new(Self {
            id,
            container: Arc::downgrade(container),
            offset,
            length,
            deleted: AtomicBool::new(false),
            mem_tracker,
        })
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn container(&self) -> Option<Arc<LogBlockContainer>> {
        self.container.upgrade()
    }

    /// Flag the block's extent for reclamation once the last reference
    /// drops. Set only after the DELETE record is durable.
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

impl Drop for LogBlock {
    fn drop(&mut self) {
        self.mem_tracker.release(LOG_BLOCK_FOOTPRINT);
        // Deferred hole punch: deleting waits for in-flight readers, which
        // hold strong references, to finish.
        if self.deleted.load(Ordering::Acquire) {
            if let Some(container) = self.container.upgrade() {
                if container.hole_punch_enabled() {
                    container.punch_extent(self.offset, self.length);
                }
            }
        }
    }
}

impl std::fmt::Debug for LogBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBlock")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a block being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableBlockState {
    /// No data appended yet.
    Clean,
    /// Some data appended, not yet finalized.
    Dirty,
    /// Extent recorded; awaiting its transaction's commit.
    Finalized,
    /// Committed and visible in the live index.
    Committed,
    /// Abandoned; the reserved extent (if any) is an orphan.
    Aborted,
}

/// A block being streamed into a leased container.
///
/// The writer owns the container lease until `finalize` (or until commit,
/// under [`ContainerAvailability::AfterCommit`]); while leased, no other
/// writer can extend the container, so appends land at a stable offset.
///
/// Dropping an uncommitted block aborts it.
pub struct LogWritableBlock {
    manager: Arc<LogBlockManager>,
    container: Arc<LogBlockContainer>,
    id: BlockId,
    offset: u64,
    bytes_appended: u64,
    state: WritableBlockState,
    holds_lease: bool,
}

impl LogWritableBlock {
    pub(crate) fn new(
        manager: Arc<LogBlockManager>,
        container: Arc<LogBlockContainer>,
        id: BlockId,
        offset: u64,
    ) -> Self {
        trace!(
            target: "cask::block",
            event = "writable_block_created",
            block_id = %id,
            container = container.name(),
            offset
        );
        Self {
            manager,
            container,
            id,
            offset,
            bytes_appended: 0,
            state: WritableBlockState::Clean,
            holds_lease: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> WritableBlockState {
        self.state
    }

    #[must_use]
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    #[must_use]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn container(&self) -> &Arc<LogBlockContainer> {
        &self.container
    }

    /// Stream more bytes into the block.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            WritableBlockState::Clean | WritableBlockState::Dirty => {}
            other => {
                return Err(CaskError::IllegalState(format!(
                    "cannot append to block {} in state {other:?}",
                    self.id
                )))
            }
        }
        let result = self
            .container
            .write_data(self.offset + self.bytes_appended, data);
        if let Err(err) = &result {
            self.manager
                .notify_disk_failure(self.container.dir(), err);
        }
        result?;
        self.bytes_appended += data.len() as u64;
        self.state = WritableBlockState::Dirty;
        Ok(())
    }

    /// Declare the block complete: record its extent against the container
    /// cursor and (by default) hand the container to the next writer. The
    /// block stays invisible until its transaction commits.
    pub fn finalize(&mut self) -> Result<()> {
        match self.state {
            WritableBlockState::Finalized => return Ok(()),
            WritableBlockState::Clean | WritableBlockState::Dirty => {}
            other => {
                return Err(CaskError::IllegalState(format!(
                    "cannot finalize block {} in state {other:?}",
                    self.id
                )))
            }
        }
        let offset = match self.container.reserve(self.bytes_appended) {
            Ok(offset) => offset,
            Err(err) => {
                self.manager
                    .notify_disk_failure(self.container.dir(), &err);
                return Err(err);
            }
        };
        debug_assert_eq!(
            offset, self.offset,
            "lease holder observed a moved container cursor"
        );
        self.state = WritableBlockState::Finalized;
        if self.manager.options().availability == ContainerAvailability::AfterFinalize {
            self.release_lease();
        }
        Ok(())
    }

    /// Abandon the block. Its ID is released and any reserved extent
    /// becomes an orphan, reclaimed by a later metadata compaction cycle.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    pub(crate) fn abort_in_place(&mut self) {
        if matches!(
            self.state,
            WritableBlockState::Committed | WritableBlockState::Aborted
        ) {
            return;
        }
        trace!(
            target: "cask::block",
            event = "writable_block_aborted",
            block_id = %self.id,
            state = ?self.state
        );
        self.state = WritableBlockState::Aborted;
        self.manager.release_block_id(self.id);
        self.release_lease();
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = WritableBlockState::Committed;
    }

    /// Return the container to the available pool, once.
    pub(crate) fn release_lease(&mut self) {
        if self.holds_lease {
            self.holds_lease = false;
            self.manager.make_container_available(&self.container);
        }
    }
}

impl Drop for LogWritableBlock {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

impl std::fmt::Debug for LogWritableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWritableBlock")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("bytes_appended", &self.bytes_appended)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Read handle over a committed block.
///
/// Holds a strong reference to the descriptor, so the handle stays valid
/// across a concurrent delete; the extent is only punched once every
/// reader is done.
pub struct LogReadableBlock {
    block: Arc<LogBlock>,
    file: Arc<File>,
}

impl LogReadableBlock {
    pub(crate) fn new(block: Arc<LogBlock>, file: Arc<File>) -> Self {
        Self { block, file }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.block.length()
    }

    /// Read `buf.len()` bytes starting at `offset` within the block.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.block.length() {
            return Err(CaskError::IllegalState(format!(
                "read of [{offset}, {end}) is out of bounds for block {} of length {}",
                self.block.id(),
                self.block.length()
            )));
        }
        self.file
            .read_exact_at(buf, self.block.offset() + offset)?;
        Ok(())
    }

    /// The block's entire payload.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; usize::try_from(self.block.length()).unwrap_or(usize::MAX)];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for LogReadableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReadableBlock")
            .field("id", &self.block.id())
            .field("size", &self.block.length())
            .finish_non_exhaustive()
    }
}
