//! Creation and deletion transactions.
//!
//! Writers batch blocks into a creation transaction so that blocks landing
//! in the same container share one data fsync and one metadata fsync at
//! commit. Deletions batch the same way in the other direction: the blocks
//! leave the live index first, then their DELETE records are appended and
//! flushed per container.

use cask_error::{CaskError, Result};
use cask_ondisk::BlockRecord;
use cask_types::BlockId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::block::{LogBlock, LogWritableBlock};
use crate::config::ContainerAvailability;
use crate::container::LogBlockContainer;
use crate::manager::LogBlockManager;

/// Batches writable blocks for a single durable commit.
///
/// Commit groups the blocks by container and, per group in container-name
/// order: flushes the data file, appends all CREATE records, flushes the
/// metadata log once, and fsyncs the directory if the container is new.
/// Only then do the group's blocks enter the live index.
///
/// Groups fail independently: an I/O error tombstones that container and
/// aborts its blocks, the remaining groups still commit, and the first
/// error is returned.
pub struct BlockCreationTransaction {
    manager: Arc<LogBlockManager>,
    blocks: Vec<LogWritableBlock>,
}

impl BlockCreationTransaction {
    pub(crate) fn new(manager: Arc<LogBlockManager>) -> Self {
        Self {
            manager,
            blocks: Vec::new(),
        }
    }

    /// Add a block to the batch. The block need not be finalized yet;
    /// commit finalizes stragglers.
    pub fn add_block(&mut self, block: LogWritableBlock) {
        self.blocks.push(block);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Make every batched block durable and visible, or abort the ones
    /// whose container failed. Returns the first error encountered.
    pub fn commit(mut self) -> Result<()> {
        let mut first_error: Option<CaskError> = None;

        let mut ready: Vec<LogWritableBlock> = Vec::with_capacity(self.blocks.len());
        for mut block in self.blocks.drain(..) {
            match block.finalize() {
                Ok(()) => ready.push(block),
                Err(err) => {
                    block.abort_in_place();
                    first_error.get_or_insert(err);
                }
            }
        }

        let mut groups: BTreeMap<String, Vec<LogWritableBlock>> = BTreeMap::new();
        for block in ready {
            groups
                .entry(block.container().name().to_owned())
                .or_default()
                .push(block);
        }

        for (_, mut blocks) in groups {
            let container = Arc::clone(blocks[0].container());
            match Self::commit_group(&self.manager, &container, &blocks) {
                Ok(()) => {
                    let count = blocks.len() as u64;
                    let bytes: u64 = blocks.iter().map(LogWritableBlock::bytes_appended).sum();
                    for block in &mut blocks {
                        block.mark_committed();
                    }
                    if let Err(err) = self.manager.install_blocks(&container, &blocks) {
                        first_error.get_or_insert(err);
                    }
                    container.note_blocks_committed(count, bytes);
                    if self.manager.options().availability == ContainerAvailability::AfterCommit {
                        for block in &mut blocks {
                            block.release_lease();
                        }
                    }
                    debug!(
                        target: "cask::transaction",
                        event = "creation_commit",
                        container = container.name(),
                        blocks = count,
                        bytes
                    );
                }
                Err(err) => {
                    container.mark_read_only(&err.to_string());
                    self.manager.notify_disk_failure(container.dir(), &err);
                    for block in &mut blocks {
                        block.abort_in_place();
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn commit_group(
        manager: &LogBlockManager,
        container: &Arc<LogBlockContainer>,
        blocks: &[LogWritableBlock],
    ) -> Result<()> {
        if let Some(reason) = container.read_only_reason() {
            // Another writer's commit already tombstoned this container.
            return Err(CaskError::ContainerReadOnly {
                container: container.name().to_owned(),
                reason,
            });
        }
        container.flush_data()?;
        let prior_len = container.metadata_len();
        let records: Vec<BlockRecord> = blocks
            .iter()
            .map(|block| BlockRecord::create(block.id(), block.offset(), block.bytes_appended()))
            .collect();
        container.append_records(&records)?;
        if let Err(err) = container.flush_metadata() {
            // Roll the unsynced records back out so a clean restart agrees
            // with the error we are about to return.
            container.truncate_metadata_to(prior_len);
            return Err(err);
        }
        manager.sync_container_dir(container)?;
        Ok(())
    }
}

/// What a deletion transaction accomplished.
#[derive(Debug, Default)]
pub struct DeletionOutcome {
    /// IDs whose DELETE records are durable.
    pub deleted: Vec<BlockId>,
    /// IDs that had no live block (already deleted, or never existed).
    pub not_found: Vec<BlockId>,
    /// First metadata failure, if any. Blocks in the failed container were
    /// removed from the live index but their deletion is not durable; a
    /// restart resurrects them.
    pub first_error: Option<CaskError>,
}

/// Batches block deletions.
///
/// Commit removes the blocks from the live index first (concurrent opens
/// either see the block or `NotFound`, never a dangling entry), appends
/// and flushes DELETE records per container, and arranges for each extent
/// to be hole-punched when its last reader drops.
pub struct BlockDeletionTransaction {
    manager: Arc<LogBlockManager>,
    ids: Vec<BlockId>,
}

impl BlockDeletionTransaction {
    pub(crate) fn new(manager: Arc<LogBlockManager>) -> Self {
        Self {
            manager,
            ids: Vec::new(),
        }
    }

    pub fn add_deleted_block(&mut self, id: BlockId) {
        self.ids.push(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn commit(self) -> DeletionOutcome {
        let mut ids = self.ids;
        ids.sort_unstable();
        ids.dedup();

        let (removed, not_found) = self.manager.remove_live_blocks(&ids);

        type Group = (Arc<LogBlockContainer>, Vec<Arc<LogBlock>>);
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        let mut outcome = DeletionOutcome {
            not_found,
            ..Default::default()
        };
        for block in removed {
            match block.container() {
                Some(container) => {
                    groups
                        .entry(container.name().to_owned())
                        .or_insert_with(|| (container, Vec::new()))
                        .1
                        .push(block);
                }
                None => {
                    warn!(
                        target: "cask::transaction",
                        event = "delete_without_container",
                        block_id = %block.id()
                    );
                    outcome.first_error.get_or_insert(CaskError::IllegalState(
                        format!("container for block {} is gone", block.id()),
                    ));
                }
            }
        }

        for (_, (container, blocks)) in groups {
            let records: Vec<BlockRecord> = blocks
                .iter()
                .map(|block| BlockRecord::delete(block.id()))
                .collect();
            let result = container
                .append_records(&records)
                .and_then(|()| container.flush_metadata());
            match result {
                Ok(()) => {
                    let count = blocks.len() as u64;
                    let bytes: u64 = blocks.iter().map(|block| block.length()).sum();
                    container.note_blocks_deleted(count, bytes);
                    for block in &blocks {
                        // Enables the deferred hole punch; fires when the
                        // last reader's reference drops.
                        block.mark_deleted();
                        outcome.deleted.push(block.id());
                    }
                    debug!(
                        target: "cask::transaction",
                        event = "deletion_commit",
                        container = container.name(),
                        blocks = count,
                        bytes
                    );
                }
                Err(err) => {
                    self.manager.notify_disk_failure(container.dir(), &err);
                    outcome.first_error.get_or_insert(err);
                }
            }
        }
        outcome
    }
}
