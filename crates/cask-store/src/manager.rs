//! The block manager facade.
//!
//! All metadata requests are served from memory: a single map of live
//! blocks, rebuilt at `open` by replaying container metadata logs. One
//! global mutex protects the index and the container pools and is held
//! only for map operations, never across I/O; everything slow happens on
//! container files under their own locks.

use cask_error::{CaskError, Result};
use cask_types::BlockId;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::block::{LogBlock, LogReadableBlock, LogWritableBlock};
use crate::cache::{BasicFileCache, CountingMemTracker, FileCache, MemTracker};
use crate::config::BlockManagerOptions;
use crate::container::{ContainerOpts, LogBlockContainer};
use crate::dir::{DataDir, DirectoryManager, ErrorManager};
use crate::metrics::BlockManagerMetrics;
use crate::oid::ObjectIdGenerator;
use crate::report::FsReport;
use crate::startup::{self, StartupContainer};
use crate::transaction::{BlockCreationTransaction, BlockDeletionTransaction};

/// Hints for placing a new block.
#[derive(Debug, Clone, Default)]
pub struct CreateBlockOptions {
    /// Placement group to draw a data directory from; `None` means any.
    pub placement_group: Option<String>,
}

pub(crate) struct Index {
    pub live_blocks: HashMap<BlockId, Arc<LogBlock>>,
    pub open_writer_ids: HashSet<BlockId>,
    pub all_containers_by_name: HashMap<String, Arc<LogBlockContainer>>,
    pub available_containers_by_dir: HashMap<PathBuf, VecDeque<Arc<LogBlockContainer>>>,
    pub dirty_dirs: HashSet<PathBuf>,
}

/// The log-backed block manager.
pub struct LogBlockManager {
    opts: BlockManagerOptions,
    dir_manager: Arc<dyn DirectoryManager>,
    error_manager: Arc<dyn ErrorManager>,
    file_cache: Arc<dyn FileCache>,
    mem_tracker: Arc<dyn MemTracker>,
    metrics: Arc<BlockManagerMetrics>,
    oid_generator: ObjectIdGenerator,
    next_block_id: AtomicU64,
    buggy_kernel: bool,
    index: Mutex<Index>,
}

impl LogBlockManager {
    /// Construct a manager over the host's directories. Call [`open`] to
    /// load on-disk state before creating or opening blocks.
    ///
    /// [`open`]: LogBlockManager::open
    pub fn new(
        dir_manager: Arc<dyn DirectoryManager>,
        error_manager: Arc<dyn ErrorManager>,
        opts: BlockManagerOptions,
    ) -> Arc<Self> {
        let buggy_kernel = opts.kernel_is_buggy();
        if buggy_kernel {
            info!(
                target: "cask::manager",
                event = "buggy_kernel_detected",
                "applying per-container block limits for hole-punch-unsafe kernel"
            );
        }
        let file_cache = BasicFileCache::new(opts.file_cache_capacity);
        Arc::new(Self {
            opts,
            dir_manager,
            error_manager,
            file_cache,
            mem_tracker: CountingMemTracker::new(),
            metrics: Arc::new(BlockManagerMetrics::default()),
            oid_generator: ObjectIdGenerator::new(),
            next_block_id: AtomicU64::new(1),
            buggy_kernel,
            index: Mutex::new(Index {
                live_blocks: HashMap::new(),
                open_writer_ids: HashSet::new(),
                all_containers_by_name: HashMap::new(),
                available_containers_by_dir: HashMap::new(),
                dirty_dirs: HashSet::new(),
            }),
        })
    }

    /// Scan every data directory, replay container metadata into the live
    /// index, and repair inconsistencies (unless opened read-only).
    pub fn open(self: &Arc<Self>) -> Result<FsReport> {
        startup::open(self)
    }

    /// Lease a container in the requested placement group and hand back a
    /// writable block with a fresh ID.
    pub fn create_block(self: &Arc<Self>, opts: &CreateBlockOptions) -> Result<LogWritableBlock> {
        if self.opts.read_only {
            return Err(CaskError::IllegalState(
                "block manager is open in read-only mode".to_owned(),
            ));
        }
        let candidates = self
            .dir_manager
            .dirs_for_group(opts.placement_group.as_deref());
        let mut last_err: Option<CaskError> = None;
        for dir in candidates.iter().filter(|dir| !dir.is_failed()) {
            match self.get_or_create_container(dir) {
                Ok(container) => {
                    let id = self.gen_block_id();
                    let offset = container.next_offset();
                    return Ok(LogWritableBlock::new(Arc::clone(self), container, id, offset));
                }
                Err(err) => {
                    self.notify_disk_failure(dir, &err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CaskError::NoSpace("no usable data directory in placement group".to_owned())
        }))
    }

    /// A read handle over a live block.
    pub fn open_block(&self, id: BlockId) -> Result<LogReadableBlock> {
        let block = self
            .index
            .lock()
            .live_blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| CaskError::NotFound(format!("block {id}")))?;
        let container = block.container().ok_or_else(|| {
            CaskError::IllegalState(format!("container for block {id} is gone"))
        })?;
        let file = self.file_cache.read_handle(&container.data_path())?;
        Ok(LogReadableBlock::new(block, file))
    }

    #[must_use]
    pub fn new_creation_transaction(self: &Arc<Self>) -> BlockCreationTransaction {
        BlockCreationTransaction::new(Arc::clone(self))
    }

    #[must_use]
    pub fn new_deletion_transaction(self: &Arc<Self>) -> BlockDeletionTransaction {
        BlockDeletionTransaction::new(Arc::clone(self))
    }

    /// Snapshot of all live block IDs.
    #[must_use]
    pub fn all_block_ids(&self) -> Vec<BlockId> {
        self.index.lock().live_blocks.keys().copied().collect()
    }

    /// Advance the ID generator past an externally assigned ID. The
    /// generator never regresses.
    pub fn notify_block_id(&self, id: BlockId) {
        self.next_block_id
            .fetch_max(id.get().saturating_add(1), Ordering::SeqCst);
    }

    /// Claim `id` for a new writer. Returns false if the ID is already
    /// live or leased to another writer.
    pub fn try_use_block_id(&self, id: BlockId) -> bool {
        if id.is_unset() {
            return false;
        }
        let mut index = self.index.lock();
        if index.live_blocks.contains_key(&id) {
            return false;
        }
        index.open_writer_ids.insert(id)
    }

    #[must_use]
    pub fn metrics(&self) -> &BlockManagerMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn mem_tracker(&self) -> &Arc<dyn MemTracker> {
        &self.mem_tracker
    }

    pub(crate) fn options(&self) -> &BlockManagerOptions {
        &self.opts
    }

    pub(crate) fn dir_manager(&self) -> &Arc<dyn DirectoryManager> {
        &self.dir_manager
    }

    pub(crate) fn metrics_arc(&self) -> Arc<BlockManagerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn buggy_kernel(&self) -> bool {
        self.buggy_kernel
    }

    /// Route an error to the host's disk-failure handler if it is one.
    pub(crate) fn notify_disk_failure(&self, dir: &Arc<DataDir>, error: &CaskError) {
        if error.is_disk_failure() {
            self.error_manager.notify_disk_failure(dir, error);
        }
    }

    pub(crate) fn release_block_id(&self, id: BlockId) {
        self.index.lock().open_writer_ids.remove(&id);
    }

    fn gen_block_id(&self) -> BlockId {
        loop {
            let raw = self.next_block_id.fetch_add(1, Ordering::SeqCst);
            if raw == 0 {
                continue;
            }
            let id = BlockId::new(raw);
            if self.try_use_block_id(id) {
                return id;
            }
        }
    }

    /// Lease a container for writing: most-recently-returned first, falling
    /// back to creating a fresh one.
    fn get_or_create_container(
        self: &Arc<Self>,
        dir: &Arc<DataDir>,
    ) -> Result<Arc<LogBlockContainer>> {
        loop {
            let popped = {
                let mut index = self.index.lock();
                index
                    .available_containers_by_dir
                    .get_mut(dir.path())
                    .and_then(VecDeque::pop_back)
            };
            match popped {
                Some(container) if container.is_available() => return Ok(container),
                Some(_) => continue, // full or tombstoned while pooled
                None => break,
            }
        }

        let container_opts = ContainerOpts {
            max_size: self.opts.max_container_size,
            block_limit: self
                .opts
                .block_limit_for(self.buggy_kernel, dir.fs_block_size()),
            hole_punch_enabled: self.opts.hole_punch_enabled,
            read_only_mode: false,
        };
        let mut attempts = 0_u32;
        let container = loop {
            let name = self.oid_generator.next_id();
            match LogBlockContainer::create(
                Arc::clone(dir),
                name,
                container_opts,
                self.metrics_arc(),
            ) {
                Ok(container) => break container,
                Err(CaskError::DiskFailure(err))
                    if err.kind() == ErrorKind::AlreadyExists && attempts < 3 =>
                {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let mut index = self.index.lock();
        index
            .all_containers_by_name
            .insert(container.name().to_owned(), Arc::clone(&container));
        index.dirty_dirs.insert(dir.path().to_owned());
        Ok(container)
    }

    /// Return a leased container to its directory's pool. Full or
    /// tombstoned containers are dropped instead.
    pub(crate) fn make_container_available(&self, container: &Arc<LogBlockContainer>) {
        if !container.is_available() {
            return;
        }
        let mut index = self.index.lock();
        index
            .available_containers_by_dir
            .entry(container.dir().path().to_owned())
            .or_default()
            .push_back(Arc::clone(container));
    }

    /// Fsync the container's directory if it still has unsynced file
    /// creations, so the container files themselves survive a crash.
    pub(crate) fn sync_container_dir(&self, container: &LogBlockContainer) -> Result<()> {
        let dir_path = container.dir().path();
        let needs_sync = self.index.lock().dirty_dirs.contains(dir_path);
        if !needs_sync {
            return Ok(());
        }
        cask_fs::sync_dir(dir_path)?;
        self.index.lock().dirty_dirs.remove(dir_path);
        Ok(())
    }

    /// Move committed blocks from the open-writer set into the live index.
    ///
    /// ID discipline makes a collision here unreachable; if one happens
    /// anyway, the existing live block wins, the rest of the batch still
    /// installs, and `AlreadyPresent` is returned.
    pub(crate) fn install_blocks(
        &self,
        container: &Arc<LogBlockContainer>,
        blocks: &[LogWritableBlock],
    ) -> Result<()> {
        let mut first_error = None;
        let mut index = self.index.lock();
        for block in blocks {
            index.open_writer_ids.remove(&block.id());
            let descriptor = LogBlock::new(
                container,
                block.id(),
                block.offset(),
                block.bytes_appended(),
                Arc::clone(&self.mem_tracker),
            );
            match index.live_blocks.entry(block.id()) {
                Entry::Vacant(slot) => {
                    slot.insert(descriptor);
                    self.metrics.block_added(block.bytes_appended());
                }
                Entry::Occupied(_) => {
                    error!(
                        target: "cask::manager",
                        event = "duplicate_block_on_install",
                        block_id = %block.id(),
                        container = container.name()
                    );
                    first_error
                        .get_or_insert_with(|| CaskError::AlreadyPresent(block.id().to_string()));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop `ids` from the live index, returning the removed descriptors
    /// and the IDs that were not live.
    pub(crate) fn remove_live_blocks(
        &self,
        ids: &[BlockId],
    ) -> (Vec<Arc<LogBlock>>, Vec<BlockId>) {
        let mut removed = Vec::new();
        let mut not_found = Vec::new();
        let mut index = self.index.lock();
        for id in ids {
            match index.live_blocks.remove(id) {
                Some(block) => {
                    self.metrics.block_removed(block.length());
                    removed.push(block);
                }
                None => not_found.push(*id),
            }
        }
        (removed, not_found)
    }

    /// Publish one scanned directory's containers and live blocks into the
    /// index. Fails without publishing anything if a block ID collides
    /// with another container (cross-container duplicates are fatal for
    /// the directory).
    pub(crate) fn publish_dir(&self, loaded: Vec<StartupContainer>) -> Result<(u64, u64)> {
        let availability: Vec<bool> = loaded
            .iter()
            .map(|entry| entry.container.is_available())
            .collect();

        let mut index = self.index.lock();
        let mut seen = HashSet::new();
        for entry in &loaded {
            for record in &entry.live {
                if index.live_blocks.contains_key(&record.block_id)
                    || !seen.insert(record.block_id)
                {
                    return Err(CaskError::Corruption {
                        container: entry.container.name().to_owned(),
                        detail: format!("duplicate block ID {} across containers", record.block_id),
                    });
                }
            }
        }

        let mut live_blocks = 0_u64;
        let mut live_bytes = 0_u64;
        let mut max_id = 0_u64;
        for (entry, available) in loaded.into_iter().zip(availability) {
            index
                .all_containers_by_name
                .insert(entry.container.name().to_owned(), Arc::clone(&entry.container));
            for record in &entry.live {
                let length = record.length as u64;
                let descriptor = LogBlock::new(
                    &entry.container,
                    record.block_id,
                    record.offset as u64,
                    length,
                    Arc::clone(&self.mem_tracker),
                );
                index.live_blocks.insert(record.block_id, descriptor);
                self.metrics.block_added(length);
                live_blocks += 1;
                live_bytes += length;
                max_id = max_id.max(record.block_id.get());
            }
            if available {
                index
                    .available_containers_by_dir
                    .entry(entry.container.dir().path().to_owned())
                    .or_default()
                    .push_back(entry.container);
            }
        }
        drop(index);

        self.next_block_id
            .fetch_max(max_id.saturating_add(1), Ordering::SeqCst);
        Ok((live_blocks, live_bytes))
    }
}

impl std::fmt::Debug for LogBlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBlockManager")
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{LocalDirectoryManager, LoggingErrorManager};

    fn test_manager(paths: &[PathBuf]) -> Arc<LogBlockManager> {
        let dirs = LocalDirectoryManager::open(paths, 4096).unwrap();
        LogBlockManager::new(
            dirs,
            Arc::new(LoggingErrorManager),
            BlockManagerOptions::default(),
        )
    }

    #[test]
    fn try_use_block_id_blocks_collisions() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(&[tmp.path().to_owned()]);

        assert!(!manager.try_use_block_id(BlockId::UNSET));
        assert!(manager.try_use_block_id(BlockId::new(7)));
        assert!(!manager.try_use_block_id(BlockId::new(7)));
        manager.release_block_id(BlockId::new(7));
        assert!(manager.try_use_block_id(BlockId::new(7)));
    }

    #[test]
    fn notify_block_id_never_regresses() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(&[tmp.path().to_owned()]);

        manager.notify_block_id(BlockId::new(100));
        manager.notify_block_id(BlockId::new(5));
        let id = manager.gen_block_id();
        assert!(id.get() > 100, "generator skipped past notified ID, got {id}");
    }

    #[test]
    fn create_block_requires_writable_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = LocalDirectoryManager::open(&[tmp.path().to_owned()], 4096).unwrap();
        let manager = LogBlockManager::new(
            dirs,
            Arc::new(LoggingErrorManager),
            BlockManagerOptions {
                read_only: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            manager.create_block(&CreateBlockOptions::default()),
            Err(CaskError::IllegalState(_))
        ));
    }
}
