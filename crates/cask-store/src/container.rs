//! Container runtime object.
//!
//! A container is a pair of append-only files: `<base>.data` holds block
//! payloads at filesystem-block-aligned offsets, `<base>.metadata` is the
//! record log. The container serializes metadata appends and cursor motion
//! under its own lock; block payload writes go straight to the data file
//! with positional I/O and may run concurrently with each other and with
//! another writer's commit-time fsync.
//!
//! Once an I/O error tombstones a container it accepts no further writes,
//! but blocks already committed to it remain readable.

use cask_error::{CaskError, Result};
use cask_ondisk::BlockRecord;
use cask_types::align_up;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dir::DataDir;
use crate::metrics::BlockManagerMetrics;

/// Per-container policy derived from the manager options at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContainerOpts {
    pub max_size: u64,
    pub block_limit: Option<u64>,
    pub hole_punch_enabled: bool,
    pub read_only_mode: bool,
}

/// Replayed state handed to [`LogBlockContainer::load`] by startup.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LoadedContainerState {
    pub next_offset: u64,
    pub data_len: u64,
    pub metadata_len: u64,
    pub total_blocks: u64,
    pub live_blocks: u64,
    pub live_bytes: u64,
}

struct ContainerState {
    metadata_file: File,
    /// Reserved write cursor; always filesystem-block-aligned.
    next_offset: u64,
    /// Length the data file has actually been extended to (at most
    /// `next_offset`).
    data_len: u64,
    metadata_len: u64,
    metadata_dirty: bool,
    /// CREATE records ever written, live or not. Bounded on buggy kernels.
    total_blocks: u64,
    live_blocks: u64,
    live_bytes: u64,
    read_only_reason: Option<String>,
    full: bool,
}

pub struct LogBlockContainer {
    dir: Arc<DataDir>,
    name: String,
    data_file: Arc<File>,
    fs_block_size: u64,
    opts: ContainerOpts,
    data_dirty: AtomicBool,
    state: Mutex<ContainerState>,
    metrics: Arc<BlockManagerMetrics>,
}

impl LogBlockContainer {
    /// Create a fresh container under `dir`. Fails with `AlreadyExists` if
    /// either file name is taken; the caller retries with a new base name.
    pub(crate) fn create(
        dir: Arc<DataDir>,
        name: String,
        opts: ContainerOpts,
        metrics: Arc<BlockManagerMetrics>,
    ) -> Result<Arc<Self>> {
        let data_path = cask_ondisk::data_path(dir.path(), &name);
        let metadata_path = cask_ondisk::metadata_path(dir.path(), &name);

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)?;
        let metadata_file = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&metadata_path)
        {
            Ok(file) => file,
            Err(err) => {
                // Don't leave a half-created container behind.
                let _ = std::fs::remove_file(&data_path);
                return Err(err.into());
            }
        };

        debug!(
            target: "cask::container",
            event = "container_created",
            container = %name,
            dir = %dir.path().display()
        );
        metrics.container_added();

        let fs_block_size = dir.fs_block_size();
        Ok(Arc::new(Self {
            dir,
            name,
            data_file: Arc::new(data_file),
            fs_block_size,
            opts,
            data_dirty: AtomicBool::new(false),
            state: Mutex::new(ContainerState {
                metadata_file,
                next_offset: 0,
                data_len: 0,
                metadata_len: 0,
                metadata_dirty: false,
                total_blocks: 0,
                live_blocks: 0,
                live_bytes: 0,
                read_only_reason: None,
                full: false,
            }),
            metrics,
        }))
    }

    /// Open an existing container with state reconstructed by startup
    /// replay.
    pub(crate) fn load(
        dir: Arc<DataDir>,
        name: String,
        opts: ContainerOpts,
        metrics: Arc<BlockManagerMetrics>,
        loaded: LoadedContainerState,
    ) -> Result<Arc<Self>> {
        let data_path = cask_ondisk::data_path(dir.path(), &name);
        let metadata_path = cask_ondisk::metadata_path(dir.path(), &name);

        let (data_file, metadata_file) = if opts.read_only_mode {
            (
                File::open(&data_path)?,
                OpenOptions::new().read(true).open(&metadata_path)?,
            )
        } else {
            (
                OpenOptions::new().read(true).write(true).open(&data_path)?,
                OpenOptions::new().append(true).open(&metadata_path)?,
            )
        };

        let fs_block_size = dir.fs_block_size();
        let full = loaded.next_offset >= opts.max_size
            || opts
                .block_limit
                .is_some_and(|limit| loaded.total_blocks >= limit);
        metrics.container_added();
        if full {
            metrics.container_full();
        }

        Ok(Arc::new(Self {
            dir,
            name,
            data_file: Arc::new(data_file),
            fs_block_size,
            opts,
            data_dirty: AtomicBool::new(false),
            state: Mutex::new(ContainerState {
                metadata_file,
                next_offset: loaded.next_offset,
                data_len: loaded.data_len,
                metadata_len: loaded.metadata_len,
                metadata_dirty: false,
                total_blocks: loaded.total_blocks,
                live_blocks: loaded.live_blocks,
                live_bytes: loaded.live_bytes,
                read_only_reason: if opts.read_only_mode {
                    Some("block manager opened read-only".to_owned())
                } else {
                    None
                },
                full,
            }),
            metrics,
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Arc<DataDir> {
        &self.dir
    }

    #[must_use]
    pub fn fs_block_size(&self) -> u64 {
        self.fs_block_size
    }

    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        cask_ondisk::data_path(self.dir.path(), &self.name)
    }

    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        cask_ondisk::metadata_path(self.dir.path(), &self.name)
    }

    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.state.lock().next_offset
    }

    #[must_use]
    pub fn live_blocks(&self) -> u64 {
        self.state.lock().live_blocks
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    #[must_use]
    pub fn read_only_reason(&self) -> Option<String> {
        self.state.lock().read_only_reason.clone()
    }

    #[must_use]
    pub(crate) fn hole_punch_enabled(&self) -> bool {
        self.opts.hole_punch_enabled
    }

    /// Whether the container may be handed to another writer.
    #[must_use]
    pub(crate) fn is_available(&self) -> bool {
        let state = self.state.lock();
        !state.full && state.read_only_reason.is_none()
    }

    pub(crate) fn metadata_len(&self) -> u64 {
        self.state.lock().metadata_len
    }

    /// Advance the write cursor by the aligned length and return the extent's
    /// offset. Exactly one writer (the lease holder) calls this at a time.
    ///
    /// The data file is extended to the aligned end so its length always
    /// matches the cursor after a finalize; the pad bytes read back as
    /// zeros and are reclaimable by a hole punch covering the extent.
    pub(crate) fn reserve(&self, length: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.read_only_reason {
            return Err(CaskError::ContainerReadOnly {
                container: self.name.clone(),
                reason: reason.clone(),
            });
        }
        if state.full {
            return Err(CaskError::ContainerFull(self.name.clone()));
        }

        let offset = state.next_offset;
        let aligned = align_up(length, self.fs_block_size);
        let end = offset.saturating_add(aligned);
        if end > state.data_len {
            if let Err(err) = self.data_file.set_len(end) {
                let err = CaskError::from(err);
                Self::tombstone_locked(&mut state, &self.name, &err);
                return Err(err);
            }
            state.data_len = end;
        }
        state.next_offset = end;
        state.total_blocks += 1;

        let size_capped = state.next_offset >= self.opts.max_size;
        let count_capped = self
            .opts
            .block_limit
            .is_some_and(|limit| state.total_blocks >= limit);
        if (size_capped || count_capped) && !state.full {
            state.full = true;
            self.metrics.container_full();
            debug!(
                target: "cask::container",
                event = "container_full",
                container = %self.name,
                next_offset = state.next_offset,
                total_blocks = state.total_blocks
            );
        }
        Ok(offset)
    }

    /// Positional write into the data file. Concurrent calls for different
    /// extents are safe; the caller guarantees extents never overlap.
    pub(crate) fn write_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        {
            let state = self.state.lock();
            if let Some(reason) = &state.read_only_reason {
                return Err(CaskError::ContainerReadOnly {
                    container: self.name.clone(),
                    reason: reason.clone(),
                });
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.data_file.write_all_at(data, offset) {
            let err = CaskError::from(err);
            self.mark_read_only(&err.to_string());
            return Err(err);
        }
        self.data_dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Read part of a block's payload straight from the container's own
    /// handle.
    pub(crate) fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.data_file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Force buffered data-file writes to stable storage.
    pub(crate) fn flush_data(&self) -> Result<()> {
        if !self.data_dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = cask_fs::sync_file(&self.data_file) {
            let err = CaskError::from(err);
            self.mark_read_only(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Append framed records to the metadata log. All-or-nothing: a failed
    /// write is rolled back by truncating to the prior length.
    pub(crate) fn append_records(&self, records: &[BlockRecord]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.read_only_reason {
            return Err(CaskError::ContainerReadOnly {
                container: self.name.clone(),
                reason: reason.clone(),
            });
        }

        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.encode_frame());
        }
        let prior_len = state.metadata_len;
        if let Err(err) = (&state.metadata_file).write_all(&buf) {
            let err = CaskError::from(err);
            if let Err(trunc_err) = state.metadata_file.set_len(prior_len) {
                warn!(
                    target: "cask::container",
                    event = "metadata_rollback_failed",
                    container = %self.name,
                    error = %trunc_err
                );
            }
            Self::tombstone_locked(&mut state, &self.name, &err);
            return Err(err);
        }
        state.metadata_len = prior_len + buf.len() as u64;
        state.metadata_dirty = true;
        Ok(())
    }

    /// Fsync the metadata log if it has unsynced appends. Serialized on the
    /// container lock, so commits to the same container queue up here.
    pub(crate) fn flush_metadata(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.metadata_dirty {
            return Ok(());
        }
        if let Err(err) = cask_fs::sync_file(&state.metadata_file) {
            let err = CaskError::from(err);
            Self::tombstone_locked(&mut state, &self.name, &err);
            return Err(err);
        }
        state.metadata_dirty = false;
        Ok(())
    }

    /// Best-effort rollback of the metadata log to `len` after a failed
    /// flush, so a clean restart does not resurrect records whose commit
    /// was reported as failed.
    pub(crate) fn truncate_metadata_to(&self, len: u64) {
        let mut state = self.state.lock();
        match state.metadata_file.set_len(len) {
            Ok(()) => {
                state.metadata_len = len;
                state.metadata_dirty = false;
            }
            Err(err) => warn!(
                target: "cask::container",
                event = "metadata_rollback_failed",
                container = %self.name,
                error = %err
            ),
        }
    }

    /// Tombstone the container: no further writes are accepted and it is
    /// dropped from the available pool on the next touch. Idempotent.
    pub(crate) fn mark_read_only(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.read_only_reason.is_some() {
            return;
        }
        state.read_only_reason = Some(reason.to_owned());
        warn!(
            target: "cask::container",
            event = "container_read_only",
            container = %self.name,
            reason
        );
    }

    fn tombstone_locked(state: &mut ContainerState, name: &str, error: &CaskError) {
        if state.read_only_reason.is_none() {
            state.read_only_reason = Some(error.to_string());
            warn!(
                target: "cask::container",
                event = "container_read_only",
                container = %name,
                reason = %error
            );
        }
    }

    /// Account for freshly committed live blocks.
    pub(crate) fn note_blocks_committed(&self, count: u64, bytes: u64) {
        let mut state = self.state.lock();
        state.live_blocks += count;
        state.live_bytes += bytes;
    }

    /// Account for durably deleted blocks.
    pub(crate) fn note_blocks_deleted(&self, count: u64, bytes: u64) {
        let mut state = self.state.lock();
        state.live_blocks = state.live_blocks.saturating_sub(count);
        state.live_bytes = state.live_bytes.saturating_sub(bytes);
    }

    /// Punch out a deleted block's extent, rounded up to the filesystem
    /// block size. Best-effort: on failure the space is reclaimed by the
    /// next startup's re-punch pass.
    pub(crate) fn punch_extent(&self, offset: u64, length: u64) {
        let aligned = align_up(length, self.fs_block_size);
        if aligned == 0 {
            return;
        }
        match cask_fs::punch_hole(&self.data_file, offset, aligned) {
            Ok(()) => self.metrics.hole_punched(),
            Err(err) => warn!(
                target: "cask::container",
                event = "hole_punch_failed",
                container = %self.name,
                offset,
                length = aligned,
                error = %err
            ),
        }
    }
}

impl std::fmt::Debug for LogBlockContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogBlockContainer")
            .field("name", &self.name)
            .field("next_offset", &state.next_offset)
            .field("live_blocks", &state.live_blocks)
            .field("full", &state.full)
            .field("read_only", &state.read_only_reason.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BlockManagerMetrics;
    use cask_types::BlockId;

    fn test_container(dir: &Arc<DataDir>, opts: ContainerOpts) -> Arc<LogBlockContainer> {
        LogBlockContainer::create(
            Arc::clone(dir),
            "testcontainer".to_owned(),
            opts,
            Arc::new(BlockManagerMetrics::default()),
        )
        .unwrap()
    }

    fn default_opts() -> ContainerOpts {
        ContainerOpts {
            max_size: 10 * 1024 * 1024,
            block_limit: None,
            hole_punch_enabled: false,
            read_only_mode: false,
        }
    }

    #[test]
    fn reserve_aligns_and_extends() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let fsb = dir.fs_block_size();
        let container = test_container(&dir, default_opts());

        container.write_data(0, b"hello").unwrap();
        let offset = container.reserve(5).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(container.next_offset(), fsb);
        assert_eq!(
            std::fs::metadata(container.data_path()).unwrap().len(),
            fsb,
            "data file is extended to the aligned cursor"
        );

        let offset = container.reserve(fsb + 1).unwrap();
        assert_eq!(offset, fsb);
        assert_eq!(container.next_offset(), 3 * fsb);
    }

    #[test]
    fn zero_length_blocks_share_an_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let container = test_container(&dir, default_opts());

        assert_eq!(container.reserve(0).unwrap(), 0);
        assert_eq!(container.reserve(0).unwrap(), 0);
        assert_eq!(container.next_offset(), 0);
    }

    #[test]
    fn size_cap_marks_full() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let fsb = dir.fs_block_size();
        let container = test_container(
            &dir,
            ContainerOpts {
                max_size: fsb,
                ..default_opts()
            },
        );

        assert!(!container.is_full());
        container.reserve(1).unwrap();
        assert!(container.is_full());
        assert!(matches!(
            container.reserve(1),
            Err(CaskError::ContainerFull(_))
        ));
        assert!(!container.is_available());
    }

    #[test]
    fn block_limit_marks_full() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let container = test_container(
            &dir,
            ContainerOpts {
                block_limit: Some(2),
                ..default_opts()
            },
        );

        container.reserve(1).unwrap();
        assert!(!container.is_full());
        container.reserve(1).unwrap();
        assert!(container.is_full());
    }

    #[test]
    fn read_only_rejects_writes_but_not_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let container = test_container(&dir, default_opts());

        container.write_data(0, b"payload").unwrap();
        container.reserve(7).unwrap();
        container.mark_read_only("test tombstone");
        container.mark_read_only("second reason is ignored");

        assert!(matches!(
            container.reserve(1),
            Err(CaskError::ContainerReadOnly { .. })
        ));
        assert!(matches!(
            container.write_data(0, b"x"),
            Err(CaskError::ContainerReadOnly { .. })
        ));
        assert_eq!(
            container.read_only_reason().as_deref(),
            Some("test tombstone")
        );

        let mut buf = [0_u8; 7];
        container.read_data(0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn append_records_round_trips_through_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let container = test_container(&dir, default_opts());

        let records = vec![
            BlockRecord::create(BlockId::new(1), 0, 100),
            BlockRecord::create(BlockId::new(2), 4096, 50),
            BlockRecord::delete(BlockId::new(1)),
        ];
        container.append_records(&records).unwrap();
        container.flush_metadata().unwrap();

        let bytes = std::fs::read(container.metadata_path()).unwrap();
        let replayed = cask_ondisk::replay_log(&bytes);
        assert_eq!(replayed.records, records);
        assert!(replayed.defect.is_none());
        assert_eq!(container.metadata_len(), bytes.len() as u64);
    }

    #[test]
    fn truncate_metadata_rolls_back_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), 4096).unwrap();
        let container = test_container(&dir, default_opts());

        container
            .append_records(&[BlockRecord::create(BlockId::new(1), 0, 10)])
            .unwrap();
        let keep = container.metadata_len();
        container
            .append_records(&[BlockRecord::create(BlockId::new(2), 4096, 10)])
            .unwrap();
        container.truncate_metadata_to(keep);

        let bytes = std::fs::read(container.metadata_path()).unwrap();
        let replayed = cask_ondisk::replay_log(&bytes);
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.records[0].block_id, BlockId::new(1));
    }
}
