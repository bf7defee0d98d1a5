//! Data directories and the external placement / failure contracts.
//!
//! The block manager does not own directory enumeration or disk-failure
//! policy: the host provides a [`DirectoryManager`] that maps placement
//! groups to candidate directories and an [`ErrorManager`] that reacts to
//! disk failures. Simple local implementations of both are provided for
//! hosts (and tests) that do not need anything richer.

use cask_error::{CaskError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// One data directory in which containers live.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    fs_block_size: u64,
    failed: AtomicBool,
}

impl DataDir {
    /// Probe `path` and construct the directory descriptor.
    pub fn open(path: impl Into<PathBuf>, block_size_hint: u64) -> Result<Arc<Self>> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(CaskError::IllegalState(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let fs_block_size = cask_fs::fs_block_size(&path, block_size_hint);
        Ok(Arc::new(Self {
            path,
            fs_block_size,
            failed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Alignment unit for block offsets and hole punches in this directory.
    #[must_use]
    pub fn fs_block_size(&self) -> u64 {
        self.fs_block_size
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Take this directory out of service. Idempotent.
    pub fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!(
                target: "cask::dir",
                event = "dir_failed",
                dir = %self.path.display()
            );
        }
    }
}

/// Maps placement groups to the data directories blocks may be placed in.
pub trait DirectoryManager: Send + Sync {
    /// Every directory under management, in a stable order.
    fn data_dirs(&self) -> Vec<Arc<DataDir>>;

    /// Candidate directories for a placement group, best first. `None`
    /// means "no preference".
    fn dirs_for_group(&self, group: Option<&str>) -> Vec<Arc<DataDir>>;
}

/// Round-robin directory manager over a fixed set of local directories,
/// with optional named groups restricted to a subset.
pub struct LocalDirectoryManager {
    dirs: Vec<Arc<DataDir>>,
    groups: Mutex<HashMap<String, Vec<usize>>>,
    next: AtomicUsize,
}

impl LocalDirectoryManager {
    pub fn open(paths: &[PathBuf], block_size_hint: u64) -> Result<Arc<Self>> {
        let mut dirs = Vec::with_capacity(paths.len());
        for path in paths {
            dirs.push(DataDir::open(path.clone(), block_size_hint)?);
        }
        Ok(Arc::new(Self {
            dirs,
            groups: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(0),
        }))
    }

    /// Restrict `group` to the directories at `indices`.
    pub fn set_group(&self, group: impl Into<String>, indices: Vec<usize>) {
        self.groups.lock().insert(group.into(), indices);
    }
}

impl DirectoryManager for LocalDirectoryManager {
    fn data_dirs(&self) -> Vec<Arc<DataDir>> {
        self.dirs.clone()
    }

    fn dirs_for_group(&self, group: Option<&str>) -> Vec<Arc<DataDir>> {
        let indices: Vec<usize> = group
            .and_then(|g| self.groups.lock().get(g).cloned())
            .unwrap_or_else(|| (0..self.dirs.len()).collect());
        if indices.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % indices.len();
        indices
            .iter()
            .cycle()
            .skip(start)
            .take(indices.len())
            .filter_map(|&i| self.dirs.get(i).cloned())
            .collect()
    }
}

/// Receives disk-failure notifications from the engine.
pub trait ErrorManager: Send + Sync {
    fn notify_disk_failure(&self, dir: &Arc<DataDir>, error: &CaskError);
}

/// Default error manager: logs the failure and leaves the directory in
/// service. A single bad commit tombstones only its container; hosts that
/// want whole-disk eviction install their own policy here.
#[derive(Debug, Default)]
pub struct LoggingErrorManager;

impl ErrorManager for LoggingErrorManager {
    fn notify_disk_failure(&self, dir: &Arc<DataDir>, error: &CaskError) {
        error!(
            target: "cask::dir",
            event = "disk_failure",
            dir = %dir.path().display(),
            %error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(DataDir::open(file, 4096).is_err());
    }

    #[test]
    fn probes_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::open(dir.path(), 4096).unwrap();
        assert!(dd.fs_block_size() > 0);
        assert!(!dd.is_failed());
    }

    #[test]
    fn round_robin_rotates_candidates() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mgr = LocalDirectoryManager::open(
            &[a.path().to_owned(), b.path().to_owned()],
            4096,
        )
        .unwrap();

        let first = mgr.dirs_for_group(None);
        let second = mgr.dirs_for_group(None);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0].path(), second[0].path());
    }

    #[test]
    fn groups_restrict_candidates() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mgr = LocalDirectoryManager::open(
            &[a.path().to_owned(), b.path().to_owned()],
            4096,
        )
        .unwrap();
        mgr.set_group("g1", vec![1]);

        let dirs = mgr.dirs_for_group(Some("g1"));
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path(), b.path());
        assert!(mgr.dirs_for_group(Some("unknown")).len() == 2);
    }
}
