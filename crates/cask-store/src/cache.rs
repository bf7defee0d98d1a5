//! Read-handle caching and index memory accounting contracts.

use cask_error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded cache of read-only file handles, keyed by path.
///
/// The engine only ever asks for a handle by path and drops it when done;
/// ownership of the cache and its eviction policy belong to the host.
pub trait FileCache: Send + Sync {
    /// A shared read-only handle for `path`, opening it if necessary.
    fn read_handle(&self, path: &Path) -> Result<Arc<File>>;

    /// Drop any cached handle for `path` (the file is being deleted or
    /// replaced).
    fn invalidate(&self, path: &Path);
}

struct BasicFileCacheInner {
    handles: HashMap<PathBuf, Arc<File>>,
    order: VecDeque<PathBuf>,
}

/// FIFO-bounded [`FileCache`] good enough for hosts without a process-wide
/// descriptor budget.
pub struct BasicFileCache {
    capacity: usize,
    inner: Mutex<BasicFileCacheInner>,
}

impl BasicFileCache {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BasicFileCacheInner {
                handles: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }
}

impl FileCache for BasicFileCache {
    fn read_handle(&self, path: &Path) -> Result<Arc<File>> {
        if let Some(handle) = self.inner.lock().handles.get(path) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(File::open(path)?);
        let mut inner = self.inner.lock();
        // A racing open may have beaten us; keep whichever is present.
        if let Some(existing) = inner.handles.get(path) {
            return Ok(Arc::clone(existing));
        }
        while inner.handles.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.handles.remove(&old);
                }
                None => break,
            }
        }
        inner.handles.insert(path.to_owned(), Arc::clone(&handle));
        inner.order.push_back(path.to_owned());
        Ok(handle)
    }

    fn invalidate(&self, path: &Path) {
        let mut inner = self.inner.lock();
        inner.handles.remove(path);
        inner.order.retain(|p| p != path);
    }
}

/// Memory-accounting hook for index entries.
pub trait MemTracker: Send + Sync {
    fn consume(&self, bytes: u64);
    fn release(&self, bytes: u64);
    fn consumed(&self) -> u64;
}

/// Default [`MemTracker`]: a plain counter.
#[derive(Debug, Default)]
pub struct CountingMemTracker {
    consumed: AtomicU64,
}

impl CountingMemTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MemTracker for CountingMemTracker {
    fn consume(&self, bytes: u64) {
        self.consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    fn release(&self, bytes: u64) {
        self.consumed.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn caches_and_evicts_handles() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("f{i}"));
            std::fs::File::create(&path)
                .unwrap()
                .write_all(b"x")
                .unwrap();
            paths.push(path);
        }

        let cache = BasicFileCache::new(2);
        let first = cache.read_handle(&paths[0]).unwrap();
        let again = cache.read_handle(&paths[0]).unwrap();
        assert!(Arc::ptr_eq(&first, &again), "handle is shared while cached");

        cache.read_handle(&paths[1]).unwrap();
        cache.read_handle(&paths[2]).unwrap(); // evicts paths[0]
        let reopened = cache.read_handle(&paths[0]).unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
    }

    #[test]
    fn invalidate_drops_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let cache = BasicFileCache::new(4);
        let first = cache.read_handle(&path).unwrap();
        cache.invalidate(&path);
        let second = cache.read_handle(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn mem_tracker_counts() {
        let tracker = CountingMemTracker::new();
        tracker.consume(100);
        tracker.consume(50);
        tracker.release(30);
        assert_eq!(tracker.consumed(), 120);
    }
}
