//! Filesystem plumbing for the cask block store.
//!
//! Everything here is a thin wrapper over the platform: hole punching via
//! `fallocate(2)`, filesystem block-size and allocated-size probing via
//! `stat(2)` fields, and durable-sync helpers for files and directories.
//!
//! This is the only crate in the workspace allowed to contain `unsafe`; it
//! is limited to the two single-syscall wrappers that have no safe stdlib
//! surface.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::trace;

pub mod fault;
pub mod kernel;

/// Deallocate `[offset, offset + len)` within `file` without changing its
/// length.
///
/// The caller is responsible for aligning the range to the filesystem block
/// size; unaligned punches succeed but only free whole blocks.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    let offset = i64::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "punch offset overflows off_t"))?;
    let len = i64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "punch length overflows off_t"))?;

    // SAFETY: fallocate only touches the open file described by the fd; the
    // fd is valid for the duration of the call because `file` is borrowed.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    trace!(target: "cask::fs", event = "punch_hole", offset, len);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hole punching requires fallocate(2)",
    ))
}

/// The filesystem block size governing allocation at `path`, or `fallback`
/// if it cannot be determined.
#[must_use]
pub fn fs_block_size(path: &Path, fallback: u64) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) if meta.blksize() > 0 => meta.blksize(),
        _ => fallback,
    }
}

/// Bytes actually allocated on disk for `file` (512-byte `st_blocks` units).
///
/// For a sparse file this is smaller than the logical length.
pub fn allocated_bytes(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.blocks().saturating_mul(512))
}

/// Force `file`'s data (and the size metadata needed to read it back) to
/// stable storage.
pub fn sync_file(file: &File) -> io::Result<()> {
    fault::maybe_inject()?;
    file.sync_data()
}

/// Fsync the directory at `path` so recently created or renamed entries
/// survive a crash.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    fault::maybe_inject()?;
    File::open(path)?.sync_all()
}
