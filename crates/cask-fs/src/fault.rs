//! Process-global fsync fault injection.
//!
//! Crash-ordering tests need a durable-write failure at a precise point in
//! the commit sequence, which the OS will not provide on demand. Every
//! fsync issued by the engine routes through [`maybe_inject`]; tests arm an
//! injection with [`set_sync_faults`] (skip the first `skip` syncs, fail the
//! next `count`), and the armed faults fire process-wide until exhausted or
//! cleared.
//!
//! Tests that arm faults must not share a process with unrelated tests that
//! sync files; keep them in their own integration-test binary.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

static SKIP: AtomicU32 = AtomicU32::new(0);
static FAIL: AtomicU32 = AtomicU32::new(0);
static ARM_LOCK: Mutex<()> = Mutex::new(());

/// Arm fault injection: let the next `skip` syncs through, then fail the
/// following `count` with `EIO`-style errors.
pub fn set_sync_faults(skip: u32, count: u32) {
    let _guard = ARM_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    SKIP.store(skip, Ordering::SeqCst);
    FAIL.store(count, Ordering::SeqCst);
}

/// Disarm any pending injected faults.
pub fn clear_sync_faults() {
    set_sync_faults(0, 0);
}

/// Number of injected failures still pending.
#[must_use]
pub fn pending_sync_faults() -> u32 {
    FAIL.load(Ordering::SeqCst)
}

pub(crate) fn maybe_inject() -> io::Result<()> {
    if FAIL.load(Ordering::SeqCst) == 0 {
        return Ok(());
    }
    let _guard = ARM_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if FAIL.load(Ordering::SeqCst) == 0 {
        return Ok(());
    }
    if SKIP.load(Ordering::SeqCst) > 0 {
        SKIP.fetch_sub(1, Ordering::SeqCst);
        return Ok(());
    }
    FAIL.fetch_sub(1, Ordering::SeqCst);
    Err(io::Error::new(
        io::ErrorKind::Other,
        "injected sync failure",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_then_fail_then_clear() {
        set_sync_faults(1, 1);
        assert!(maybe_inject().is_ok(), "first sync is skipped");
        assert!(maybe_inject().is_err(), "second sync fails");
        assert!(maybe_inject().is_ok(), "faults exhausted");
        assert_eq!(pending_sync_faults(), 0);

        set_sync_faults(0, 2);
        assert!(maybe_inject().is_err());
        clear_sync_faults();
        assert!(maybe_inject().is_ok());
    }
}
