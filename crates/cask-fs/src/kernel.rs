//! Kernel-release inspection for the historical el6 hole-punch bug.
//!
//! el6 kernels before 2.6.32-674 can corrupt sparse files with a large
//! number of punched holes (the 6.8 update stream carries a backport from
//! 2.6.32-642.15 onward). Callers cap the per-container block count on
//! affected kernels.

use std::fs;

/// The running kernel's release string, e.g. `5.15.0-122-generic`.
#[must_use]
pub fn current_kernel_release() -> Option<String> {
    fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .map(|s| s.trim().to_owned())
}

/// Whether `release` names an el6 kernel affected by the hole-punch bug.
#[must_use]
pub fn is_buggy_el6_kernel(release: &str) -> bool {
    if !release.contains("el6") {
        return false;
    }
    let v = release_numbers(release);
    if cmp(&v, &[2, 6, 32, 674]) != std::cmp::Ordering::Less {
        return false;
    }
    // Fixed in the 6.8 update stream from 2.6.32-642.15 onward.
    if cmp(&v, &[2, 6, 32, 642, 15]) != std::cmp::Ordering::Less
        && cmp(&v, &[2, 6, 32, 643]) == std::cmp::Ordering::Less
    {
        return false;
    }
    true
}

/// Leading numeric components of a release string: `2.6.32-642.13.el6.x86_64`
/// yields `[2, 6, 32, 642, 13]`. Parsing stops at the first non-numeric
/// segment so architecture suffixes do not contribute.
fn release_numbers(release: &str) -> Vec<u64> {
    let mut out = Vec::new();
    for segment in release.split(['.', '-']) {
        match segment.parse::<u64>() {
            Ok(n) => out.push(n),
            Err(_) => break,
        }
    }
    out
}

/// Lexicographic comparison with implicit zero padding of the shorter side.
fn cmp(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
