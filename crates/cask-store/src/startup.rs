//! Startup: directory scan, metadata replay, and repair.
//!
//! Directories open in parallel; each worker replays every container's
//! metadata log, classifies inconsistencies, repairs what is repairable
//! (unless the manager is read-only), and hands back runtime containers
//! plus their live records. Per-directory failure never blocks the other
//! directories; a directory with a fatal inconsistency is failed and the
//! rest of the store stays usable.

use cask_error::{CaskError, Result};
use cask_ondisk::BlockRecord;
use cask_types::{align_up, is_aligned, BlockId};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

use crate::container::{ContainerOpts, LoadedContainerState, LogBlockContainer};
use crate::dir::DataDir;
use crate::latch::CountDownLatch;
use crate::manager::LogBlockManager;
use crate::report::{
    CorruptionReport, FsReport, IncompleteContainerReport, MalformedRecordReport,
    MisalignedBlockReport, PartialRecordReport,
};

/// A scanned container ready to publish: the runtime object plus the
/// CREATE records that survived replay.
pub(crate) struct StartupContainer {
    pub container: Arc<LogBlockContainer>,
    pub live: Vec<BlockRecord>,
}

struct DirOutcome {
    dir: Arc<DataDir>,
    containers: Vec<StartupContainer>,
    report: FsReport,
    fatal: Option<CaskError>,
}

/// Open every data directory and populate the manager's index.
pub(crate) fn open(manager: &Arc<LogBlockManager>) -> Result<FsReport> {
    let dirs = manager.dir_manager().data_dirs();
    if dirs.is_empty() {
        return Err(CaskError::NoSpace(
            "no data directories configured".to_owned(),
        ));
    }

    let latch = CountDownLatch::new(dirs.len() as u64);
    let outcomes: Vec<DirOutcome> = thread::scope(|scope| {
        let handles: Vec<_> = dirs
            .iter()
            .map(|dir| {
                let latch = &latch;
                scope.spawn(move || {
                    let outcome = scan_data_dir(manager, dir);
                    latch.count_down();
                    outcome
                })
            })
            .collect();
        latch.wait();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("startup scan worker panicked"))
            .collect()
    });

    let mut report = FsReport::default();
    let mut first_error: Option<CaskError> = None;
    let mut usable_dirs = 0_usize;

    for outcome in outcomes {
        report.merge(outcome.report);
        if let Some(err) = outcome.fatal {
            fail_dir(manager, &outcome.dir, &err, &mut report);
            first_error.get_or_insert(err);
            continue;
        }
        match manager.publish_dir(outcome.containers) {
            Ok((live_blocks, live_bytes)) => {
                report.stats.live_blocks += live_blocks;
                report.stats.live_bytes += live_bytes;
                usable_dirs += 1;
            }
            Err(err) => {
                if let CaskError::Corruption { container, detail } = &err {
                    report.corruptions.push(CorruptionReport {
                        container: container.clone(),
                        detail: detail.clone(),
                    });
                }
                fail_dir(manager, &outcome.dir, &err, &mut report);
                first_error.get_or_insert(err);
            }
        }
    }

    if usable_dirs == 0 {
        return Err(first_error
            .unwrap_or_else(|| CaskError::NoSpace("all data directories failed".to_owned())));
    }

    info!(target: "cask::startup", event = "open_complete", %report);
    Ok(report)
}

fn fail_dir(
    manager: &Arc<LogBlockManager>,
    dir: &Arc<DataDir>,
    err: &CaskError,
    report: &mut FsReport,
) {
    error!(
        target: "cask::startup",
        event = "dir_failed",
        dir = %dir.path().display(),
        error = %err
    );
    report.stats.failed_data_dirs += 1;
    report.failed_dirs.push(dir.path().to_owned());
    dir.mark_failed();
    manager.notify_disk_failure(dir, err);
}

fn scan_data_dir(manager: &Arc<LogBlockManager>, dir: &Arc<DataDir>) -> DirOutcome {
    let repair = !manager.options().read_only;
    let mut report = FsReport::default();
    report.stats.data_dirs = 1;
    let mut containers = Vec::new();

    let fatal = |report: FsReport, err: CaskError| DirOutcome {
        dir: Arc::clone(dir),
        containers: Vec::new(),
        report,
        fatal: Some(err),
    };

    let entries = match std::fs::read_dir(dir.path()) {
        Ok(entries) => entries,
        Err(err) => return fatal(report, err.into()),
    };

    let mut metadata_bases = BTreeSet::new();
    let mut data_bases = BTreeSet::new();
    let mut tmp_files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => return fatal(report, err.into()),
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match cask_ondisk::parse_file_name(name) {
            Some((base, cask_ondisk::ContainerFileKind::Metadata)) => {
                metadata_bases.insert(base.to_owned());
            }
            Some((base, cask_ondisk::ContainerFileKind::Data)) => {
                data_bases.insert(base.to_owned());
            }
            Some((_, cask_ondisk::ContainerFileKind::Tmp)) => tmp_files.push(entry.path()),
            None => {} // not ours
        }
    }

    if repair {
        for tmp in tmp_files {
            match std::fs::remove_file(&tmp) {
                Ok(()) => {
                    report.repairs.tmp_files_deleted += 1;
                    info!(
                        target: "cask::startup",
                        event = "tmp_file_deleted",
                        path = %tmp.display()
                    );
                }
                Err(err) => warn!(
                    target: "cask::startup",
                    event = "tmp_file_delete_failed",
                    path = %tmp.display(),
                    error = %err
                ),
            }
        }
    }

    for base in data_bases.difference(&metadata_bases) {
        report.incomplete_containers.push(IncompleteContainerReport {
            container: base.clone(),
            reason: "missing metadata file".to_owned(),
        });
        if repair {
            match std::fs::remove_file(cask_ondisk::data_path(dir.path(), base)) {
                Ok(()) => report.repairs.incomplete_containers_deleted += 1,
                Err(err) => warn!(
                    target: "cask::startup",
                    event = "incomplete_container_delete_failed",
                    container = %base,
                    error = %err
                ),
            }
        }
    }

    for base in &metadata_bases {
        match scan_container(manager, dir, base, &mut report, repair) {
            Ok(Some(container)) => containers.push(container),
            Ok(None) => {}
            Err(err) => return fatal(report, err),
        }
    }

    DirOutcome {
        dir: Arc::clone(dir),
        containers,
        report,
        fatal: None,
    }
}

/// Replay one container's metadata, repair it, and build its runtime
/// object. `Ok(None)` means the container no longer exists (incomplete or
/// dead and deleted); `Err` is fatal for the whole directory.
fn scan_container(
    manager: &Arc<LogBlockManager>,
    dir: &Arc<DataDir>,
    base: &str,
    report: &mut FsReport,
    repair: bool,
) -> Result<Option<StartupContainer>> {
    let opts = manager.options();
    let fs_block_size = dir.fs_block_size();
    let metadata_p = cask_ondisk::metadata_path(dir.path(), base);
    let data_p = cask_ondisk::data_path(dir.path(), base);

    if !data_p.exists() {
        report.incomplete_containers.push(IncompleteContainerReport {
            container: base.to_owned(),
            reason: "missing data file".to_owned(),
        });
        if repair {
            std::fs::remove_file(&metadata_p)?;
            report.repairs.incomplete_containers_deleted += 1;
        }
        return Ok(None);
    }

    let metadata_bytes = std::fs::read(&metadata_p)?;
    let replayed = cask_ondisk::replay_log(&metadata_bytes);
    let data_len = std::fs::metadata(&data_p)?.len();

    if let Some(defect) = &replayed.defect {
        report.partial_records.push(PartialRecordReport {
            container: base.to_owned(),
            offset: replayed.valid_len,
            detail: format!("malformed tail: {defect:?}"),
        });
    }

    if replayed.records.is_empty() && data_len == 0 {
        report.incomplete_containers.push(IncompleteContainerReport {
            container: base.to_owned(),
            reason: "no usable records and no data".to_owned(),
        });
        if repair {
            std::fs::remove_file(&metadata_p)?;
            std::fs::remove_file(&data_p)?;
            report.repairs.incomplete_containers_deleted += 1;
        }
        return Ok(None);
    }

    // Replay CREATE/DELETE in order into the per-container record map.
    let mut live: BTreeMap<BlockId, BlockRecord> = BTreeMap::new();
    let mut deleted_extents: Vec<(u64, u64)> = Vec::new();
    let mut max_record_end = 0_u64;
    let mut total_creates = 0_u64;
    let total_records = replayed.records.len() as u64;
    for record in &replayed.records {
        match record.kind {
            cask_ondisk::RecordKind::Create => {
                if live.contains_key(&record.block_id) {
                    report.malformed_records.push(MalformedRecordReport {
                        container: base.to_owned(),
                        block_id: record.block_id,
                        detail: "duplicate CREATE for live block".to_owned(),
                    });
                    continue;
                }
                total_creates += 1;
                let offset = record.offset as u64;
                let length = record.length as u64;
                if !is_aligned(offset, fs_block_size) {
                    report.misaligned_blocks.push(MisalignedBlockReport {
                        container: base.to_owned(),
                        block_id: record.block_id,
                        offset,
                    });
                }
                max_record_end =
                    max_record_end.max(align_up(offset.saturating_add(length), fs_block_size));
                live.insert(record.block_id, *record);
            }
            cask_ondisk::RecordKind::Delete => match live.remove(&record.block_id) {
                Some(create) => {
                    deleted_extents.push((create.offset as u64, create.length as u64));
                }
                None => report.malformed_records.push(MalformedRecordReport {
                    container: base.to_owned(),
                    block_id: record.block_id,
                    detail: "DELETE without matching CREATE".to_owned(),
                }),
            },
        }
    }

    // A live record pointing past the end of the data file cannot be
    // repaired; the directory's state is not to be trusted.
    for record in live.values() {
        let end = (record.offset as u64).saturating_add(record.length as u64);
        if end > data_len {
            let detail = format!(
                "CREATE record for block {} spans [{}, {end}) past data file length {data_len}",
                record.block_id, record.offset
            );
            report.corruptions.push(CorruptionReport {
                container: base.to_owned(),
                detail: detail.clone(),
            });
            return Err(CaskError::Corruption {
                container: base.to_owned(),
                detail,
            });
        }
    }

    // Drop the defective metadata tail so it is really "never written".
    if replayed.defect.is_some() && repair {
        let file = OpenOptions::new().write(true).open(&metadata_p)?;
        file.set_len(replayed.valid_len)?;
        cask_fs::sync_file(&file)?;
        report.repairs.partial_records_truncated += 1;
    }
    let mut metadata_len = replayed.valid_len;

    // The cursor covers every replayed extent, live or deleted, so new
    // blocks never land inside an old one. Bytes beyond the last recorded
    // extent were written by a writer that never committed; reclaim them.
    let mut next_offset = max_record_end;
    let mut effective_data_len = data_len;
    if data_len > next_offset {
        if repair {
            let file = OpenOptions::new().write(true).open(&data_p)?;
            file.set_len(next_offset)?;
            cask_fs::sync_file(&file)?;
            report.repairs.orphan_tail_bytes_truncated += data_len - next_offset;
            effective_data_len = next_offset;
        } else {
            next_offset = data_len;
        }
    }

    if live.is_empty() {
        report.stats.dead_containers += 1;
        if repair {
            std::fs::remove_file(&data_p)?;
            std::fs::remove_file(&metadata_p)?;
            report.repairs.dead_containers_deleted += 1;
            manager.metrics().dead_container_deleted();
            info!(
                target: "cask::startup",
                event = "dead_container_deleted",
                container = %base
            );
            return Ok(None);
        }
    }

    let live_records: Vec<BlockRecord> = live.values().copied().collect();

    // Metadata compaction: a log that is mostly deletion residue gets
    // rewritten to just its live CREATE records.
    if repair && !live_records.is_empty() {
        let ratio = live_records.len() as f64 / total_records as f64;
        if ratio < opts.low_live_ratio && metadata_len >= opts.metadata_compact_min_size {
            report.stats.low_live_containers += 1;
            let compacted_len = compact_metadata(dir.path(), base, &live_records)?;
            info!(
                target: "cask::startup",
                event = "metadata_compacted",
                container = %base,
                live_records = live_records.len(),
                total_records,
                bytes_before = metadata_len,
                bytes_after = compacted_len
            );
            metadata_len = compacted_len;
            report.repairs.metadata_files_compacted += 1;
            manager.metrics().metadata_file_compacted();
        }
    }

    // Deleted extents that do not appear to be sparse get their holes
    // punched again (a crash can land between the DELETE record and the
    // punch).
    if repair && opts.hole_punch_enabled && !deleted_extents.is_empty() {
        let file = OpenOptions::new().read(true).write(true).open(&data_p)?;
        let allocated = cask_fs::allocated_bytes(&file)?;
        let live_aligned: u64 = live_records
            .iter()
            .map(|record| align_up(record.length as u64, fs_block_size))
            .sum();
        if allocated > live_aligned + fs_block_size {
            for (offset, length) in &deleted_extents {
                let aligned = align_up(*length, fs_block_size);
                if aligned == 0 {
                    continue;
                }
                match cask_fs::punch_hole(&file, *offset, aligned) {
                    Ok(()) => {
                        report.repairs.holes_repunched += 1;
                        manager.metrics().hole_punched();
                    }
                    Err(err) => warn!(
                        target: "cask::startup",
                        event = "repunch_failed",
                        container = %base,
                        offset,
                        error = %err
                    ),
                }
            }
        }
    }

    let container_opts = ContainerOpts {
        max_size: opts.max_container_size,
        block_limit: opts.block_limit_for(manager.buggy_kernel(), fs_block_size),
        hole_punch_enabled: opts.hole_punch_enabled,
        read_only_mode: opts.read_only,
    };
    let live_bytes: u64 = live_records
        .iter()
        .map(|record| record.length as u64)
        .sum();
    let loaded = LoadedContainerState {
        next_offset,
        data_len: effective_data_len,
        metadata_len,
        total_blocks: total_creates,
        live_blocks: live_records.len() as u64,
        live_bytes,
    };
    let container = LogBlockContainer::load(
        Arc::clone(dir),
        base.to_owned(),
        container_opts,
        manager.metrics_arc(),
        loaded,
    )?;
    report.stats.containers += 1;
    if container.is_full() {
        report.stats.full_containers += 1;
    }

    Ok(Some(StartupContainer {
        container,
        live: live_records,
    }))
}

/// Rewrite a metadata log to contain only `records`: write a temporary
/// file, sync it, and rename it over the original. The new file is synced
/// but its parent directory is not.
fn compact_metadata(dir: &Path, base: &str, records: &[BlockRecord]) -> Result<u64> {
    let tmp_p = cask_ondisk::metadata_tmp_path(dir, base);
    let final_p = cask_ondisk::metadata_path(dir, base);

    let result = (|| -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_p)?;
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.encode_frame());
        }
        file.write_all(&buf)?;
        cask_fs::sync_file(&file)?;
        std::fs::rename(&tmp_p, &final_p)?;
        Ok(buf.len() as u64)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_p);
    }
    result
}
