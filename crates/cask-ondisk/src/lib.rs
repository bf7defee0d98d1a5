#![forbid(unsafe_code)]
//! On-disk container metadata format.
//!
//! A container is a pair of files under one data directory sharing a base
//! name: `<base>.data` holds raw block payloads, `<base>.metadata` is an
//! append-only log of framed records describing block creations and
//! deletions.
//!
//! Each metadata record is framed as:
//!
//! ```text
//! u32 length (big-endian) | u32 crc32c(payload) (big-endian) | payload
//! ```
//!
//! and the payload is fixed-width little-endian fields:
//!
//! ```text
//! kind         : u8   (1 = CREATE, 2 = DELETE)
//! block_id     : u64
//! offset       : i64  (CREATE only; 0 for DELETE)
//! length       : i64  (CREATE only; 0 for DELETE)
//! timestamp_us : i64
//! ```
//!
//! The reader tolerates a torn or corrupt tail: replay stops at the first
//! bad frame and reports its offset so the caller can truncate the log back
//! to the last valid record.

use cask_types::{
    put_be_u32, put_le_i64, put_le_u64, put_u8, read_be_u32, read_le_i64, read_le_u64, read_u8,
    BlockId,
};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// File name suffix of a container's metadata log.
pub const METADATA_SUFFIX: &str = ".metadata";
/// File name suffix of a container's data file.
pub const DATA_SUFFIX: &str = ".data";
/// Suffix appended to a metadata path while it is being rewritten.
pub const TMP_SUFFIX: &str = ".tmp";

/// Frame header: u32 length + u32 crc32c.
pub const FRAME_HEADER_LEN: usize = 8;
/// Fixed payload size of every record.
pub const RECORD_PAYLOAD_LEN: usize = 33;
/// Upper bound on a frame's declared payload length; anything larger is a
/// malformed frame, not a record from a future version.
const MAX_PAYLOAD_LEN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Create = 1,
    Delete = 2,
}

/// One entry in a container's metadata log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub kind: RecordKind,
    pub block_id: BlockId,
    pub offset: i64,
    pub length: i64,
    pub timestamp_us: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record payload too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("negative {field} in record: {value}")]
    NegativeField { field: &'static str, value: i64 },
    #[error("unset block id in record")]
    UnsetBlockId,
}

impl BlockRecord {
    #[must_use]
    pub fn create(block_id: BlockId, offset: u64, length: u64) -> Self {
        Self {
            kind: RecordKind::Create,
            block_id,
            offset: offset as i64,
            length: length as i64,
            timestamp_us: now_micros(),
        }
    }

    #[must_use]
    pub fn delete(block_id: BlockId) -> Self {
        Self {
            kind: RecordKind::Delete,
            block_id,
            offset: 0,
            length: 0,
            timestamp_us: now_micros(),
        }
    }

    /// Encode the full frame (header + payload) for appending to a log.
    #[must_use]
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(RECORD_PAYLOAD_LEN);
        put_u8(&mut payload, self.kind as u8);
        put_le_u64(&mut payload, self.block_id.get());
        put_le_i64(&mut payload, self.offset);
        put_le_i64(&mut payload, self.length);
        put_le_i64(&mut payload, self.timestamp_us);
        debug_assert_eq!(payload.len(), RECORD_PAYLOAD_LEN);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        put_be_u32(&mut frame, payload.len() as u32);
        put_be_u32(&mut frame, crc32c::crc32c(&payload));
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a record payload (the bytes after the frame header).
    pub fn decode_payload(payload: &[u8]) -> Result<Self, RecordError> {
        let too_short = |_| RecordError::TooShort(payload.len());
        let kind = match read_u8(payload, 0).map_err(too_short)? {
            1 => RecordKind::Create,
            2 => RecordKind::Delete,
            other => return Err(RecordError::UnknownKind(other)),
        };
        let block_id = BlockId::new(read_le_u64(payload, 1).map_err(too_short)?);
        if block_id.is_unset() {
            return Err(RecordError::UnsetBlockId);
        }
        let offset = read_le_i64(payload, 9).map_err(too_short)?;
        let length = read_le_i64(payload, 17).map_err(too_short)?;
        if kind == RecordKind::Create {
            if offset < 0 {
                return Err(RecordError::NegativeField {
                    field: "offset",
                    value: offset,
                });
            }
            if length < 0 {
                return Err(RecordError::NegativeField {
                    field: "length",
                    value: length,
                });
            }
        }
        let timestamp_us = read_le_i64(payload, 25).map_err(too_short)?;
        Ok(Self {
            kind,
            block_id,
            offset,
            length,
            timestamp_us,
        })
    }
}

/// Why replay stopped before the end of the metadata bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailDefect {
    /// The final frame is cut short (torn write).
    Truncated,
    /// The frame declares a payload larger than any record this format can
    /// produce; the header bytes are garbage.
    OversizedFrame { declared: u32 },
    /// The final frame's checksum does not match its payload.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The frame is intact but its payload does not decode.
    Malformed(RecordError),
}

/// Result of replaying a metadata log's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedLog {
    /// Records up to the last valid frame, in log order.
    pub records: Vec<BlockRecord>,
    /// Byte length of the valid prefix; truncating the file to this length
    /// removes the defective tail.
    pub valid_len: u64,
    /// The defect that ended replay, if the log did not end cleanly.
    pub defect: Option<TailDefect>,
}

/// Replay a metadata log from its raw bytes.
///
/// Stops at the first torn, checksum-failing, or undecodable frame; such a
/// tail is reported rather than treated as an error, because it is the
/// expected residue of a crash mid-append.
#[must_use]
pub fn replay_log(bytes: &[u8]) -> ReplayedLog {
    let mut records = Vec::new();
    let mut pos = 0_usize;

    loop {
        if pos == bytes.len() {
            return ReplayedLog {
                records,
                valid_len: pos as u64,
                defect: None,
            };
        }
        let Ok(len) = read_be_u32(bytes, pos) else {
            return defective(records, pos, TailDefect::Truncated);
        };
        if len > MAX_PAYLOAD_LEN {
            return defective(records, pos, TailDefect::OversizedFrame { declared: len });
        }
        let Ok(expected_crc) = read_be_u32(bytes, pos + 4) else {
            return defective(records, pos, TailDefect::Truncated);
        };
        let payload_start = pos + FRAME_HEADER_LEN;
        let payload_end = payload_start + len as usize;
        if payload_end > bytes.len() {
            return defective(records, pos, TailDefect::Truncated);
        }
        let payload = &bytes[payload_start..payload_end];
        let actual_crc = crc32c::crc32c(payload);
        if actual_crc != expected_crc {
            return defective(
                records,
                pos,
                TailDefect::ChecksumMismatch {
                    expected: expected_crc,
                    actual: actual_crc,
                },
            );
        }
        match BlockRecord::decode_payload(payload) {
            Ok(record) => records.push(record),
            Err(err) => return defective(records, pos, TailDefect::Malformed(err)),
        }
        pos = payload_end;
    }
}

fn defective(records: Vec<BlockRecord>, pos: usize, defect: TailDefect) -> ReplayedLog {
    ReplayedLog {
        records,
        valid_len: pos as u64,
        defect: Some(defect),
    }
}

/// Microseconds since the Unix epoch, for record timestamps.
#[must_use]
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// `<dir>/<base>.data`
#[must_use]
pub fn data_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(format!("{base}{DATA_SUFFIX}"))
}

/// `<dir>/<base>.metadata`
#[must_use]
pub fn metadata_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(format!("{base}{METADATA_SUFFIX}"))
}

/// The temporary path used while compacting a metadata file.
#[must_use]
pub fn metadata_tmp_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(format!("{base}{METADATA_SUFFIX}{TMP_SUFFIX}"))
}

/// Which container file a directory entry is, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFileKind {
    Metadata,
    Data,
    Tmp,
}

/// Classify a directory entry name as a container file, returning the
/// container base name and the file kind.
#[must_use]
pub fn parse_file_name(name: &str) -> Option<(&str, ContainerFileKind)> {
    if let Some(base) = name.strip_suffix(TMP_SUFFIX) {
        let base = base
            .strip_suffix(METADATA_SUFFIX)
            .or_else(|| base.strip_suffix(DATA_SUFFIX))
            .unwrap_or(base);
        return Some((base, ContainerFileKind::Tmp));
    }
    if let Some(base) = name.strip_suffix(METADATA_SUFFIX) {
        return Some((base, ContainerFileKind::Metadata));
    }
    if let Some(base) = name.strip_suffix(DATA_SUFFIX) {
        return Some((base, ContainerFileKind::Data));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_create(id: u64, offset: u64, length: u64) -> BlockRecord {
        BlockRecord::create(BlockId::new(id), offset, length)
    }

    #[test]
    fn frame_round_trip() {
        let record = sample_create(42, 4096, 100);
        let frame = record.encode_frame();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + RECORD_PAYLOAD_LEN);

        let replayed = replay_log(&frame);
        assert_eq!(replayed.records, vec![record]);
        assert_eq!(replayed.valid_len, frame.len() as u64);
        assert!(replayed.defect.is_none());
    }

    #[test]
    fn delete_record_has_zero_extent() {
        let record = BlockRecord::delete(BlockId::new(7));
        assert_eq!(record.offset, 0);
        assert_eq!(record.length, 0);
        let replayed = replay_log(&record.encode_frame());
        assert_eq!(replayed.records[0].kind, RecordKind::Delete);
    }

    #[test]
    fn torn_tail_keeps_valid_prefix() {
        let mut bytes = sample_create(1, 0, 10).encode_frame();
        let valid = bytes.len() as u64;
        let second = sample_create(2, 4096, 10).encode_frame();
        bytes.extend_from_slice(&second[..second.len() - 5]);

        let replayed = replay_log(&bytes);
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.valid_len, valid);
        assert_eq!(replayed.defect, Some(TailDefect::Truncated));
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let mut bytes = sample_create(1, 0, 10).encode_frame();
        let valid = bytes.len() as u64;
        let mut second = sample_create(2, 4096, 10).encode_frame();
        let last = second.len() - 1;
        second[last] ^= 0xFF;
        bytes.extend_from_slice(&second);

        let replayed = replay_log(&bytes);
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.valid_len, valid);
        assert!(matches!(
            replayed.defect,
            Some(TailDefect::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let record = sample_create(1, 0, 10);
        let mut frame = record.encode_frame();
        frame[FRAME_HEADER_LEN] = 9; // clobber the kind byte
        let crc = crc32c::crc32c(&frame[FRAME_HEADER_LEN..]);
        frame[4..8].copy_from_slice(&crc.to_be_bytes());

        let replayed = replay_log(&frame);
        assert!(replayed.records.is_empty());
        assert_eq!(
            replayed.defect,
            Some(TailDefect::Malformed(RecordError::UnknownKind(9)))
        );
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        let mut bytes = Vec::new();
        put_be_u32(&mut bytes, MAX_PAYLOAD_LEN + 1);
        put_be_u32(&mut bytes, 0);
        bytes.extend_from_slice(&[0_u8; 64]);

        let replayed = replay_log(&bytes);
        assert!(replayed.records.is_empty());
        assert_eq!(replayed.valid_len, 0);
        assert_eq!(
            replayed.defect,
            Some(TailDefect::OversizedFrame {
                declared: MAX_PAYLOAD_LEN + 1
            })
        );
    }

    #[test]
    fn empty_log_is_clean() {
        let replayed = replay_log(&[]);
        assert!(replayed.records.is_empty());
        assert!(replayed.defect.is_none());
    }

    #[test]
    fn file_name_classification() {
        assert_eq!(
            parse_file_name("abc123.metadata"),
            Some(("abc123", ContainerFileKind::Metadata))
        );
        assert_eq!(
            parse_file_name("abc123.data"),
            Some(("abc123", ContainerFileKind::Data))
        );
        assert_eq!(
            parse_file_name("abc123.metadata.tmp"),
            Some(("abc123", ContainerFileKind::Tmp))
        );
        assert_eq!(parse_file_name("README"), None);
    }
}
