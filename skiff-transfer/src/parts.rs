//! File parts records
//!
//! Per-part digests of a file, exchanged out of band so a resuming
//! downloader can verify retained partial data before trusting it. Only
//! fully-received parts can be verified; anything else is re-fetched.

use skiff_proto::message::FilePartsRecord;
use skiff_proto::{FileInfo, Range};

use crate::errors::Result;
use crate::ranges::RangeSet;
use crate::source::ChunkSource;

/// Default part granularity for records.
pub const DEFAULT_PART_LENGTH: u64 = 1024 * 1024;

fn part_range(file: &FileInfo, part_length: u64, index: usize) -> Range {
    let offset = index as u64 * part_length;
    Range::new(offset, part_length.min(file.size - offset))
}

fn part_count(size: u64, part_length: u64) -> usize {
    (size.div_ceil(part_length)) as usize
}

/// Digest every part of `file` as served by `source`.
pub async fn build_record(
    source: &dyn ChunkSource,
    file: &FileInfo,
    part_length: u64,
) -> Result<FilePartsRecord> {
    let count = part_count(file.size, part_length);
    let mut digests = Vec::with_capacity(count);
    for index in 0..count {
        let data = source
            .read_range(file, &part_range(file, part_length, index))
            .await?;
        digests.push(*blake3::hash(&data).as_bytes());
    }
    Ok(FilePartsRecord {
        part_length,
        digests,
    })
}

/// Check retained partial data against a peer's record. Returns the subset
/// of `received` that verified; parts with a digest mismatch (and partial
/// parts, which cannot be checked) are dropped, so they get re-fetched.
pub async fn verify_partial(
    source: &dyn ChunkSource,
    file: &FileInfo,
    record: &FilePartsRecord,
    received: &RangeSet,
) -> Result<RangeSet> {
    let mut verified = RangeSet::new();
    if record.part_length == 0 {
        return Ok(verified);
    }

    for (index, digest) in record.digests.iter().enumerate() {
        if index >= part_count(file.size, record.part_length) {
            break;
        }
        let range = part_range(file, record.part_length, index);
        if !received.contains(&range) {
            continue;
        }
        let data = source.read_range(file, &range).await?;
        if blake3::hash(&data).as_bytes() == digest {
            verified.insert(range);
        }
    }
    Ok(verified)
}
