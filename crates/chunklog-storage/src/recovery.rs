//! Recovery of a backup range from its secondary log
//!
//! Every segment is scanned in order. Per chunk only the entry with the
//! highest version survives (a later entry wins a tie); chunks whose newest
//! entry is a tombstone are left out. The links of a chained entry are
//! collected by index and joined; a chunk whose newest chain misses a link
//! is left out. Recovery is best effort: entries failing their checksum are
//! skipped, a malformed header ends the scan of its segment and unreadable
//! segments are skipped.

use crate::context::LogContext;
use crate::secondary::{EntryIter, SecondaryLog};
use chunklog_common::checksum::verify_payload_crc;
use chunklog_common::{ChunkId, LogConfig, NodeId, Result, Version};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A recovered chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredChunk {
    pub chunk_id: ChunkId,
    pub version: Version,
    pub payload: Vec<u8>,
}

/// Chunks of a recovered range plus scan diagnostics
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Surviving chunks sorted by chunk ID
    pub chunks: Vec<RecoveredChunk>,
    /// Runs of consecutive chunk IDs, inclusive bounds
    pub chunk_id_ranges: Vec<(ChunkId, ChunkId)>,
    /// Entries dropped for a checksum mismatch
    pub corrupted_entries: usize,
    /// Segments cut short by a malformed header
    pub truncated_segments: usize,
    /// Segments that could not be read
    pub failed_segments: usize,
    /// Chunks dropped because a link of their newest chain is missing
    pub incomplete_chunks: usize,
    pub elapsed: Duration,
}

impl RecoveryResult {
    /// Number of recovered chunks
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    /// Payload bytes of all recovered chunks
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.payload.len()).sum()
    }

    /// Whether every segment was read completely
    pub fn is_complete(&self) -> bool {
        self.corrupted_entries == 0
            && self.truncated_segments == 0
            && self.failed_segments == 0
            && self.incomplete_chunks == 0
    }
}

struct Candidate {
    version: Version,
    tombstone: bool,
    /// One slot per chain link, a single slot for unchained entries
    parts: Vec<Option<Vec<u8>>>,
}

impl Candidate {
    fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }

    fn into_payload(self) -> Vec<u8> {
        self.parts.into_iter().flatten().flatten().collect()
    }
}

/// Scan a log and collect the newest copy of every chunk. The caller keeps
/// reorganization away from the log.
pub fn recover_log(log: &SecondaryLog) -> RecoveryResult {
    let started = Instant::now();
    let creator: NodeId = log.original_owner();
    let mut result = RecoveryResult::default();
    let mut newest: HashMap<ChunkId, Candidate> = HashMap::new();

    for idx in 0..log.segment_count() {
        let data = match log.read_segment(idx) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping unreadable segment {} of {}: {}", idx, log.file_name(), e);
                result.failed_segments += 1;
                continue;
            }
        };

        for entry in EntryIter::new(log.codec(), &data, log.is_migration()) {
            let (offset, header) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "Abandoning segment {} of {} at a malformed entry: {}",
                        idx,
                        log.file_name(),
                        e
                    );
                    result.truncated_segments += 1;
                    break;
                }
            };

            let payload = &data[offset + header.header_size..offset + header.entry_size()];
            if let Some(crc) = header.checksum
                && !verify_payload_crc(payload, crc)
            {
                warn!(
                    "Checksum mismatch in range {} segment {} offset {}, entry skipped",
                    log.key(),
                    idx,
                    offset
                );
                result.corrupted_entries += 1;
                continue;
            }

            let chunk_id = header.chunk_id(creator);
            let links = header.chain.map_or(1, |link| usize::from(link.count));
            // Links of the known chain fill their slots, anything else
            // at least as new starts over
            let extend = match newest.get(&chunk_id) {
                Some(known) if known.version.is_newer_than(header.version) => continue,
                Some(known) => {
                    header.chain.is_some() && known.version == header.version && known.parts.len() == links
                }
                None => false,
            };
            if !extend {
                newest.insert(
                    chunk_id,
                    Candidate {
                        version: header.version,
                        tombstone: header.is_tombstone(),
                        parts: vec![None; links],
                    },
                );
            }
            if let Some(candidate) = newest.get_mut(&chunk_id) {
                let slot = header.chain.map_or(0, |link| usize::from(link.index));
                candidate.parts[slot] = Some(payload.to_vec());
            }
        }
    }

    let mut chunks = Vec::with_capacity(newest.len());
    for (chunk_id, candidate) in newest {
        if candidate.tombstone {
            continue;
        }
        if !candidate.is_complete() {
            warn!(
                "Chunk {} of range {} misses links of its chained entry, left out",
                chunk_id,
                log.key()
            );
            result.incomplete_chunks += 1;
            continue;
        }
        chunks.push(RecoveredChunk {
            chunk_id,
            version: candidate.version,
            payload: candidate.into_payload(),
        });
    }
    chunks.sort_by_key(|c| c.chunk_id);

    result.chunk_id_ranges = id_ranges(chunks.iter().map(|c| c.chunk_id));
    result.chunks = chunks;
    result.elapsed = started.elapsed();
    result
}

/// Collapse sorted chunk IDs into inclusive runs of consecutive IDs
pub fn id_ranges(ids: impl IntoIterator<Item = ChunkId>) -> Vec<(ChunkId, ChunkId)> {
    let mut ranges: Vec<(ChunkId, ChunkId)> = Vec::new();
    for id in ids {
        match ranges.last_mut() {
            Some((_, end)) if end.is_followed_by(id) => *end = id,
            _ => ranges.push((id, id)),
        }
    }
    ranges
}

/// Recover from a log file without a running engine. `config` must match
/// the settings the log was written with; the file is left in place.
pub fn recover_from_file(config: LogConfig, file_name: &str) -> Result<RecoveryResult> {
    let ctx = LogContext::new(config, chunklog_common::RESERVED_NODE_ID)?;
    let log = SecondaryLog::open(ctx, file_name)?;
    let result = recover_log(&log);
    log.close()?;

    info!(
        "Recovered {} chunks ({} bytes) in {} ranges from {} in {:?}",
        result.count(),
        result.total_bytes(),
        result.chunk_id_ranges.len(),
        file_name,
        result.elapsed
    );
    Ok(result)
}
