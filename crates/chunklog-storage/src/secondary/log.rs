//! Segmented secondary log of one backup range
//!
//! Next to the log lives its version log (same name, `.ver`). Version
//! changes reach it when enough of them piled up, before every
//! reorganization and on close. Opening a log merges the version log with
//! the versions found in the segments and writes the result back.

use super::segment::{EntryIter, SegmentHeader, fit_prefix};
use crate::context::LogContext;
use crate::disk::LogFile;
use crate::header::{HeaderCodec, HeaderFormat};
use crate::version::VersionStore;
use crate::version_log::VersionLog;
use chunklog_common::{Error, LogConfig, NodeId, RangeId, RangeKey, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Pre-sized hash table capacity of a range's version store
const VERSION_TABLE_CAPACITY: usize = 16 * 1024;

/// Recorded version changes that trigger a write to the version log
const VERSION_FLUSH_THRESHOLD: usize = 4096;

/// Name of a secondary log file
///
/// `N<original owner>_sec<owner>_<range>[M]_<checksums>_<timestamps>.log`,
/// node IDs in 4-digit hex, flags as `0`/`1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogFileName {
    pub original_owner: NodeId,
    pub owner: NodeId,
    pub range: RangeId,
    pub migration: bool,
    pub checksums: bool,
    pub timestamps: bool,
}

impl LogFileName {
    /// Parse a file name (without directory)
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || Error::invalid_argument(format!("not a secondary log file name: {name}"));

        let stem = name.strip_suffix(".log").ok_or_else(invalid)?;
        let parts: Vec<&str> = stem.split('_').collect();
        let [original, owner, range, checksums, timestamps] = parts.as_slice() else {
            return Err(invalid());
        };

        let hex = |s: &str, prefix: &str| {
            s.strip_prefix(prefix)
                .and_then(|h| NodeId::from_str_radix(h, 16).ok())
                .ok_or_else(invalid)
        };
        let flag = |s: &str| match s {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(invalid()),
        };

        let (range, migration) = match range.strip_suffix('M') {
            Some(r) => (r, true),
            None => (*range, false),
        };

        Ok(Self {
            original_owner: hex(original, "N")?,
            owner: hex(owner, "sec")?,
            range: range.parse().map_err(|_| invalid())?,
            migration,
            checksums: flag(checksums)?,
            timestamps: flag(timestamps)?,
        })
    }

    /// Name of the version log kept next to the log
    #[must_use]
    pub fn version_log_name(&self) -> String {
        let name = self.to_string();
        format!("{}.ver", name.strip_suffix(".log").unwrap_or(&name))
    }

    /// Header format the log was written with
    #[must_use]
    pub const fn format(&self) -> HeaderFormat {
        HeaderFormat {
            checksums: self.checksums,
            timestamps: self.timestamps,
        }
    }
}

impl fmt::Display for LogFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N{:04X}_sec{:04X}_{}{}_{}_{}.log",
            self.original_owner,
            self.owner,
            self.range,
            if self.migration { "M" } else { "" },
            u8::from(self.checksums),
            u8::from(self.timestamps)
        )
    }
}

/// Version store sized for one range; creator ranges use the dense window
fn version_store(config: &LogConfig, name: &LogFileName) -> VersionStore {
    VersionStore::new(
        (!name.migration).then_some(name.original_owner),
        config.version_array_capacity(),
        VERSION_TABLE_CAPACITY,
    )
}

/// Reorganization phase of a log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReorgPhase {
    Idle = 0,
    Scanning = 1,
    Compacting = 2,
}

impl ReorgPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Compacting,
            _ => Self::Idle,
        }
    }
}

struct LogState {
    file: Option<Box<dyn LogFile>>,
    name: LogFileName,
    segments: Vec<SegmentHeader>,
    /// Segment currently compacted, skipped by appends
    reorg_segment: Option<usize>,
    /// Segments already compacted in the current pass
    reorganized: Vec<bool>,
    versions: VersionStore,
    version_log: Option<VersionLog>,
}

impl LogState {
    fn file(&mut self) -> Result<&mut Box<dyn LogFile>> {
        let name = self.name;
        self.file
            .as_mut()
            .ok_or_else(|| Error::Storage(format!("secondary log {name} is closed")))
    }

    fn empty_segment(&self) -> Option<usize> {
        self.segments
            .iter()
            .enumerate()
            .find(|(idx, h)| h.is_empty() && self.reorg_segment != Some(*idx))
            .map(|(idx, _)| idx)
    }

    /// Segment for `len` bytes: the tightest partly used segment holding all
    /// of them, else an empty one, else the one with the most free space
    fn target_segment(&self, len: usize, segment_size: usize) -> Option<usize> {
        let mut best_fit: Option<(usize, usize)> = None;
        let mut most_free: Option<(usize, usize)> = None;

        for (idx, header) in self.segments.iter().enumerate() {
            if header.is_empty() || self.reorg_segment == Some(idx) {
                continue;
            }
            let free = header.free(segment_size);
            if free >= len {
                if best_fit.is_none_or(|(_, f)| free < f) {
                    best_fit = Some((idx, free));
                }
            } else if free > 0 && most_free.is_none_or(|(_, f)| free > f) {
                most_free = Some((idx, free));
            }
        }

        best_fit
            .map(|(idx, _)| idx)
            .or_else(|| self.empty_segment())
            .or(most_free.map(|(idx, _)| idx))
    }

    /// Persist the recorded version changes; returns how many were written.
    /// A version log without room for them is replaced by all versions. If
    /// even those do not fit, the changes are dropped and reopening falls
    /// back to the versions found in the entries.
    fn flush_versions(&mut self) -> Result<usize> {
        let Some(version_log) = self.version_log.as_mut() else {
            return Ok(0);
        };
        let count = self.versions.changes().len();
        if count == 0 {
            return Ok(0);
        }
        if version_log.fits(count) {
            version_log.append(self.versions.changes())?;
        } else {
            let known = self.versions.snapshot();
            if known.len() > version_log.capacity() {
                self.versions.clear_changes();
                return Err(Error::Storage(format!(
                    "version log {} cannot hold {} versions",
                    version_log.name(),
                    known.len()
                )));
            }
            version_log.write_back(&known)?;
        }
        self.versions.clear_changes();
        Ok(count)
    }

    /// Append bytes to a segment and terminate them
    fn write_segment(&mut self, idx: usize, data: &[u8], segment_size: usize, now: u32) -> Result<()> {
        let used = self.segments[idx].used;
        let position = (idx * segment_size + used) as u64;
        if used + data.len() < segment_size {
            let mut buf = Vec::with_capacity(data.len() + 1);
            buf.extend_from_slice(data);
            buf.push(0);
            self.file()?.write_at(position, &buf)?;
        } else {
            self.file()?.write_at(position, data)?;
        }
        self.segments[idx].record_append(data.len(), now);
        Ok(())
    }
}

/// One secondary log: a preallocated file split into fixed-size segments
pub struct SecondaryLog {
    ctx: Arc<LogContext>,
    codec: HeaderCodec,
    original_owner: NodeId,
    migration: bool,
    segment_size: usize,
    capacity: u64,
    /// Held by the reorganizer and by recovery, never both
    reorg_lock: Mutex<()>,
    state: Mutex<LogState>,
    occupied: AtomicU64,
    phase: AtomicU8,
}

impl SecondaryLog {
    /// Create the log of a new backup range
    pub fn create(
        ctx: Arc<LogContext>,
        owner: NodeId,
        range: RangeId,
        original_owner: NodeId,
        migration: bool,
    ) -> Result<Self> {
        let format = ctx.codec().format();
        let name = LogFileName {
            original_owner,
            owner,
            range,
            migration,
            checksums: format.checksums,
            timestamps: format.timestamps,
        };
        let capacity = ctx.config().secondary_log_size();
        let segment_size = ctx.config().log_segment_size as usize;

        let mut file = ctx.access().create_log(&name.to_string(), capacity)?;
        let segments = (capacity / segment_size as u64) as usize;
        for idx in 0..segments {
            file.write_at((idx * segment_size) as u64, &[0])?;
        }

        info!(
            "Created secondary log {} ({} segments of {} bytes)",
            name, segments, segment_size
        );

        let version_log = VersionLog::create(
            ctx.access(),
            &name.version_log_name(),
            ctx.config().version_log_size(),
        )?;
        let versions = version_store(ctx.config(), &name);
        Ok(Self::assemble(
            ctx,
            file,
            name,
            vec![SegmentHeader::default(); segments],
            versions,
            version_log,
        ))
    }

    /// Open an existing log file and rebuild its segment table by scanning
    pub fn open(ctx: Arc<LogContext>, file_name: &str) -> Result<Self> {
        let name = LogFileName::parse(file_name)?;
        let file = ctx.access().open_log(file_name)?;
        let segment_size = ctx.config().log_segment_size as usize;
        let segments = (file.size() / segment_size as u64) as usize;
        let codec = HeaderCodec::new(name.format());
        let now = ctx.now_secs();
        let cold = ctx.config().cold_data_threshold_secs;

        let mut headers = vec![SegmentHeader::default(); segments];
        let mut versions = version_store(ctx.config(), &name);
        let version_log_name = name.version_log_name();
        let mut version_log = if ctx.access().exists(&version_log_name) {
            let (version_log, records) = VersionLog::open(ctx.access(), &version_log_name)?;
            for (chunk_id, version) in records {
                versions.put_max(chunk_id, version);
            }
            version_log
        } else {
            warn!("Version log of {} missing, versions come from the entries only", name);
            VersionLog::create(ctx.access(), &version_log_name, ctx.config().version_log_size())?
        };
        let mut data = vec![0u8; segment_size];
        for (idx, header) in headers.iter_mut().enumerate() {
            file.read_at((idx * segment_size) as u64, &mut data)?;
            let mut iter = EntryIter::new(&codec, &data, name.migration);
            let mut age_bytes = 0u64;
            let mut used = 0;
            for entry in iter.by_ref() {
                match entry {
                    Ok((_, decoded)) => {
                        versions.put_max(decoded.chunk_id(name.original_owner), decoded.version);
                        used += decoded.entry_size();
                        if let Some(ts) = decoded.timestamp {
                            let age = now.saturating_sub(ts);
                            if age < cold {
                                age_bytes += u64::from(age) * decoded.entry_size() as u64;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Truncating segment {} of {} at offset {}: {}",
                            idx, name, used, e
                        );
                        break;
                    }
                }
            }
            let age = if used == 0 { 0 } else { (age_bytes / used as u64) as u32 };
            *header = SegmentHeader::rewritten(used, now, age);
        }

        // Merged versions replace the old records
        let known = versions.snapshot();
        match version_log.write_back(&known) {
            Ok(()) => versions.clear_changes(),
            Err(e) => warn!("Failed to write back versions of {}: {}", name, e),
        }

        info!(
            "Opened secondary log {} with {} bytes in use and {} known versions",
            name,
            headers.iter().map(|h| h.used).sum::<usize>(),
            known.len()
        );

        let mut log = Self::assemble(ctx, file, name, headers, versions, version_log);
        log.capacity = log.state.get_mut().file.as_ref().map_or(0, |f| f.size());
        Ok(log)
    }

    fn assemble(
        ctx: Arc<LogContext>,
        file: Box<dyn LogFile>,
        name: LogFileName,
        segments: Vec<SegmentHeader>,
        versions: VersionStore,
        version_log: VersionLog,
    ) -> Self {
        let config = ctx.config();
        let occupied = segments.iter().map(|h| h.used as u64).sum();
        Self {
            codec: HeaderCodec::new(name.format()),
            original_owner: name.original_owner,
            migration: name.migration,
            segment_size: config.log_segment_size as usize,
            capacity: config.secondary_log_size(),
            reorg_lock: Mutex::new(()),
            state: Mutex::new(LogState {
                file: Some(file),
                name,
                reorganized: vec![false; segments.len()],
                segments,
                reorg_segment: None,
                versions,
                version_log: Some(version_log),
            }),
            occupied: AtomicU64::new(occupied),
            phase: AtomicU8::new(ReorgPhase::Idle as u8),
            ctx,
        }
    }

    /// Engine context the log was opened with
    pub const fn context(&self) -> &Arc<LogContext> {
        &self.ctx
    }

    /// Current owner of the range
    pub fn owner(&self) -> NodeId {
        self.state.lock().name.owner
    }

    /// Current range ID
    pub fn range(&self) -> RangeId {
        self.state.lock().name.range
    }

    pub fn key(&self) -> RangeKey {
        let state = self.state.lock();
        RangeKey::new(state.name.owner, state.name.range)
    }

    /// Creator of all chunks in a creator range
    pub const fn original_owner(&self) -> NodeId {
        self.original_owner
    }

    /// Whether entries carry their creator explicitly
    pub const fn is_migration(&self) -> bool {
        self.migration
    }

    pub fn file_name(&self) -> String {
        self.state.lock().name.to_string()
    }

    /// Codec matching the log's header format
    pub const fn codec(&self) -> &HeaderCodec {
        &self.codec
    }

    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Size of the log in bytes
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by entries
    pub fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Acquire)
    }

    /// Occupied share of the log in percent
    pub fn utilization(&self) -> u8 {
        if self.capacity == 0 {
            return 0;
        }
        (self.occupied() * 100 / self.capacity) as u8
    }

    /// Used bytes of every segment
    pub fn segment_distribution(&self) -> Vec<usize> {
        self.state.lock().segments.iter().map(|h| h.used).collect()
    }

    pub fn phase(&self) -> ReorgPhase {
        ReorgPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: ReorgPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Exclude reorganization (and recovery) of this log while held
    pub fn lock_reorganization(&self) -> MutexGuard<'_, ()> {
        self.reorg_lock.lock()
    }

    /// Non-blocking variant of [`Self::lock_reorganization`]
    pub fn try_lock_reorganization(&self) -> Option<MutexGuard<'_, ()>> {
        self.reorg_lock.try_lock()
    }

    /// Run `f` on the range's version store
    pub fn with_versions<R>(&self, f: impl FnOnce(&mut VersionStore) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state.versions);
        if state.versions.changes().len() >= VERSION_FLUSH_THRESHOLD
            && let Err(e) = state.flush_versions()
        {
            warn!("Failed to persist versions of {}: {}", state.name, e);
        }
        result
    }

    /// Write recorded version changes to the version log
    pub fn flush_versions(&self) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.flush_versions()?;
        if count > 0 {
            debug!("Persisted {} version changes of {}", count, state.name);
        }
        Ok(())
    }

    /// Append a batch of secondary-shape entries.
    ///
    /// Entries are never split across segments. When no segment has room,
    /// the log is compacted inline and the rest retried once.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let written = self.try_append(data)?;
        if written == data.len() {
            return Ok(());
        }

        let key = self.key();
        warn!(
            "Secondary log of range {} is full ({} bytes pending), reorganizing promptly",
            key,
            data.len() - written
        );
        crate::reorg::compact_all(self, None)?;

        let rest = &data[written..];
        let more = self.try_append(rest)?;
        if more < rest.len() {
            return Err(Error::LogFull {
                owner: key.owner,
                range: key.range,
                required: rest.len() - more,
            });
        }
        Ok(())
    }

    /// Place as many whole entries as possible; returns the bytes written
    fn try_append(&self, data: &[u8]) -> Result<usize> {
        let now = self.ctx.now_secs();
        let segment_size = self.segment_size;
        let mut state = self.state.lock();
        let mut offset = 0;

        // Large batches go to empty segments first
        while data.len() - offset >= segment_size * 3 / 4 {
            let Some(idx) = state.empty_segment() else {
                break;
            };
            let len = fit_prefix(&self.codec, data, offset, segment_size, self.migration)?;
            if len == 0 {
                break;
            }
            state.write_segment(idx, &data[offset..offset + len], segment_size, now)?;
            self.occupied.fetch_add(len as u64, Ordering::AcqRel);
            offset += len;
        }

        while offset < data.len() {
            let Some(idx) = state.target_segment(data.len() - offset, segment_size) else {
                break;
            };
            let free = state.segments[idx].free(segment_size);
            let len = fit_prefix(&self.codec, data, offset, free, self.migration)?;
            if len == 0 {
                break;
            }
            state.write_segment(idx, &data[offset..offset + len], segment_size, now)?;
            self.occupied.fetch_add(len as u64, Ordering::AcqRel);
            offset += len;
        }

        Ok(offset)
    }

    /// Read the used bytes of a segment
    pub fn read_segment(&self, idx: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.file()?;
        let used = self.segment_header(&state, idx)?.used;
        let mut data = vec![0u8; used];
        if used > 0 {
            let position = (idx * self.segment_size) as u64;
            state.file()?.read_at(position, &mut data)?;
        }
        Ok(data)
    }

    fn segment_header(&self, state: &LogState, idx: usize) -> Result<SegmentHeader> {
        state.segments.get(idx).copied().ok_or_else(|| {
            Error::invalid_argument(format!("segment {idx} out of range for {}", state.name))
        })
    }

    /// Headers of all segments
    pub fn segment_headers(&self) -> Vec<SegmentHeader> {
        self.state.lock().segments.clone()
    }

    /// Non-empty segments not yet compacted in the current pass
    pub fn reorg_candidates(&self) -> Vec<(usize, SegmentHeader)> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .enumerate()
            .filter(|(idx, h)| !h.is_empty() && !state.reorganized[*idx])
            .map(|(idx, h)| (idx, *h))
            .collect()
    }

    /// Start a new reorganization pass
    pub fn reset_reorg_pass(&self) {
        self.state.lock().reorganized.fill(false);
    }

    /// Reserve a segment for compaction and read it; `None` if it is empty
    pub fn begin_segment_reorg(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let header = self.segment_header(&state, idx)?;
        state.reorganized[idx] = true;
        if header.is_empty() {
            return Ok(None);
        }
        let mut data = vec![0u8; header.used];
        let position = (idx * self.segment_size) as u64;
        state.file()?.read_at(position, &mut data)?;
        state.reorg_segment = Some(idx);
        Ok(Some(data))
    }

    /// Release the segment reserved by [`Self::begin_segment_reorg`]
    pub fn end_segment_reorg(&self) {
        self.state.lock().reorg_segment = None;
    }

    /// Overwrite a segment with compacted data
    pub fn update_segment(&self, idx: usize, data: &[u8], age: u32) -> Result<()> {
        let now = self.ctx.now_secs();
        let mut state = self.state.lock();
        let old = self.segment_header(&state, idx)?.used;
        state.segments[idx] = SegmentHeader::default();
        state.write_segment(idx, data, self.segment_size, now)?;
        state.segments[idx] = SegmentHeader::rewritten(data.len(), now, age);
        self.occupied.fetch_sub(old as u64, Ordering::AcqRel);
        self.occupied.fetch_add(data.len() as u64, Ordering::AcqRel);
        debug!("Rewrote segment {} of {}: {} -> {} bytes", idx, state.name, old, data.len());
        Ok(())
    }

    /// Mark a segment as empty
    pub fn free_segment(&self, idx: usize) -> Result<()> {
        let mut state = self.state.lock();
        let old = self.segment_header(&state, idx)?.used;
        let position = (idx * self.segment_size) as u64;
        // A zero type byte ends the segment
        state.file()?.write_at(position, &[0])?;
        state.segments[idx] = SegmentHeader::default();
        self.occupied.fetch_sub(old as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Hand the log over to a new owner and range ID
    pub fn transfer(&self, owner: NodeId, range: RangeId) -> Result<()> {
        let mut state = self.state.lock();
        let old = state.name;
        let name = LogFileName { owner, range, ..old };
        state.file()?.rename(&name.to_string())?;
        if let Some(version_log) = state.version_log.as_mut() {
            version_log.rename(&name.version_log_name())?;
        }
        state.name = name;
        info!("Transferred secondary log {} to {}", old, name);
        Ok(())
    }

    /// Flush the file to stable storage
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(version_log) = &state.version_log {
            version_log.sync()?;
        }
        state.file()?.sync()
    }

    /// Close the log, keeping its files
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            return Ok(());
        }
        state.flush_versions()?;
        if let Some(version_log) = state.version_log.take() {
            version_log.sync()?;
        }
        if let Some(file) = state.file.take() {
            file.sync()?;
        }
        Ok(())
    }

    /// Close the log and delete its files
    pub fn close_and_remove(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(version_log) = state.version_log.take() {
            version_log.remove()?;
        }
        if let Some(file) = state.file.take() {
            file.remove()?;
            self.occupied.store(0, Ordering::Release);
            info!("Removed secondary log {}", state.name);
        }
        Ok(())
    }
}

impl fmt::Debug for SecondaryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryLog")
            .field("name", &self.file_name())
            .field("occupied", &self.occupied())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::header::{EntryHeader, EntryKind, LogShape};
    use chunklog_common::{ChunkId, Version};

    /// Secondary-shape entries for local IDs `ids`, each with `size` payload bytes
    fn batch(log: &SecondaryLog, ids: std::ops::Range<u64>, size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for lid in ids {
            let payload = vec![(lid % 251) as u8; size];
            let header = EntryHeader {
                kind: EntryKind::Default,
                tombstone: false,
                range: 0,
                owner: log.owner(),
                chunk_id: ChunkId::new(log.original_owner(), lid),
                length: size as u32,
                version: Version::first(0),
                timestamp: 0,
                checksum: chunklog_common::compute_payload_crc(&payload),
                chain: None,
            };
            out.extend_from_slice(log.codec().encode(LogShape::Secondary, &header).unwrap().as_slice());
            out.extend_from_slice(&payload);
        }
        out
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = LogFileName {
            original_owner: 0x00AB,
            owner: 0x0102,
            range: 17,
            migration: true,
            checksums: true,
            timestamps: false,
        };
        assert_eq!(name.to_string(), "N00AB_sec0102_17M_1_0.log");
        assert_eq!(LogFileName::parse(&name.to_string()).unwrap(), name);

        assert!(LogFileName::parse("primary.log").is_err());
        assert!(LogFileName::parse("N00AB_sec0102_17_2_0.log").is_err());
        assert!(LogFileName::parse("N00AB_sec0102_17_1_0").is_err());
    }

    #[test]
    fn test_append_and_read_segment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx, 1, 0, 1, false).unwrap();
        assert_eq!(log.segment_count(), 8);

        let data = batch(&log, 0..10, 100);
        log.append(&data).unwrap();
        assert_eq!(log.occupied(), data.len() as u64);

        // Small batch lands in the first empty segment
        assert_eq!(log.read_segment(0).unwrap(), data);
        assert_eq!(log.segment_distribution()[1..], [0; 7]);
    }

    #[test]
    fn test_best_fit_placement() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx, 1, 0, 1, false).unwrap();
        let segment = log.segment_size();

        // Two large batches fill two segments to different levels
        let a = batch(&log, 0..50, 1000);
        let b = batch(&log, 100..160, 1000);
        log.append(&a).unwrap();
        log.append(&b).unwrap();
        let dist = log.segment_distribution();
        assert_eq!(dist[0], a.len());
        assert_eq!(dist[1], b.len());
        assert!(segment - b.len() < segment - a.len());

        // A small batch goes to the fullest segment that still holds it
        let small = batch(&log, 200..201, 100);
        log.append(&small).unwrap();
        assert_eq!(log.segment_distribution()[1], b.len() + small.len());
    }

    #[test]
    fn test_batch_larger_than_segment_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx, 1, 0, 1, false).unwrap();

        let data = batch(&log, 0..200, 1000);
        assert!(data.len() > log.segment_size());
        log.append(&data).unwrap();

        let mut joined = Vec::new();
        for idx in 0..log.segment_count() {
            joined.extend(log.read_segment(idx).unwrap());
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_full_log_reports_log_full() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx, 1, 0, 1, false).unwrap();

        // Versions are unknown, so compaction keeps everything
        let mut next = 0;
        let err = loop {
            let data = batch(&log, next..next + 50, 1000);
            next += 50;
            if let Err(e) = log.append(&data) {
                break e;
            }
        };
        assert!(matches!(err, Error::LogFull { owner: 1, range: 0, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_reopen_rebuilds_segments() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let data;
        let name;
        {
            let log = SecondaryLog::create(ctx.clone(), 2, 5, 2, false).unwrap();
            data = batch(&log, 0..10, 300);
            log.append(&data).unwrap();
            log.with_versions(|v| v.put(ChunkId::new(2, 3), Version::new(0, 4)));
            name = log.file_name();
            log.close().unwrap();
        }

        let log = SecondaryLog::open(ctx, &name).unwrap();
        assert_eq!(log.occupied(), data.len() as u64);
        assert_eq!(log.read_segment(0).unwrap(), data);
        assert_eq!(log.key(), RangeKey::new(2, 5));
        // Versions come from the version log and the scanned entries
        assert_eq!(log.with_versions(|v| v.current(ChunkId::new(2, 3))), Version::new(0, 4));
        assert_eq!(log.with_versions(|v| v.current(ChunkId::new(2, 7))), Version::first(0));
    }

    #[test]
    fn test_versions_outlive_compacted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx.clone(), 1, 0, 1, false).unwrap();
        let chunk = ChunkId::new(1, 3);

        log.append(&batch(&log, 3..4, 100)).unwrap();
        let current = log.with_versions(|v| {
            v.put(chunk, Version::first(0));
            v.next_version(chunk);
            v.next_version(chunk)
        });
        assert_eq!(current, Version::new(0, 3));

        // The only entry is outdated and dropped; its versions were persisted first
        crate::reorg::compact_all(&log, None).unwrap();
        assert_eq!(log.occupied(), 0);
        assert!(log.with_versions(|v| v.changes().is_empty()));

        let name = log.file_name();
        log.close().unwrap();
        assert!(ctx.access().exists("N0001_sec0001_0_1_1.ver"));

        let log = SecondaryLog::open(ctx, &name).unwrap();
        assert_eq!(log.with_versions(|v| v.current(chunk)), Version::new(0, 3));
        assert_eq!(log.with_versions(|v| v.next_version(chunk)), Version::new(0, 4));
    }

    #[test]
    fn test_version_log_flushed_when_changes_pile_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx.clone(), 1, 0, 1, false).unwrap();
        log.with_versions(|v| {
            for lid in 0..VERSION_FLUSH_THRESHOLD as u64 - 1 {
                v.next_version(ChunkId::new(1, lid));
            }
        });
        assert_eq!(log.with_versions(|v| v.changes().len()), VERSION_FLUSH_THRESHOLD - 1);

        log.with_versions(|v| v.next_version(ChunkId::new(1, 99_999)));
        assert!(log.with_versions(|v| v.changes().is_empty()));
        let name = log.file_name();
        drop(log);

        let log = SecondaryLog::open(ctx, &name).unwrap();
        assert_eq!(log.with_versions(|v| v.current(ChunkId::new(1, 99_999))), Version::first(0));
        assert_eq!(log.with_versions(|v| v.current(ChunkId::new(1, 4000))), Version::first(0));
    }

    #[test]
    fn test_free_and_update_segment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx, 1, 0, 1, false).unwrap();
        let data = batch(&log, 0..10, 100);
        log.append(&data).unwrap();

        let shorter = batch(&log, 0..3, 100);
        log.update_segment(0, &shorter, 0).unwrap();
        assert_eq!(log.read_segment(0).unwrap(), shorter);
        assert_eq!(log.occupied(), shorter.len() as u64);

        log.free_segment(0).unwrap();
        assert!(log.read_segment(0).unwrap().is_empty());
        assert_eq!(log.occupied(), 0);
    }

    #[test]
    fn test_transfer_renames_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let log = SecondaryLog::create(ctx.clone(), 3, 1, 3, false).unwrap();
        log.transfer(4, 9).unwrap();
        assert_eq!(log.key(), RangeKey::new(4, 9));
        assert_eq!(log.original_owner(), 3);
        assert!(ctx.access().exists("N0003_sec0004_9_1_1.log"));
        assert!(ctx.access().exists("N0003_sec0004_9_1_1.ver"));
        assert!(!ctx.access().exists("N0003_sec0003_1_1_1.ver"));

        log.close_and_remove().unwrap();
        assert!(!ctx.access().exists("N0003_sec0004_9_1_1.log"));
        assert!(!ctx.access().exists("N0003_sec0004_9_1_1.ver"));
        assert!(log.read_segment(0).is_err());
    }
}
