//! Background reorganization of secondary logs
//!
//! Compacting a segment drops every entry whose chunk has a strictly newer
//! version on record and rewrites the survivors in place. Segments are
//! picked by a cost-benefit score favouring old, sparsely used segments:
//!
//! ```text
//! score = (1 - u) * (age + 1) / (1 + u)      u = used / segment size
//! ```
//!
//! The reorganizer thread works on the fullest log above the activation
//! threshold whenever it is idle, and on any log on request (prompt
//! reorganization). Each segment is compacted at most once per pass.

use crate::catalog::LogCatalog;
use crate::context::LogContext;
use crate::secondary::{EntryIter, ReorgPhase, SecondaryLog};
use chunklog_common::{Error, RangeKey, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Idle wait between activation checks
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Pending prompt requests
const REQUEST_QUEUE_SIZE: usize = 64;

/// Reorganization counters
#[derive(Debug, Default)]
pub struct ReorgStats {
    pub segments_compacted: AtomicU64,
    pub entries_dropped: AtomicU64,
    pub bytes_freed: AtomicU64,
    pub logs_reorganized: AtomicU64,
}

impl ReorgStats {
    pub fn snapshot(&self) -> ReorgStatsSnapshot {
        ReorgStatsSnapshot {
            segments_compacted: self.segments_compacted.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            logs_reorganized: self.logs_reorganized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgStatsSnapshot {
    pub segments_compacted: u64,
    pub entries_dropped: u64,
    pub bytes_freed: u64,
    pub logs_reorganized: u64,
}

/// Outcome of compacting one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub entries_dropped: u64,
    pub bytes_freed: u64,
}

/// Compact one segment. The caller holds the log's reorganization lock.
pub fn compact_segment(log: &SecondaryLog, idx: usize, now: u32, cold_threshold: u32) -> Result<CompactionResult> {
    let Some(data) = log.begin_segment_reorg(idx)? else {
        return Ok(CompactionResult::default());
    };
    let result = rewrite_segment(log, idx, &data, now, cold_threshold);
    log.end_segment_reorg();
    result
}

fn rewrite_segment(
    log: &SecondaryLog,
    idx: usize,
    data: &[u8],
    now: u32,
    cold_threshold: u32,
) -> Result<CompactionResult> {
    let creator = log.original_owner();
    let mut entries = Vec::new();
    for entry in EntryIter::new(log.codec(), data, log.is_migration()) {
        match entry {
            Ok((offset, header)) => entries.push((offset, header)),
            Err(e) => {
                warn!(
                    "Skipping reorganization of segment {} of {}: {}",
                    idx,
                    log.file_name(),
                    e
                );
                return Ok(CompactionResult::default());
            }
        }
    }

    let keep: Vec<bool> = log.with_versions(|versions| {
        entries
            .iter()
            .map(|(_, header)| {
                !versions
                    .current(header.chunk_id(creator))
                    .is_newer_than(header.version)
            })
            .collect()
    });

    let dropped = keep.iter().filter(|k| !**k).count() as u64;
    if dropped == 0 {
        return Ok(CompactionResult::default());
    }

    let mut compacted = Vec::with_capacity(data.len());
    let mut age_bytes = 0u64;
    let mut timestamps = false;
    for ((offset, header), keep) in entries.iter().zip(keep) {
        if !keep {
            continue;
        }
        let size = header.entry_size();
        compacted.extend_from_slice(&data[*offset..*offset + size]);
        if let Some(ts) = header.timestamp {
            timestamps = true;
            let age = now.saturating_sub(ts);
            if age < cold_threshold {
                age_bytes += u64::from(age) * size as u64;
            }
        }
    }

    let freed = (data.len() - compacted.len()) as u64;
    if compacted.is_empty() {
        log.free_segment(idx)?;
    } else {
        let age = if timestamps {
            (age_bytes / compacted.len() as u64) as u32
        } else {
            log.segment_headers()
                .get(idx)
                .map_or(0, |header| header.age(now))
        };
        log.update_segment(idx, &compacted, age)?;
    }

    debug!(
        "Compacted segment {} of {}: dropped {} entries, freed {} bytes",
        idx,
        log.file_name(),
        dropped,
        freed
    );
    Ok(CompactionResult {
        entries_dropped: dropped,
        bytes_freed: freed,
    })
}

/// Segment with the best cost-benefit score not yet compacted in this pass
pub fn choose_segment(log: &SecondaryLog, now: u32) -> Option<usize> {
    let segment_size = log.segment_size();
    log.reorg_candidates()
        .into_iter()
        .map(|(idx, header)| {
            let u = header.utilization(segment_size);
            // +1 keeps fresh segments comparable by utilization
            let age = f64::from(header.age(now)) + 1.0;
            (idx, (1.0 - u) * age / (1.0 + u))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(idx, _)| idx)
}

fn record(stats: Option<&ReorgStats>, result: CompactionResult) {
    if let Some(stats) = stats {
        stats.segments_compacted.fetch_add(1, Ordering::Relaxed);
        stats.entries_dropped.fetch_add(result.entries_dropped, Ordering::Relaxed);
        stats.bytes_freed.fetch_add(result.bytes_freed, Ordering::Relaxed);
    }
}

/// Compaction drops outdated entries, so the versions they carried must be
/// on disk first. Unwritten changes stay recorded for the next attempt.
fn persist_versions(log: &SecondaryLog) {
    if let Err(e) = log.flush_versions() {
        warn!("Failed to persist versions of {} before reorganization: {}", log.file_name(), e);
    }
}

/// Compact every segment of a log; returns the bytes freed
pub fn compact_all(log: &SecondaryLog, stats: Option<&ReorgStats>) -> Result<u64> {
    let _guard = log.lock_reorganization();
    persist_versions(log);
    log.set_phase(ReorgPhase::Compacting);

    let now = log.context().now_secs();
    let cold = log.context().config().cold_data_threshold_secs;
    let mut freed = 0;
    let mut outcome = Ok(());
    for idx in 0..log.segment_count() {
        match compact_segment(log, idx, now, cold) {
            Ok(result) => {
                freed += result.bytes_freed;
                record(stats, result);
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    log.reset_reorg_pass();
    log.set_phase(ReorgPhase::Idle);
    outcome.map(|()| freed)
}

/// Compact up to `max_segments` segments of a log, stopping early once
/// utilization is at or below `activate_percent` (unless `prompt`). Returns
/// `None` if the log was busy.
pub fn reorganize_log(
    log: &SecondaryLog,
    max_segments: usize,
    activate_percent: u8,
    prompt: bool,
    stats: Option<&ReorgStats>,
) -> Result<Option<u64>> {
    let Some(_guard) = log.try_lock_reorganization() else {
        return Ok(None);
    };
    persist_versions(log);

    let cold = log.context().config().cold_data_threshold_secs;
    let mut freed = 0;
    log.set_phase(ReorgPhase::Scanning);
    for _ in 0..max_segments {
        if !prompt && log.utilization() <= activate_percent {
            break;
        }
        let now = log.context().now_secs();
        let Some(idx) = choose_segment(log, now) else {
            // Pass complete
            log.reset_reorg_pass();
            break;
        };

        log.set_phase(ReorgPhase::Compacting);
        let result = compact_segment(log, idx, now, cold);
        log.set_phase(ReorgPhase::Scanning);
        match result {
            Ok(result) => {
                freed += result.bytes_freed;
                record(stats, result);
            }
            Err(e) => {
                log.set_phase(ReorgPhase::Idle);
                return Err(e);
            }
        }
    }
    log.set_phase(ReorgPhase::Idle);

    if let Some(stats) = stats {
        stats.logs_reorganized.fetch_add(1, Ordering::Relaxed);
    }
    Ok(Some(freed))
}

/// Background reorganization thread of one node
pub struct Reorganizer {
    requests: Sender<RangeKey>,
    stats: Arc<ReorgStats>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reorganizer {
    /// Start the reorganization thread
    pub fn start(ctx: Arc<LogContext>, catalog: Arc<LogCatalog>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(REQUEST_QUEUE_SIZE);
        let stats = Arc::new(ReorgStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            ctx,
            catalog,
            stats: Arc::clone(&stats),
            shutdown: Arc::clone(&shutdown),
        };
        let handle = thread::Builder::new()
            .name("chunklog-reorg".to_string())
            .spawn(move || worker.run(&receiver))
            .map_err(|e| Error::Internal(format!("failed to spawn reorganization thread: {}", e)))?;

        Ok(Self {
            requests: sender,
            stats,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for a prompt reorganization of a range's log; never blocks
    pub fn request(&self, key: RangeKey) {
        match self.requests.try_send(key) {
            Ok(()) => trace!("Requested reorganization of range {}", key),
            Err(TrySendError::Full(_)) => debug!("Reorganization queue full, dropping request for {}", key),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn stats(&self) -> &ReorgStats {
        &self.stats
    }

    /// Stop the thread after the segment in progress
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reorganizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    ctx: Arc<LogContext>,
    catalog: Arc<LogCatalog>,
    stats: Arc<ReorgStats>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    fn run(&self, requests: &Receiver<RangeKey>) {
        info!("Reorganization thread started");

        while !self.shutdown.load(Ordering::Acquire) {
            match requests.recv_timeout(IDLE_INTERVAL) {
                Ok(key) => match self.catalog.get_log(key.owner, key.range) {
                    Ok(log) => self.reorganize(&log, log.segment_count(), true),
                    Err(e) => debug!("Skipping reorganization request: {}", e),
                },
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(log) = self.most_utilized() {
                        let segments = (log.segment_count() / 3).max(1);
                        self.reorganize(&log, segments, false);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Reorganization thread stopped");
    }

    /// Fullest log above the activation threshold
    fn most_utilized(&self) -> Option<Arc<SecondaryLog>> {
        let activate = self.ctx.config().utilization_activate_reorganization;
        self.catalog
            .logs()
            .into_iter()
            .filter(|log| log.utilization() > activate)
            .max_by_key(|log| log.utilization())
    }

    fn reorganize(&self, log: &SecondaryLog, segments: usize, prompt: bool) {
        let activate = self.ctx.config().utilization_activate_reorganization;
        match reorganize_log(log, segments, activate, prompt, Some(&self.stats)) {
            Ok(Some(freed)) if freed > 0 => info!(
                "Reorganized {}: freed {} bytes, utilization now {}%",
                log.file_name(),
                freed,
                log.utilization()
            ),
            Ok(_) => {}
            Err(e) => error!("Reorganization of {} failed: {}", log.file_name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::header::{EntryHeader, EntryKind, LogShape};
    use chunklog_common::{ChunkId, Version};

    fn entries(log: &SecondaryLog, ids: &[(u64, u32)], size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for (lid, version) in ids {
            let header = EntryHeader {
                kind: EntryKind::Default,
                tombstone: false,
                range: 0,
                owner: 1,
                chunk_id: ChunkId::new(1, *lid),
                length: size as u32,
                version: Version::new(0, *version),
                timestamp: 0,
                checksum: 0,
                chain: None,
            };
            out.extend_from_slice(log.codec().encode(LogShape::Secondary, &header).unwrap().as_slice());
            out.extend(std::iter::repeat_n(*version as u8, size));
        }
        out
    }

    fn new_log(dir: &std::path::Path) -> SecondaryLog {
        SecondaryLog::create(test_context(dir), 1, 0, 1, false).unwrap()
    }

    #[test]
    fn test_compaction_drops_outdated_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        let data = entries(&log, &[(1, 1), (2, 1), (1, 2), (3, 1)], 100);
        log.append(&data).unwrap();
        log.with_versions(|v| {
            v.put(ChunkId::new(1, 1), Version::new(0, 2));
            v.put(ChunkId::new(1, 2), Version::new(0, 1));
        });

        let _guard = log.lock_reorganization();
        let result = compact_segment(&log, 0, 0, u32::MAX).unwrap();
        assert_eq!(result.entries_dropped, 1);

        let expected = entries(&log, &[(2, 1), (1, 2), (3, 1)], 100);
        assert_eq!(result.bytes_freed, (data.len() - expected.len()) as u64);
        assert_eq!(log.read_segment(0).unwrap(), expected);
        assert_eq!(log.occupied(), expected.len() as u64);
    }

    #[test]
    fn test_compaction_without_obsolete_entries_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        let data = entries(&log, &[(1, 3), (2, 1)], 200);
        log.append(&data).unwrap();
        log.with_versions(|v| v.put(ChunkId::new(1, 1), Version::new(0, 3)));

        let _guard = log.lock_reorganization();
        for _ in 0..3 {
            let result = compact_segment(&log, 0, 0, u32::MAX).unwrap();
            assert_eq!(result, CompactionResult::default());
            assert_eq!(log.read_segment(0).unwrap(), data);
        }
    }

    #[test]
    fn test_fully_obsolete_segment_is_freed() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        log.append(&entries(&log, &[(4, 1), (5, 1)], 50)).unwrap();
        log.with_versions(|v| {
            v.put(ChunkId::new(1, 4), Version::new(0, 2));
            v.put(ChunkId::new(1, 5), Version::new(0, 2));
        });

        let freed = compact_all(&log, None).unwrap();
        assert!(freed > 0);
        assert_eq!(log.occupied(), 0);
        assert!(log.segment_distribution().iter().all(|used| *used == 0));
        assert_eq!(log.phase(), ReorgPhase::Idle);
    }

    #[test]
    fn test_choose_prefers_sparse_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        // Large batches go to empty segments: 55 and 50 entries
        let dense: Vec<(u64, u32)> = (0..55).map(|lid| (lid, 1)).collect();
        let sparse: Vec<(u64, u32)> = (100..150).map(|lid| (lid, 1)).collect();
        log.append(&entries(&log, &dense, 1000)).unwrap();
        log.append(&entries(&log, &sparse, 1000)).unwrap();
        let dist = log.segment_distribution();
        assert!(dist[0] > dist[1] && dist[1] > 0);

        assert_eq!(choose_segment(&log, 0), Some(1));

        // Already compacted segments are skipped for the rest of the pass
        let _guard = log.lock_reorganization();
        compact_segment(&log, 1, 0, u32::MAX).unwrap();
        assert_eq!(choose_segment(&log, 0), Some(0));
        compact_segment(&log, 0, 0, u32::MAX).unwrap();
        assert_eq!(choose_segment(&log, 0), None);

        log.reset_reorg_pass();
        assert_eq!(choose_segment(&log, 0), Some(1));
    }

    #[test]
    fn test_reorganizer_serves_prompt_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let catalog = Arc::new(LogCatalog::new());
        let log = Arc::new(SecondaryLog::create(ctx.clone(), 1, 0, 1, false).unwrap());
        log.append(&entries(&log, &[(1, 1), (1, 2)], 500)).unwrap();
        log.with_versions(|v| v.put(ChunkId::new(1, 1), Version::new(0, 2)));
        let buffer = crate::secondary::SecondaryLogBuffer::new(log.clone(), 1024);
        catalog.insert_range(RangeKey::new(1, 0), Arc::new(buffer)).unwrap();

        let reorganizer = Reorganizer::start(ctx, catalog).unwrap();
        reorganizer.request(RangeKey::new(1, 0));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reorganizer.stats().snapshot().entries_dropped == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        reorganizer.shutdown();
        assert_eq!(reorganizer.stats().snapshot().entries_dropped, 1);
        assert_eq!(log.read_segment(0).unwrap(), entries(&log, &[(1, 2)], 500));
    }

    fn worker(dir: &std::path::Path, catalog: &Arc<LogCatalog>, activate: u8) -> Worker {
        let config = chunklog_common::LogConfig {
            utilization_activate_reorganization: activate,
            ..crate::context::test_config(dir)
        };
        Worker {
            ctx: LogContext::new(config, 1).unwrap(),
            catalog: Arc::clone(catalog),
            stats: Arc::new(ReorgStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_activation_requires_exceeding_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(LogCatalog::new());
        let log = Arc::new(new_log(dir.path()));
        for batch in 0..3u64 {
            let ids: Vec<(u64, u32)> = (batch * 50..(batch + 1) * 50).map(|lid| (lid, 1)).collect();
            log.append(&entries(&log, &ids, 1000)).unwrap();
        }
        let buffer = crate::secondary::SecondaryLogBuffer::new(log.clone(), 1024);
        catalog.insert_range(RangeKey::new(1, 0), Arc::new(buffer)).unwrap();

        let utilization = log.utilization();
        assert!(utilization > 1 && utilization < 75);

        // A log sitting exactly at the threshold is left alone
        assert!(worker(dir.path(), &catalog, utilization).most_utilized().is_none());
        let chosen = worker(dir.path(), &catalog, utilization - 1).most_utilized().unwrap();
        assert!(Arc::ptr_eq(&chosen, &log));

        let freed = reorganize_log(&log, 8, utilization, false, None).unwrap();
        assert_eq!(freed, Some(0));
        assert_eq!(log.utilization(), utilization);
    }
}
