//! Log engine
//!
//! Owns the write buffer, the primary log, the catalog of secondary logs
//! and the reorganizer of one node, and exposes the backup operations.
//!
//! ```text
//!  log_chunks ──► PrimaryWriteBuffer ──flush──► BatchRouter ──► SecondaryLogBuffer ──► SecondaryLog
//!                                                   │                                     ▲
//!                                                   └──► PrimaryLog          Reorganizer ─┘
//! ```

use crate::catalog::LogCatalog;
use crate::context::LogContext;
use crate::header::{ChainLink, EntryHeader, EntryKind, LogShape};
use crate::messages::decode_chunks;
use crate::primary::PrimaryLog;
use crate::range_map::BatchRouter;
use crate::recovery::{self, RecoveryResult};
use crate::reorg::{ReorgStatsSnapshot, Reorganizer};
use crate::secondary::{LogFileName, ReorgPhase, SecondaryLog, SecondaryLogBuffer};
use crate::write_buffer::{PrimaryWriteBuffer, WriteBufferStatsSnapshot};
use chunklog_common::{
    ChunkId, Error, LogConfig, NodeId, RangeId, RangeKey, Result, Version, compute_payload_crc,
};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Engine counters
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub ranges: usize,
    pub write_buffer: WriteBufferStatsSnapshot,
    pub reorganization: ReorgStatsSnapshot,
}

/// Backup log engine of one node
pub struct LogEngine {
    ctx: Arc<LogContext>,
    catalog: Arc<LogCatalog>,
    primary: Arc<PrimaryLog>,
    router: Arc<BatchRouter>,
    write_buffer: PrimaryWriteBuffer,
    reorganizer: Reorganizer,
    stopped: AtomicBool,
}

impl LogEngine {
    /// Validate the configuration, reopen existing secondary logs and start
    /// the background threads
    pub fn start(config: LogConfig, node_id: NodeId) -> Result<Self> {
        let ctx = LogContext::new(config, node_id)?;
        let catalog = Arc::new(LogCatalog::new());
        let primary = Arc::new(PrimaryLog::create(&ctx)?);
        let reopened = reopen_logs(&ctx, &catalog)?;

        let router = Arc::new(BatchRouter::new(ctx.clone(), catalog.clone(), primary.clone()));
        let write_buffer = PrimaryWriteBuffer::start(&ctx, router.clone())?;
        let reorganizer = Reorganizer::start(ctx.clone(), catalog.clone())?;

        info!(
            "Log engine of node 0x{:04X} started in {} ({} secondary logs reopened)",
            node_id,
            ctx.config().backup_directory.display(),
            reopened
        );

        Ok(Self {
            ctx,
            catalog,
            primary,
            router,
            write_buffer,
            reorganizer,
            stopped: AtomicBool::new(false),
        })
    }

    /// ID of the node running this engine
    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn config(&self) -> &LogConfig {
        self.ctx.config()
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Create a range for chunks created by `owner`
    pub fn init_backup_range(&self, owner: NodeId, range: RangeId) -> Result<()> {
        self.create_range(owner, range, owner, false)
    }

    /// Create a range for chunks migrated to `owner` from other nodes
    pub fn init_migration_backup_range(&self, owner: NodeId, range: RangeId) -> Result<()> {
        self.create_range(owner, range, owner, true)
    }

    fn create_range(&self, owner: NodeId, range: RangeId, original_owner: NodeId, migration: bool) -> Result<()> {
        self.check_running()?;
        if self.catalog.contains(owner, range) {
            return Err(Error::RangeAlreadyExists { owner, range });
        }
        let log = SecondaryLog::create(self.ctx.clone(), owner, range, original_owner, migration)?;
        register(&self.ctx, &self.catalog, log)?;
        info!(
            "Initialized backup range {} (creator 0x{:04X}{})",
            RangeKey::new(owner, range),
            original_owner,
            if migration { ", migration" } else { "" }
        );
        Ok(())
    }

    /// Take over a range after a node failure.
    ///
    /// With `is_new_range` a fresh range for `new_owner` is created that
    /// holds chunks created by `original_owner`. Otherwise the existing log
    /// of `original_owner`/`original_range` is handed to `new_owner`/`range`.
    pub fn init_recovered_backup_range(
        &self,
        range: RangeId,
        original_range: RangeId,
        original_owner: NodeId,
        new_owner: NodeId,
        is_new_range: bool,
    ) -> Result<()> {
        self.check_running()?;
        if is_new_range {
            return self.create_range(new_owner, range, original_owner, false);
        }

        if self.catalog.contains(new_owner, range) {
            return Err(Error::RangeAlreadyExists {
                owner: new_owner,
                range,
            });
        }
        if let Err(e) = self.write_buffer.flush() {
            warn!("Flushing before transferring range {}: {}", range, e);
        }

        let buffer = self.catalog.remove_buffer_and_log(original_owner, original_range)?;
        buffer.flush()?;
        let old = RangeKey::new(original_owner, original_range);
        let new = RangeKey::new(new_owner, range);
        if let Err(e) = buffer.log().transfer(new_owner, range) {
            // Keep serving the range under its old name
            self.catalog.insert_range(old, buffer)?;
            return Err(e);
        }
        self.router.forget(old);
        self.catalog.insert_range(new, buffer)?;
        info!("Transferred backup range {} to {}", old, new);
        Ok(())
    }

    /// Delete a range and its log
    pub fn remove_backup_range(&self, owner: NodeId, range: RangeId) -> Result<()> {
        if let Err(e) = self.write_buffer.flush() {
            warn!("Flushing before removing range {}: {}", range, e);
        }
        self.catalog.remove_and_close_buffer_and_log(owner, range)?;
        self.router.forget(RangeKey::new(owner, range));
        Ok(())
    }

    /// Log the chunks of a log message: `count` records of
    /// `chunk_id u64 | length u32 | payload`. Versions are assigned here.
    pub fn log_chunks(&self, owner: NodeId, range: RangeId, count: usize, payload: &[u8]) -> Result<usize> {
        self.check_running()?;
        let log = self.range_log(owner, range)?;
        let chunks = decode_chunks(payload, count)?;
        for (chunk_id, data) in &chunks {
            self.check_chunk(&log, *chunk_id, data.len())?;
        }

        for (chunk_id, data) in &chunks {
            let version = log.with_versions(|v| v.next_version(*chunk_id));
            self.write_entry(&log, *chunk_id, version, data, false)?;
        }
        self.maybe_request_reorganization(&log);
        Ok(chunks.len())
    }

    /// Log one chunk with a version chosen by the caller
    pub fn put_chunk(
        &self,
        owner: NodeId,
        range: RangeId,
        chunk_id: ChunkId,
        version: Version,
        payload: &[u8],
    ) -> Result<()> {
        self.check_running()?;
        let log = self.range_log(owner, range)?;
        self.check_chunk(&log, chunk_id, payload.len())?;
        log.with_versions(|v| v.put_max(chunk_id, version));
        self.write_entry(&log, chunk_id, version, payload, false)?;
        self.maybe_request_reorganization(&log);
        Ok(())
    }

    /// Log tombstones for removed chunks
    pub fn remove_chunks(&self, owner: NodeId, range: RangeId, chunk_ids: &[ChunkId]) -> Result<usize> {
        self.check_running()?;
        let log = self.range_log(owner, range)?;
        for chunk_id in chunk_ids {
            self.check_chunk(&log, *chunk_id, 0)?;
        }
        for chunk_id in chunk_ids {
            let version = log.with_versions(|v| v.next_version(*chunk_id));
            self.write_entry(&log, *chunk_id, version, &[], true)?;
        }
        debug!("Logged {} tombstones for range {}", chunk_ids.len(), log.key());
        Ok(chunk_ids.len())
    }

    fn range_log(&self, owner: NodeId, range: RangeId) -> Result<Arc<SecondaryLog>> {
        self.catalog.get_log(owner, range).inspect_err(|e| {
            error!("Cannot log to range {}: {}", RangeKey::new(owner, range), e);
        })
    }

    fn check_chunk(&self, log: &SecondaryLog, chunk_id: ChunkId, size: usize) -> Result<()> {
        let max = (self.ctx.config().max_chunk_size as usize).min(u32::MAX as usize);
        if size > max {
            return Err(Error::EntryTooLarge { size, max });
        }
        if !log.is_migration() && chunk_id.creator() != log.original_owner() {
            return Err(Error::invalid_argument(format!(
                "chunk {} was not created by 0x{:04X}, the creator of range {}",
                chunk_id,
                log.original_owner(),
                log.key()
            )));
        }
        Ok(())
    }

    fn write_entry(
        &self,
        log: &SecondaryLog,
        chunk_id: ChunkId,
        version: Version,
        payload: &[u8],
        tombstone: bool,
    ) -> Result<()> {
        let key = log.key();
        let codec = self.ctx.codec();
        let format = codec.format();
        let mut header = EntryHeader {
            kind: if log.is_migration() {
                EntryKind::Migration
            } else {
                EntryKind::Default
            },
            tombstone,
            range: key.range,
            owner: key.owner,
            chunk_id,
            length: payload.len() as u32,
            version,
            timestamp: if format.timestamps { self.ctx.now_secs() } else { 0 },
            checksum: 0,
            chain: None,
        };
        let checksum = |part: &[u8]| if format.checksums { compute_payload_crc(part) } else { 0 };

        let max_entry = self.ctx.config().max_log_entry_size() as usize;
        let Some((link_size, count)) = codec.chain_layout(&header, max_entry)? else {
            header.checksum = checksum(payload);
            let encoded = codec.encode(LogShape::Primary, &header)?;
            return self.write_buffer.put(&encoded, payload);
        };

        // Links share chunk ID and version; each has its own checksum
        let mut links = Vec::with_capacity(usize::from(count));
        for (index, part) in payload.chunks(link_size).enumerate() {
            let link = EntryHeader {
                length: part.len() as u32,
                checksum: checksum(part),
                chain: Some(ChainLink {
                    index: index as u8,
                    count,
                }),
                ..header
            };
            links.push((codec.encode(LogShape::Primary, &link)?, part));
        }
        debug!(
            "Chunk {} of {} bytes split into {} entries",
            chunk_id,
            payload.len(),
            count
        );
        self.write_buffer.put_entries(&links)
    }

    fn maybe_request_reorganization(&self, log: &SecondaryLog) {
        if log.utilization() > self.ctx.config().utilization_prompt_reorganization {
            self.reorganizer.request(log.key());
        }
    }

    /// Recover a range on a dedicated thread, then delete it
    pub fn recover_backup_range(&self, owner: NodeId, range: RangeId) -> Result<RecoveryResult> {
        let key = RangeKey::new(owner, range);
        let buffer = self.catalog.get_buffer(owner, range)?;
        let started = Instant::now();

        if let Err(e) = self.write_buffer.flush() {
            warn!("Flushing the write buffer before recovering {}: {}", key, e);
        }
        // Flushed before the reorganization lock is taken; appends may
        // reorganize inline
        if let Err(e) = buffer.flush() {
            warn!("Flushing the buffer of range {} failed, recovering what is on disk: {}", key, e);
        }

        let log = buffer.log().clone();
        let result = thread::Builder::new()
            .name(format!("chunklog-recovery-{:04x}-{}", owner, range))
            .spawn(move || {
                let _guard = log.lock_reorganization();
                recovery::recover_log(&log)
            })
            .map_err(|e| Error::Internal(format!("failed to spawn recovery thread: {}", e)))?
            .join()
            .map_err(|_| Error::internal(format!("recovery of range {key} panicked")))?;

        self.catalog.remove_and_close_buffer_and_log(owner, range)?;
        self.router.forget(key);

        info!(
            "Recovered range {}: {} chunks ({} bytes) in {} ID ranges, {:?}",
            key,
            result.count(),
            result.total_bytes(),
            result.chunk_id_ranges.len(),
            started.elapsed()
        );
        if !result.is_complete() {
            warn!(
                "Recovery of range {} was partial: {} corrupted entries, {} truncated and {} unreadable segments",
                key, result.corrupted_entries, result.truncated_segments, result.failed_segments
            );
        }
        Ok(result)
    }

    /// Recover from a log file in `dir` without touching the catalog
    pub fn recover_backup_range_from_file(&self, file_name: &str, dir: &Path) -> Result<RecoveryResult> {
        let config = LogConfig {
            backup_directory: dir.to_path_buf(),
            ..self.ctx.config().clone()
        };
        recovery::recover_from_file(config, file_name)
    }

    /// Approximate secondary header size of a chunk created by `creator`
    pub fn approx_header_size(&self, creator: NodeId, local_id: u64, size: u32) -> usize {
        self.ctx
            .codec()
            .approx_secondary_header_size(creator != self.ctx.node_id(), local_id, size)
    }

    /// Log of a registered range
    pub fn log(&self, owner: NodeId, range: RangeId) -> Result<Arc<SecondaryLog>> {
        self.catalog.get_log(owner, range)
    }

    /// Human-readable report of all logs
    pub fn current_utilization(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Primary log: {} of {} bytes",
            self.primary.occupied(),
            self.primary.size()
        );
        let _ = writeln!(
            out,
            "Write buffer: {} of {} bytes pending",
            self.write_buffer.pending(),
            self.write_buffer.capacity()
        );

        let mut current_owner = None;
        for (key, buffer) in self.catalog.buffers() {
            if current_owner != Some(key.owner) {
                let _ = writeln!(out, "Backup ranges of 0x{:04X}:", key.owner);
                current_owner = Some(key.owner);
            }
            let log = buffer.log();
            let phase = log.phase();
            let _ = writeln!(
                out,
                "  Range {}{}: {} of {} bytes ({}%), {} bytes buffered{}",
                key.range,
                if log.is_migration() { " (migration)" } else { "" },
                log.occupied(),
                log.capacity(),
                log.utilization(),
                buffer.occupied(),
                if phase == ReorgPhase::Idle {
                    String::new()
                } else {
                    format!(", reorganizing ({phase:?})")
                }
            );
            let _ = writeln!(out, "    Segments: {:?}", log.segment_distribution());
        }
        out
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ranges: self.catalog.len(),
            write_buffer: self.write_buffer.stats().snapshot(),
            reorganization: self.reorganizer.stats().snapshot(),
        }
    }

    /// Move all buffered entries to the secondary logs' buffers
    pub fn flush(&self) -> Result<()> {
        self.write_buffer.flush()
    }

    /// Move all buffered entries to the secondary logs on disk
    pub fn flush_all(&self) -> Result<()> {
        self.write_buffer.flush()?;
        for (_, buffer) in self.catalog.buffers() {
            buffer.flush()?;
        }
        self.primary.reset()
    }

    /// Flush everything and stop the background threads. Logs are closed
    /// but kept on disk.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down log engine of node 0x{:04X}", self.ctx.node_id());

        self.reorganizer.shutdown();
        self.write_buffer.shutdown();
        for (key, buffer) in self.catalog.buffers() {
            if let Err(e) = buffer.flush() {
                error!("Failed to flush range {} on shutdown: {}", key, e);
            }
            if let Err(e) = buffer.log().close() {
                error!("Failed to close log of range {}: {}", key, e);
            }
        }
        if let Err(e) = self.primary.sync() {
            warn!("Failed to sync primary log: {}", e);
        }
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register(ctx: &LogContext, catalog: &LogCatalog, log: SecondaryLog) -> Result<()> {
    let key = log.key();
    let capacity = ctx.config().secondary_log_buffer_size as usize;
    let buffer = SecondaryLogBuffer::new(Arc::new(log), capacity);
    catalog.insert_range(key, Arc::new(buffer))
}

/// Register the secondary logs left in the backup directory
fn reopen_logs(ctx: &Arc<LogContext>, catalog: &LogCatalog) -> Result<usize> {
    let format = ctx.codec().format();
    let mut reopened = 0;
    for name in ctx.access().list_logs()? {
        let Ok(parsed) = LogFileName::parse(&name) else {
            continue;
        };
        if parsed.format() != format {
            warn!("Ignoring {}: written with a different header format", name);
            continue;
        }
        match SecondaryLog::open(ctx.clone(), &name).and_then(|log| register(ctx, catalog, log)) {
            Ok(()) => reopened += 1,
            Err(e) => warn!("Failed to reopen {}: {}", name, e),
        }
    }
    Ok(reopened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_config;
    use crate::messages::encode_chunks;

    fn engine(dir: &Path) -> LogEngine {
        LogEngine::start(test_config(dir), 1).unwrap()
    }

    #[test]
    fn test_log_flush_recover() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 0).unwrap();

        let chunks: Vec<(ChunkId, Vec<u8>)> = (0..20u64)
            .map(|lid| (ChunkId::new(2, lid), vec![lid as u8; 64]))
            .collect();
        let payload = encode_chunks(chunks.iter().map(|(id, data)| (*id, data.as_slice())));
        assert_eq!(engine.log_chunks(2, 0, chunks.len(), &payload).unwrap(), 20);

        let result = engine.recover_backup_range(2, 0).unwrap();
        assert_eq!(result.count(), 20);
        for (recovered, (id, data)) in result.chunks.iter().zip(&chunks) {
            assert_eq!(recovered.chunk_id, *id);
            assert_eq!(&recovered.payload, data);
            assert_eq!(recovered.version, Version::first(0));
        }
        assert_eq!(result.chunk_id_ranges, vec![(ChunkId::new(2, 0), ChunkId::new(2, 19))]);
        assert!(engine.log(2, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_creator_range_rejects_foreign_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 0).unwrap();

        let payload = encode_chunks([(ChunkId::new(3, 1), &b"x"[..])]);
        let err = engine.log_chunks(2, 0, 1, &payload).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        engine.init_migration_backup_range(2, 1).unwrap();
        assert_eq!(engine.log_chunks(2, 1, 1, &payload).unwrap(), 1);
        let result = engine.recover_backup_range(2, 1).unwrap();
        assert_eq!(result.chunks[0].chunk_id, ChunkId::new(3, 1));
    }

    #[test]
    fn test_duplicate_and_unknown_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 0).unwrap();
        assert!(matches!(
            engine.init_backup_range(2, 0),
            Err(Error::RangeAlreadyExists { .. })
        ));
        assert!(engine.log_chunks(5, 5, 0, &[]).unwrap_err().is_not_found());
        assert!(engine.remove_backup_range(5, 5).is_err());

        engine.remove_backup_range(2, 0).unwrap();
        assert!(engine.log(2, 0).is_err());
    }

    #[test]
    fn test_transfer_recovered_range() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 3).unwrap();
        let payload = encode_chunks([(ChunkId::new(2, 1), &b"data"[..])]);
        engine.log_chunks(2, 3, 1, &payload).unwrap();

        // Node 2 failed, node 4 takes over its range 3 as range 9
        engine.init_recovered_backup_range(9, 3, 2, 4, false).unwrap();
        assert!(engine.log(2, 3).is_err());
        let log = engine.log(4, 9).unwrap();
        assert_eq!(log.original_owner(), 2);

        let result = engine.recover_backup_range(4, 9).unwrap();
        assert_eq!(result.count(), 1);
        assert_eq!(result.chunks[0].payload, b"data");

        // A new range for node 4 holding chunks created by node 2
        engine.init_recovered_backup_range(10, 3, 2, 4, true).unwrap();
        let payload = encode_chunks([(ChunkId::new(2, 7), &b"more"[..])]);
        assert_eq!(engine.log_chunks(4, 10, 1, &payload).unwrap(), 1);
    }

    #[test]
    fn test_utilization_report() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 0).unwrap();
        engine.init_migration_backup_range(3, 1).unwrap();

        let report = engine.current_utilization();
        assert!(report.starts_with("Primary log: "));
        assert!(report.contains("Backup ranges of 0x0002:"));
        assert!(report.contains("Range 1 (migration)"));
        assert!(report.contains("Segments: [0, 0, 0, 0, 0, 0, 0, 0]"));
    }

    #[test]
    fn test_approx_header_size() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        // Own chunk: type, 1 byte ID, 1 byte length, epoch, version, timestamp, CRC
        assert_eq!(engine.approx_header_size(1, 5, 10), 14);
        // Foreign chunks carry their creator
        assert_eq!(engine.approx_header_size(2, 5, 10), 16);
    }

    #[test]
    fn test_operations_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.init_backup_range(2, 0).unwrap();
        engine.shutdown();
        assert!(matches!(engine.init_backup_range(2, 1), Err(Error::ShuttingDown)));
        assert!(matches!(engine.log_chunks(2, 0, 0, &[]), Err(Error::ShuttingDown)));
    }
}
