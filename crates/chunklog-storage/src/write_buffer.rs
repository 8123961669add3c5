//! Primary write buffer
//!
//! All chunks logged on this node pass through one circular buffer of
//! primary-shape entries. Writers append under a single lock and block while
//! the buffer lacks space. A flush thread hands the pending bytes to a
//! [`FlushSink`] when the buffer reaches its threshold, when the flush
//! timeout elapses, or when a flush is requested explicitly.
//!
//! ```text
//!            read_pos                 write_pos
//!               v                        v
//! +-------------+========================+---------------+
//! |   (free)    |  pending entries       |    (free)     |
//! +-------------+========================+---------------+
//! ```
//!
//! Entries may wrap around the end of the buffer; the sink receives a
//! snapshot of the whole ring together with the start offset.
//!
//! A failed background flush is latched and returned to the next writer, so
//! a log that ran full is reported to a caller instead of being dropped
//! silently.

use crate::context::LogContext;
use crate::header::EncodedHeader;
use chunklog_common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fill level (percent) waking the flush thread
const FLUSH_THRESHOLD_PERCENT: usize = 80;

/// Consumer of flushed entries
pub trait FlushSink: Send + Sync {
    /// Process `len` bytes of primary-shape entries starting at `start` in
    /// the circular buffer `ring`. Entries wrap at `ring.len()`.
    fn process(&self, ring: &[u8], start: usize, len: usize) -> Result<()>;
}

/// Write buffer counters
#[derive(Debug, Default)]
pub struct WriteBufferStats {
    pub entries: AtomicU64,
    pub bytes: AtomicU64,
    pub flushes: AtomicU64,
    pub failed_flushes: AtomicU64,
    /// Writes that waited for space
    pub blocked_writes: AtomicU64,
}

impl WriteBufferStats {
    pub fn snapshot(&self) -> WriteBufferStatsSnapshot {
        WriteBufferStatsSnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            blocked_writes: self.blocked_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriteBufferStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferStatsSnapshot {
    pub entries: u64,
    pub bytes: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub blocked_writes: u64,
}

struct Ring {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    pending: usize,
    flush_requested: bool,
}

impl Ring {
    fn free(&self) -> usize {
        self.data.len() - self.pending
    }

    fn push(&mut self, bytes: &[u8]) {
        let cap = self.data.len();
        let first = bytes.len().min(cap - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.write_pos = (self.write_pos + bytes.len()) % cap;
        self.pending += bytes.len();
    }
}

struct Shared {
    ring: Mutex<Ring>,
    /// Wakes the flush thread
    data_available: Condvar,
    /// Wakes writers waiting for space
    space_available: Condvar,
    /// Serializes flush rounds; holds the snapshot ring
    flush_lock: Mutex<Vec<u8>>,
    sink: Arc<dyn FlushSink>,
    /// First error of a background flush not yet reported to a writer
    failure: Mutex<Option<Error>>,
    shutdown: AtomicBool,
    stats: WriteBufferStats,
}

impl Shared {
    /// Hand everything pending to the sink and release its space
    fn flush_round(&self) -> Result<usize> {
        let mut snapshot = self.flush_lock.lock();

        let (start, len) = {
            let ring = self.ring.lock();
            if ring.pending == 0 {
                return Ok(0);
            }
            let cap = ring.data.len();
            let (start, len) = (ring.read_pos, ring.pending);
            let first = len.min(cap - start);
            snapshot[start..start + first].copy_from_slice(&ring.data[start..start + first]);
            snapshot[..len - first].copy_from_slice(&ring.data[..len - first]);
            (start, len)
        };

        let result = self.sink.process(&snapshot, start, len);

        {
            let mut ring = self.ring.lock();
            let cap = ring.data.len();
            ring.read_pos = (ring.read_pos + len) % cap;
            ring.pending -= len;
        }
        self.space_available.notify_all();

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        result.map(|()| len)
    }

    /// Keep a background flush error for the next writer
    fn latch(&self, err: Error) {
        error!("Background flush of the write buffer failed: {}", err);
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

/// Circular buffer in front of all secondary logs
pub struct PrimaryWriteBuffer {
    shared: Arc<Shared>,
    capacity: usize,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PrimaryWriteBuffer {
    /// Create the buffer and start its flush thread
    pub fn start(ctx: &Arc<LogContext>, sink: Arc<dyn FlushSink>) -> Result<Self> {
        let capacity = usize::try_from(ctx.config().write_buffer_size)
            .map_err(|_| Error::configuration("write buffer size exceeds the address space"))?;
        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                data: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
                pending: 0,
                flush_requested: false,
            }),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            flush_lock: Mutex::new(vec![0u8; capacity]),
            sink,
            failure: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            stats: WriteBufferStats::default(),
        });

        let buffer = Self {
            shared,
            capacity,
            handle: Mutex::new(None),
        };
        buffer.start_flush_thread(ctx.config().flush_timeout())?;
        Ok(buffer)
    }

    fn start_flush_thread(&self, timeout: Duration) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let threshold = self.capacity * FLUSH_THRESHOLD_PERCENT / 100;

        let handle = thread::Builder::new()
            .name("chunklog-flush".to_string())
            .spawn(move || {
                info!("Write buffer flush thread started");

                loop {
                    {
                        let mut ring = shared.ring.lock();
                        if ring.pending < threshold
                            && !ring.flush_requested
                            && !shared.shutdown.load(Ordering::Acquire)
                        {
                            shared.data_available.wait_for(&mut ring, timeout);
                        }
                        ring.flush_requested = false;
                    }

                    if shared.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = shared.flush_round() {
                        shared.latch(e);
                    }
                }

                info!("Write buffer flush thread stopped");
            })
            .map_err(|e| Error::Internal(format!("failed to spawn flush thread: {}", e)))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Buffer size in bytes
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes waiting to be flushed
    pub fn pending(&self) -> usize {
        self.shared.ring.lock().pending
    }

    pub fn stats(&self) -> &WriteBufferStats {
        &self.shared.stats
    }

    /// Append one entry. Blocks while the buffer lacks space.
    ///
    /// Fails with the error of an earlier background flush if one has not
    /// been reported yet; the entry is not buffered in that case.
    pub fn put(&self, header: &EncodedHeader, payload: &[u8]) -> Result<()> {
        self.put_entries(&[(*header, payload)])
    }

    /// Append several entries in one reservation. A flush round never
    /// separates them.
    pub fn put_entries(&self, entries: &[(EncodedHeader, &[u8])]) -> Result<()> {
        let total: usize = entries
            .iter()
            .map(|(header, payload)| header.len() + payload.len())
            .sum();
        if total > self.capacity {
            return Err(Error::EntryTooLarge {
                size: total,
                max: self.capacity,
            });
        }
        if let Some(err) = self.shared.take_failure() {
            return Err(err);
        }

        let mut ring = self.shared.ring.lock();
        if ring.free() < total {
            self.shared.stats.blocked_writes.fetch_add(1, Ordering::Relaxed);
            while ring.free() < total {
                if self.shared.shutdown.load(Ordering::Acquire) {
                    return Err(Error::ShuttingDown);
                }
                ring.flush_requested = true;
                self.shared.data_available.notify_one();
                self.shared.space_available.wait(&mut ring);
            }
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        for (header, payload) in entries {
            ring.push(header.as_slice());
            ring.push(payload);
        }
        let pending = ring.pending;
        drop(ring);

        self.shared
            .stats
            .entries
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        self.shared.stats.bytes.fetch_add(total as u64, Ordering::Relaxed);
        if pending >= self.capacity * FLUSH_THRESHOLD_PERCENT / 100 {
            self.shared.data_available.notify_one();
        }
        Ok(())
    }

    /// Flush everything buffered before this call, in the calling thread.
    /// Also reports a background flush failure not seen by a writer yet.
    pub fn flush(&self) -> Result<()> {
        let round = self.shared.flush_round();
        if let Some(err) = self.shared.take_failure() {
            return Err(err);
        }
        let flushed = round?;
        if flushed > 0 {
            debug!("Flushed {} bytes from the write buffer", flushed);
        }
        Ok(())
    }

    /// Flush remaining entries and stop the flush thread
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _ring = self.shared.ring.lock();
            self.shared.data_available.notify_all();
            self.shared.space_available.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.shared.flush_round() {
            warn!("Final write buffer flush failed: {}", e);
        }
        if let Some(e) = self.shared.take_failure() {
            warn!("Unreported write buffer flush failure at shutdown: {}", e);
        }
    }
}

impl Drop for PrimaryWriteBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
