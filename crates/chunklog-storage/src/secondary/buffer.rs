//! Staging buffer in front of a secondary log
//!
//! Small flushes from the write buffer are collected here and written to
//! the secondary log in one access once the buffer is (nearly) full.
//! Entries that could not be written stay buffered; a batch that failed to
//! go along with them is rejected and reported to the caller.

use super::log::SecondaryLog;
use chunklog_common::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Buffer of converted (secondary-shape) entries of one range
pub struct SecondaryLogBuffer {
    log: Arc<SecondaryLog>,
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
}

impl SecondaryLogBuffer {
    pub fn new(log: Arc<SecondaryLog>, capacity: usize) -> Self {
        Self {
            log,
            capacity,
            buffer: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// The log behind this buffer
    pub const fn log(&self) -> &Arc<SecondaryLog> {
        &self.log
    }

    /// Bytes currently buffered
    pub fn occupied(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Buffer `data`; when the buffer would fill up, its content and `data`
    /// are written to the log together. Returns whether the log was written.
    pub fn buffer_data(&self, data: &[u8]) -> Result<bool> {
        let mut buffer = self.buffer.lock();
        if buffer.len() + data.len() + 1 < self.capacity {
            buffer.extend_from_slice(data);
            return Ok(false);
        }

        let kept = buffer.len();
        buffer.extend_from_slice(data);
        if let Err(e) = self.log.append(&buffer) {
            buffer.truncate(kept);
            return Err(e);
        }
        buffer.clear();
        Ok(true)
    }

    /// Write `data` straight to the log, preceded by whatever is buffered
    pub fn flush_all_data(&self, data: &[u8]) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return self.log.append(data);
        }

        if buffer.len() + data.len() <= self.log.segment_size() {
            // One access for both
            let kept = buffer.len();
            buffer.extend_from_slice(data);
            if let Err(e) = self.log.append(&buffer) {
                buffer.truncate(kept);
                return Err(e);
            }
            buffer.clear();
            return Ok(());
        }

        self.log.append(&buffer)?;
        buffer.clear();
        self.log.append(data)
    }

    /// Write buffered entries to the log
    pub fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }
        self.log.append(&buffer)?;
        buffer.clear();
        Ok(())
    }
}
