//! Routing of flushed write buffer entries to their ranges
//!
//! A flush walks the pending primary-shape entries once. Every entry is
//! converted to the secondary shape and appended to its range's batch in a
//! [`RangeBufferMap`]; the batches are then handed to the secondary log
//! buffers. Batches keep their allocations between flushes.

use crate::catalog::LogCatalog;
use crate::context::LogContext;
use crate::header::{CONVERSION_OFFSET, LogShape, convert_primary_to_secondary, secondary_entry_size};
use crate::primary::PrimaryLog;
use crate::write_buffer::FlushSink;
use chunklog_common::{Error, MAX_LOG_ENTRY_HEADER_SIZE, RangeKey, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Entries of one range collected during a flush
#[derive(Debug, Default)]
pub struct RangeBatch {
    /// Secondary-shape entries
    pub converted: Vec<u8>,
    /// The same entries in primary shape
    pub primary: Vec<u8>,
    pub entries: usize,
}

impl RangeBatch {
    fn clear(&mut self) {
        self.converted.clear();
        self.primary.clear();
        self.entries = 0;
    }

    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Range key to batch map, pre-sized and reused across flushes
#[derive(Debug)]
pub struct RangeBufferMap {
    batches: HashMap<RangeKey, RangeBatch>,
}

impl RangeBufferMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            batches: HashMap::with_capacity(capacity),
        }
    }

    /// Batch of a range, created on first use
    pub fn batch_mut(&mut self, key: RangeKey) -> &mut RangeBatch {
        self.batches.entry(key).or_default()
    }

    /// Empty all batches, keeping their buffers
    pub fn reset(&mut self) {
        self.batches.values_mut().for_each(RangeBatch::clear);
    }

    /// Drop the batch of a removed range
    pub fn remove(&mut self, key: RangeKey) {
        self.batches.remove(&key);
    }

    /// Non-empty batches, ordered by range key
    pub fn pending(&self) -> Vec<(RangeKey, &RangeBatch)> {
        let mut pending: Vec<_> = self
            .batches
            .iter()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(key, batch)| (*key, batch))
            .collect();
        pending.sort_by_key(|(key, _)| *key);
        pending
    }

    /// Number of ranges with a batch allocated
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Copy `len` bytes starting at `start` out of a circular buffer
fn copy_wrapped(ring: &[u8], start: usize, len: usize, out: &mut Vec<u8>) {
    let first = len.min(ring.len() - start);
    out.extend_from_slice(&ring[start..start + first]);
    out.extend_from_slice(&ring[..len - first]);
}

/// [`FlushSink`] demultiplexing entries into secondary log buffers
pub struct BatchRouter {
    ctx: Arc<LogContext>,
    catalog: Arc<LogCatalog>,
    primary: Arc<PrimaryLog>,
    map: Mutex<RangeBufferMap>,
}

impl BatchRouter {
    pub fn new(ctx: Arc<LogContext>, catalog: Arc<LogCatalog>, primary: Arc<PrimaryLog>) -> Self {
        Self {
            ctx,
            catalog,
            primary,
            map: Mutex::new(RangeBufferMap::with_capacity(64)),
        }
    }

    /// Forget the batch buffers of a removed range
    pub fn forget(&self, key: RangeKey) {
        self.map.lock().remove(key);
    }

    /// Split the pending entries into per-range batches
    fn collect(&self, map: &mut RangeBufferMap, ring: &[u8], start: usize, len: usize) -> Result<()> {
        let codec = self.ctx.codec();
        let cap = ring.len();
        let mut header = [0u8; MAX_LOG_ENTRY_HEADER_SIZE];
        let mut pos = start;
        let mut remaining = len;

        while remaining > 0 {
            // The header itself may wrap
            let avail = remaining.min(MAX_LOG_ENTRY_HEADER_SIZE);
            for (i, byte) in header.iter_mut().enumerate().take(avail) {
                *byte = ring[(pos + i) % cap];
            }
            let decoded = codec.decode(&header[..avail], 0, LogShape::Primary, true)?;
            let entry_size = decoded.entry_size();
            if entry_size > remaining {
                return Err(Error::corruption(format!(
                    "write buffer entry at {pos} with {entry_size} bytes exceeds the {remaining} pending bytes"
                )));
            }

            let key = RangeKey::new(
                decoded.owner.unwrap_or_default(),
                decoded.range.unwrap_or_default(),
            );
            let batch = map.batch_mut(key);
            let out = batch.converted.len();
            batch.converted.resize(out + secondary_entry_size(entry_size), 0);
            convert_primary_to_secondary(
                ring,
                pos,
                &mut batch.converted,
                out,
                entry_size,
                cap - pos,
                CONVERSION_OFFSET,
            )?;
            copy_wrapped(ring, pos, entry_size, &mut batch.primary);
            batch.entries += 1;

            pos = (pos + entry_size) % cap;
            remaining -= entry_size;
        }
        Ok(())
    }

    /// Stage a small batch and keep a copy in the primary log unless it
    /// reached the secondary log right away
    fn stage(&self, key: RangeKey, batch: &RangeBatch) -> Result<()> {
        let buffer = self.catalog.get_buffer(key.owner, key.range)?;
        if buffer.buffer_data(&batch.converted)? {
            return Ok(());
        }
        if self.primary.append(&batch.primary)? {
            return Ok(());
        }

        // Primary log full: everything it holds goes to the secondary logs
        for (other, buffer) in self.catalog.buffers() {
            if let Err(e) = buffer.flush() {
                warn!("Failed to flush secondary log buffer of range {}: {}", other, e);
            }
        }
        self.primary.reset()?;
        self.primary.append(&batch.primary)?;
        Ok(())
    }
}

impl FlushSink for BatchRouter {
    fn process(&self, ring: &[u8], start: usize, len: usize) -> Result<()> {
        let mut map = self.map.lock();
        map.reset();
        self.collect(&mut map, ring, start, len)?;

        let direct_threshold = self.ctx.config().secondary_log_buffer_size as usize;
        let mut first_error = None;
        for (key, batch) in map.pending() {
            trace!(
                "Routing {} entries ({} bytes) to range {}",
                batch.entries,
                batch.converted.len(),
                key
            );
            let result = if batch.converted.len() >= direct_threshold {
                self.catalog
                    .get_buffer(key.owner, key.range)
                    .and_then(|buffer| buffer.flush_all_data(&batch.converted))
            } else {
                self.stage(key, batch)
            };
            if let Err(e) = result {
                error!("Failed to write {} entries of range {}: {}", batch.entries, key, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
