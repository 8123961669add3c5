//! Segment bookkeeping and entry scanning
//!
//! A segment holds secondary-shape entries back to back, followed by a zero
//! byte unless the segment is completely full:
//! ```text
//! +---------+---------+-----+---------+---+------------------+
//! | Entry 0 | Entry 1 | ... | Entry n | 0 | (stale / zeroed) |
//! +---------+---------+-----+---------+---+------------------+
//! ```

use crate::header::{DecodedHeader, HeaderCodec, LogShape};
use chunklog_common::{Error, Result};

/// In-memory metadata of one segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Bytes occupied by entries
    pub used: usize,
    /// Time of the last append or rewrite (engine seconds)
    pub last_access: u32,
    /// Byte-weighted mean entry age at `last_access`
    age: u32,
}

impl SegmentHeader {
    /// Header of a segment rewritten at `now` with the given mean entry age
    #[must_use]
    pub const fn rewritten(used: usize, now: u32, age: u32) -> Self {
        Self {
            used,
            last_access: now,
            age,
        }
    }

    /// Whether the segment holds no entries
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Free bytes in a segment of the given size
    #[must_use]
    pub const fn free(&self, segment_size: usize) -> usize {
        segment_size.saturating_sub(self.used)
    }

    /// Fraction of the segment in use
    #[must_use]
    pub fn utilization(&self, segment_size: usize) -> f64 {
        self.used as f64 / segment_size as f64
    }

    /// Mean entry age at `now`
    #[must_use]
    pub const fn age(&self, now: u32) -> u32 {
        self.age.saturating_add(now.saturating_sub(self.last_access))
    }

    /// Account for `len` freshly written bytes: new bytes have age zero and
    /// pull the mean down in proportion to their share
    pub fn record_append(&mut self, len: usize, now: u32) {
        let current = u64::from(self.age(now));
        let before = self.used as u64;
        self.used += len;
        self.age = if self.used == 0 {
            0
        } else {
            (current * before / self.used as u64) as u32
        };
        self.last_access = now;
    }
}

/// Iterator over the entries of a segment's used bytes.
///
/// Stops at the end of the data or at a zero type byte. A malformed or
/// truncated header yields one error and ends the iteration.
pub struct EntryIter<'a> {
    codec: &'a HeaderCodec,
    data: &'a [u8],
    migration: bool,
    offset: usize,
    done: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(codec: &'a HeaderCodec, data: &'a [u8], migration: bool) -> Self {
        Self {
            codec,
            data,
            migration,
            offset: 0,
            done: false,
        }
    }

    /// Offset of the next entry (end of the valid data once exhausted)
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<(usize, DecodedHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() || self.data[self.offset] == 0 {
            return None;
        }

        let offset = self.offset;
        let header = match self
            .codec
            .decode(self.data, offset, LogShape::Secondary, self.migration)
        {
            Ok(header) => header,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if offset + header.entry_size() > self.data.len() {
            self.done = true;
            return Some(Err(Error::corruption(format!(
                "entry at offset {offset} with {} bytes exceeds segment data of {} bytes",
                header.entry_size(),
                self.data.len()
            ))));
        }

        self.offset += header.entry_size();
        Some(Ok((offset, header)))
    }
}

/// Length of the longest run of whole entries starting at `from` that fits
/// into `limit` bytes
pub fn fit_prefix(
    codec: &HeaderCodec,
    data: &[u8],
    from: usize,
    limit: usize,
    migration: bool,
) -> Result<usize> {
    let mut len = 0;
    for entry in EntryIter::new(codec, &data[from..], migration) {
        let (_, header) = entry?;
        if len + header.entry_size() > limit {
            break;
        }
        len += header.entry_size();
    }
    Ok(len)
}
