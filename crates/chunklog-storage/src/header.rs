//! Log entry header codec
//!
//! Every log entry starts with a variable-length header. The first byte (the
//! type byte) carries the entry kind and the width of every variable field,
//! so the header size is known after reading one byte.
//!
//! Type byte:
//! ```text
//! bit   7 6   5 4   3 2   1   0
//!      +-----+-----+-----+---+---+
//!      | VER | LEN | LID | T | M |
//!      +-----+-----+-----+---+---+
//! M   = migration entry (primary shape only, always 0 in secondary logs)
//! T   = tombstone (chunk removed)
//! LID = local ID width code (0..3 -> 1, 2, 4, 6 bytes)
//! LEN = length width (1..3 bytes); 0 marks a chained entry with a 3-byte
//!       length and a chain field
//! VER = version width (0..3 bytes, 0 means version number 1)
//! ```
//!
//! Primary shape (write buffer and primary log):
//! ```text
//! +------+-------+-------+---------+-----+-----+-------+-----+-------+-----+-----+
//! | Type | Range | Owner | Creator | LID | Len | Epoch | Ver | Chain | TS  | CRC |
//! | 1B   | 1B    | 2B    | 2B (M)  | var | var | 2B    | var | 2B?   | 4B? | 4B? |
//! +------+-------+-------+---------+-----+-----+-------+-----+-------+-----+-----+
//! ```
//!
//! Secondary shape (secondary logs, range and owner implied by the log):
//! ```text
//! +------+---------+-----+-----+-------+-----+-------+-----+-----+
//! | Type | Creator | LID | Len | Epoch | Ver | Chain | TS  | CRC |
//! | 1B   | 2B (M)  | var | var | 2B    | var | 2B?   | 4B? | 4B? |
//! +------+---------+-----+-----+-------+-----+-------+-----+-----+
//! ```
//!
//! All fields are little-endian. The checksum covers the payload only.
//!
//! A chunk too large for one log entry is split into a chain of entries
//! sharing chunk ID and version. The chain field holds the link index and
//! the number of links; every link but the last carries the same payload
//! size.

use chunklog_common::checksum::CRC_SIZE;
use chunklog_common::{
    ChunkId, Error, MAX_LOG_ENTRY_HEADER_SIZE, NodeId, RangeId, Result, Version,
};

/// Migration flag in the type byte
pub const TYPE_MIGRATION: u8 = 0x01;
/// Tombstone flag in the type byte
pub const TYPE_TOMBSTONE: u8 = 0x02;

const LID_WIDTH_SHIFT: u8 = 2;
const LEN_WIDTH_SHIFT: u8 = 4;
const VER_WIDTH_SHIFT: u8 = 6;
const WIDTH_CODE_MASK: u8 = 0x03;

const RANGE_ID_SIZE: usize = 1;
const NODE_ID_SIZE: usize = 2;
const EPOCH_SIZE: usize = 2;
const TIMESTAMP_SIZE: usize = 4;
const CHAIN_SIZE: usize = 2;

/// Local ID widths selectable by the 2-bit code
const LOCAL_ID_WIDTHS: [u8; 4] = [1, 2, 4, 6];

/// Largest payload a single entry can describe (length + 1 must fit 3 bytes)
pub const MAX_PAYLOAD_LENGTH: u32 = 0x00FF_FFFE;

/// Most entries a chunk may be split into
pub const MAX_CHAIN_LINKS: u8 = u8::MAX;

/// Bytes dropped from the front of a primary header (after the type byte)
/// when it is converted to the secondary shape: range ID and owner.
pub const CONVERSION_OFFSET: usize = 1 + RANGE_ID_SIZE + NODE_ID_SIZE;

/// Kind of entry, decides whether the creator node ID is stored
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Chunk created by the range's original owner
    Default,
    /// Chunk created elsewhere; the creator is stored explicitly
    Migration,
}

/// Where a header lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogShape {
    /// Write buffer / primary log: self-describing, carries range and owner
    Primary,
    /// Secondary log: range and owner implied by the log
    Secondary,
}

/// Which optional fields the engine writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HeaderFormat {
    /// CRC of the payload
    pub checksums: bool,
    /// Write timestamp in seconds
    pub timestamps: bool,
}

/// Position of an entry in the chain of a split chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainLink {
    /// Zero-based link index
    pub index: u8,
    /// Number of links in the chain, at least 2
    pub count: u8,
}

/// Header layout decoded from a type byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderShape {
    pub shape: LogShape,
    pub kind: EntryKind,
    pub tombstone: bool,
    /// Entry is one link of a split chunk
    pub chained: bool,
    pub local_id_width: u8,
    pub length_width: u8,
    pub version_width: u8,
}

impl HeaderShape {
    /// Decode the layout from a type byte.
    ///
    /// In secondary logs the kind is a property of the log, so
    /// `stores_migrations` decides it there.
    pub fn from_type_byte(type_byte: u8, shape: LogShape, stores_migrations: bool) -> Result<Self> {
        if type_byte == 0 {
            return Err(Error::corruption("zero type byte"));
        }

        let kind = match shape {
            LogShape::Primary if type_byte & TYPE_MIGRATION != 0 => EntryKind::Migration,
            LogShape::Primary => EntryKind::Default,
            LogShape::Secondary => {
                if type_byte & TYPE_MIGRATION != 0 {
                    return Err(Error::corruption(format!(
                        "migration flag set in secondary type byte {type_byte:#04x}"
                    )));
                }
                if stores_migrations {
                    EntryKind::Migration
                } else {
                    EntryKind::Default
                }
            }
        };

        let length_code = (type_byte >> LEN_WIDTH_SHIFT) & WIDTH_CODE_MASK;
        let chained = length_code == 0;
        let length_width = if chained { 3 } else { length_code };

        Ok(Self {
            shape,
            kind,
            tombstone: type_byte & TYPE_TOMBSTONE != 0,
            chained,
            local_id_width: LOCAL_ID_WIDTHS[((type_byte >> LID_WIDTH_SHIFT) & WIDTH_CODE_MASK) as usize],
            length_width,
            version_width: (type_byte >> VER_WIDTH_SHIFT) & WIDTH_CODE_MASK,
        })
    }

    /// Encode the layout into a type byte
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        let lid_code = LOCAL_ID_WIDTHS
            .iter()
            .position(|w| *w == self.local_id_width)
            .unwrap_or(LOCAL_ID_WIDTHS.len() - 1) as u8;

        let length_code = if self.chained { 0 } else { self.length_width };
        let mut byte = (lid_code << LID_WIDTH_SHIFT)
            | (length_code << LEN_WIDTH_SHIFT)
            | (self.version_width << VER_WIDTH_SHIFT);
        if self.shape == LogShape::Primary && self.kind == EntryKind::Migration {
            byte |= TYPE_MIGRATION;
        }
        if self.tombstone {
            byte |= TYPE_TOMBSTONE;
        }
        byte
    }

    fn creator_offset(&self) -> Option<usize> {
        match (self.kind, self.shape) {
            (EntryKind::Default, _) => None,
            (EntryKind::Migration, LogShape::Primary) => Some(CONVERSION_OFFSET),
            (EntryKind::Migration, LogShape::Secondary) => Some(1),
        }
    }

    fn local_id_offset(&self) -> usize {
        let base = match self.shape {
            LogShape::Primary => CONVERSION_OFFSET,
            LogShape::Secondary => 1,
        };
        match self.kind {
            EntryKind::Default => base,
            EntryKind::Migration => base + NODE_ID_SIZE,
        }
    }

    fn length_offset(&self) -> usize {
        self.local_id_offset() + self.local_id_width as usize
    }

    fn epoch_offset(&self) -> usize {
        self.length_offset() + self.length_width as usize
    }

    fn version_offset(&self) -> usize {
        self.epoch_offset() + EPOCH_SIZE
    }

    fn chain_offset(&self) -> usize {
        self.version_offset() + self.version_width as usize
    }

    fn timestamp_offset(&self) -> usize {
        self.chain_offset() + if self.chained { CHAIN_SIZE } else { 0 }
    }

    fn checksum_offset(&self, format: HeaderFormat) -> usize {
        self.timestamp_offset() + if format.timestamps { TIMESTAMP_SIZE } else { 0 }
    }

    /// Total header size under the given format
    #[must_use]
    pub fn header_size(&self, format: HeaderFormat) -> usize {
        self.checksum_offset(format) + if format.checksums { CRC_SIZE } else { 0 }
    }
}

/// Minimal number of bytes holding `value`
const fn bytes_for(value: u64) -> u8 {
    ((64 - value.leading_zeros() + 7) / 8) as u8
}

/// Width of the local ID field: the smallest of 1, 2, 4, 6 bytes holding `local_id + 1`
#[must_use]
pub const fn local_id_width(local_id: u64) -> u8 {
    match bytes_for(local_id.saturating_add(1)) {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 6,
    }
}

/// Width of the length field: the smallest of 1, 2, 3 bytes holding `length + 1`
#[must_use]
pub const fn length_width(length: u32) -> u8 {
    let width = bytes_for(length as u64 + 1);
    if width > 3 { 3 } else { width }
}

/// Width of the version number field; 0 when the version number is exactly 1
#[must_use]
pub const fn version_width(version: u32) -> u8 {
    if version == 1 {
        0
    } else {
        let width = bytes_for(version as u64);
        if width == 0 { 1 } else { width }
    }
}

fn put_le(buf: &mut [u8], value: u64, width: usize) {
    for (i, byte) in buf[..width].iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
}

fn get_le(buf: &[u8], width: usize) -> u64 {
    buf[..width]
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Fields of one log entry header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub tombstone: bool,
    /// Destination range (primary shape only)
    pub range: RangeId,
    /// Owner of the destination range (primary shape only)
    pub owner: NodeId,
    pub chunk_id: ChunkId,
    /// Payload length in bytes
    pub length: u32,
    pub version: Version,
    /// Seconds since engine start, written when timestamps are enabled
    pub timestamp: u32,
    /// Payload CRC, written when checksums are enabled
    pub checksum: u32,
    /// Set on the links of a split chunk; `length` and `checksum` then
    /// describe this link's part of the payload
    pub chain: Option<ChainLink>,
}

/// An encoded header, kept on the stack
#[derive(Clone, Copy, Debug)]
pub struct EncodedHeader {
    bytes: [u8; MAX_LOG_ENTRY_HEADER_SIZE],
    len: usize,
}

impl EncodedHeader {
    /// Encoded bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Header length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false, a header has at least its type byte
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A decoded header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedHeader {
    pub shape: HeaderShape,
    /// Range ID (primary shape only)
    pub range: Option<RangeId>,
    /// Range owner (primary shape only)
    pub owner: Option<NodeId>,
    /// Creator node (migration entries only)
    pub creator: Option<NodeId>,
    pub local_id: u64,
    pub length: u32,
    pub version: Version,
    pub timestamp: Option<u32>,
    pub checksum: Option<u32>,
    pub chain: Option<ChainLink>,
    pub header_size: usize,
}

impl DecodedHeader {
    /// Full chunk ID; default entries take the creator from the log
    #[must_use]
    pub fn chunk_id(&self, default_creator: NodeId) -> ChunkId {
        ChunkId::new(self.creator.unwrap_or(default_creator), self.local_id)
    }

    /// Header plus payload size
    #[must_use]
    pub const fn entry_size(&self) -> usize {
        self.header_size + self.length as usize
    }

    /// Whether the entry removes its chunk
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.shape.tombstone
    }
}

/// Encoder/decoder for log entry headers under one [`HeaderFormat`]
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderCodec {
    format: HeaderFormat,
}

impl HeaderCodec {
    /// Create a codec
    #[must_use]
    pub const fn new(format: HeaderFormat) -> Self {
        Self { format }
    }

    /// Format handled by this codec
    #[must_use]
    pub const fn format(&self) -> HeaderFormat {
        self.format
    }

    /// Layout a header with the given fields would get
    #[must_use]
    pub fn shape_of(&self, shape: LogShape, header: &EntryHeader) -> HeaderShape {
        let chained = header.chain.is_some();
        HeaderShape {
            shape,
            kind: header.kind,
            tombstone: header.tombstone,
            chained,
            local_id_width: local_id_width(header.chunk_id.local_id()),
            length_width: if chained { 3 } else { length_width(header.length) },
            version_width: version_width(header.version.version),
        }
    }

    /// Encode a header
    pub fn encode(&self, shape: LogShape, header: &EntryHeader) -> Result<EncodedHeader> {
        if header.length > MAX_PAYLOAD_LENGTH {
            return Err(Error::EntryTooLarge {
                size: header.length as usize,
                max: MAX_PAYLOAD_LENGTH as usize,
            });
        }
        if header.version.version > Version::MAX_VERSION {
            return Err(Error::invalid_argument(format!(
                "version number {} exceeds 24 bits",
                header.version.version
            )));
        }
        if let Some(link) = header.chain
            && (link.count < 2 || link.index >= link.count)
        {
            return Err(Error::invalid_argument(format!(
                "chain link {} of {} is out of range",
                link.index, link.count
            )));
        }

        let layout = self.shape_of(shape, header);
        let mut bytes = [0u8; MAX_LOG_ENTRY_HEADER_SIZE];
        bytes[0] = layout.type_byte();

        if shape == LogShape::Primary {
            bytes[1] = header.range;
            put_le(&mut bytes[2..], u64::from(header.owner), NODE_ID_SIZE);
        }
        if let Some(offset) = layout.creator_offset() {
            put_le(&mut bytes[offset..], u64::from(header.chunk_id.creator()), NODE_ID_SIZE);
        }
        put_le(
            &mut bytes[layout.local_id_offset()..],
            header.chunk_id.local_id(),
            layout.local_id_width as usize,
        );
        put_le(
            &mut bytes[layout.length_offset()..],
            u64::from(header.length),
            layout.length_width as usize,
        );
        put_le(&mut bytes[layout.epoch_offset()..], u64::from(header.version.epoch), EPOCH_SIZE);
        put_le(
            &mut bytes[layout.version_offset()..],
            u64::from(header.version.version),
            layout.version_width as usize,
        );
        if let Some(link) = header.chain {
            let offset = layout.chain_offset();
            bytes[offset] = link.index;
            bytes[offset + 1] = link.count;
        }
        if self.format.timestamps {
            put_le(
                &mut bytes[layout.timestamp_offset()..],
                u64::from(header.timestamp),
                TIMESTAMP_SIZE,
            );
        }
        if self.format.checksums {
            put_le(
                &mut bytes[layout.checksum_offset(self.format)..],
                u64::from(header.checksum),
                CRC_SIZE,
            );
        }

        Ok(EncodedHeader {
            bytes,
            len: layout.header_size(self.format),
        })
    }

    /// Decode only the type byte at `offset`
    pub fn decode_type(
        &self,
        buf: &[u8],
        offset: usize,
        shape: LogShape,
        stores_migrations: bool,
    ) -> Result<HeaderShape> {
        let type_byte = *buf
            .get(offset)
            .ok_or_else(|| Error::corruption(format!("header offset {offset} beyond buffer")))?;
        HeaderShape::from_type_byte(type_byte, shape, stores_migrations)
    }

    /// Header size of the entry at `offset`, from its type byte alone
    pub fn header_size(
        &self,
        buf: &[u8],
        offset: usize,
        shape: LogShape,
        stores_migrations: bool,
    ) -> Result<usize> {
        Ok(self
            .decode_type(buf, offset, shape, stores_migrations)?
            .header_size(self.format))
    }

    /// Decode all header fields at `offset`
    pub fn decode(
        &self,
        buf: &[u8],
        offset: usize,
        shape: LogShape,
        stores_migrations: bool,
    ) -> Result<DecodedHeader> {
        let layout = self.decode_type(buf, offset, shape, stores_migrations)?;
        let header_size = layout.header_size(self.format);
        let header = buf.get(offset..offset + header_size).ok_or_else(|| {
            Error::corruption(format!(
                "truncated header at offset {offset}: {header_size} bytes needed, {} available",
                buf.len() - offset
            ))
        })?;

        let (range, owner) = match shape {
            LogShape::Primary => (
                Some(header[1]),
                Some(get_le(&header[2..], NODE_ID_SIZE) as NodeId),
            ),
            LogShape::Secondary => (None, None),
        };
        let creator = layout
            .creator_offset()
            .map(|off| get_le(&header[off..], NODE_ID_SIZE) as NodeId);
        let version = Version::new(
            get_le(&header[layout.epoch_offset()..], EPOCH_SIZE) as u16,
            if layout.version_width == 0 {
                1
            } else {
                get_le(&header[layout.version_offset()..], layout.version_width as usize) as u32
            },
        );
        let chain = layout.chained.then(|| ChainLink {
            index: header[layout.chain_offset()],
            count: header[layout.chain_offset() + 1],
        });
        if let Some(link) = chain
            && (link.count < 2 || link.index >= link.count)
        {
            return Err(Error::corruption(format!(
                "chain link {} of {} at offset {offset}",
                link.index, link.count
            )));
        }

        Ok(DecodedHeader {
            shape: layout,
            range,
            owner,
            creator,
            local_id: get_le(&header[layout.local_id_offset()..], layout.local_id_width as usize),
            length: get_le(&header[layout.length_offset()..], layout.length_width as usize) as u32,
            version,
            timestamp: self
                .format
                .timestamps
                .then(|| get_le(&header[layout.timestamp_offset()..], TIMESTAMP_SIZE) as u32),
            checksum: self
                .format
                .checksums
                .then(|| get_le(&header[layout.checksum_offset(self.format)..], CRC_SIZE) as u32),
            chain,
            header_size,
        })
    }

    /// How a chunk described by `header` (whole payload length, no chain)
    /// is split so that no primary entry exceeds `max_entry_size` bytes.
    ///
    /// Returns `None` when it fits one entry, otherwise the payload bytes
    /// per link and the number of links.
    pub fn chain_layout(&self, header: &EntryHeader, max_entry_size: usize) -> Result<Option<(usize, u8)>> {
        let single = EntryHeader { chain: None, ..*header };
        let length = header.length as usize;
        if header.length <= MAX_PAYLOAD_LENGTH
            && self.shape_of(LogShape::Primary, &single).header_size(self.format) + length <= max_entry_size
        {
            return Ok(None);
        }

        let linked = EntryHeader {
            chain: Some(ChainLink { index: 0, count: 2 }),
            ..*header
        };
        let header_size = self.shape_of(LogShape::Primary, &linked).header_size(self.format);
        let link_size = max_entry_size
            .saturating_sub(header_size)
            .min(MAX_PAYLOAD_LENGTH as usize);
        if link_size == 0 {
            return Err(Error::invalid_argument(format!(
                "log entries of {max_entry_size} bytes cannot hold a {header_size} byte header"
            )));
        }
        let count = length.div_ceil(link_size);
        if count > MAX_CHAIN_LINKS as usize {
            return Err(Error::EntryTooLarge {
                size: length,
                max: link_size * MAX_CHAIN_LINKS as usize,
            });
        }
        Ok(Some((link_size, count as u8)))
    }

    /// Approximate secondary header size of a chunk, used to size batches
    /// before logging. The version width is only known at backup time, one
    /// byte is assumed.
    #[must_use]
    pub fn approx_secondary_header_size(&self, migration: bool, local_id: u64, size: u32) -> usize {
        let mut total = 1
            + local_id_width(local_id) as usize
            + length_width(size) as usize
            + EPOCH_SIZE
            + 1;
        if migration {
            total += NODE_ID_SIZE;
        }
        if self.format.timestamps {
            total += TIMESTAMP_SIZE;
        }
        if self.format.checksums {
            total += CRC_SIZE;
        }
        total
    }
}

/// Size of a primary entry after conversion to the secondary shape
#[must_use]
pub const fn secondary_entry_size(primary_entry_size: usize) -> usize {
    primary_entry_size - CONVERSION_OFFSET + 1
}

/// Convert a primary-shape entry to the secondary shape and copy it.
///
/// `input` is a circular buffer; the entry starts at `in_off` and
/// `bytes_until_wrap` bytes remain until its physical end, so an entry longer
/// than that continues at offset 0. The type byte is copied with the
/// migration flag cleared and the `conversion_offset - 1` bytes following it
/// are dropped. Returns the number of bytes written to `output`.
pub fn convert_primary_to_secondary(
    input: &[u8],
    in_off: usize,
    output: &mut [u8],
    out_off: usize,
    entry_len: usize,
    bytes_until_wrap: usize,
    conversion_offset: usize,
) -> Result<usize> {
    if in_off >= input.len()
        || entry_len <= conversion_offset
        || entry_len > input.len()
        || bytes_until_wrap > input.len() - in_off
        || out_off + entry_len - conversion_offset + 1 > output.len()
    {
        return Err(Error::corruption(format!(
            "cannot convert a {entry_len} byte entry at {in_off} of {} bytes into {} bytes at {out_off}",
            input.len(),
            output.len()
        )));
    }
    output[out_off] = input[in_off] & !TYPE_MIGRATION;

    let remaining = entry_len - conversion_offset;
    let dst = out_off + 1;
    if entry_len <= bytes_until_wrap {
        let src = in_off + conversion_offset;
        output[dst..dst + remaining].copy_from_slice(&input[src..src + remaining]);
    } else if conversion_offset >= bytes_until_wrap {
        // Only the dropped prefix lies before the wrap
        let src = conversion_offset - bytes_until_wrap;
        output[dst..dst + remaining].copy_from_slice(&input[src..src + remaining]);
    } else {
        let first = bytes_until_wrap - conversion_offset;
        let src = in_off + conversion_offset;
        output[dst..dst + first].copy_from_slice(&input[src..src + first]);
        let second = entry_len - bytes_until_wrap;
        output[dst + first..dst + first + second].copy_from_slice(&input[..second]);
    }

    Ok(remaining + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_common::MAX_LOCAL_ID;
    use rand::Rng;

    const ALL_FORMATS: [HeaderFormat; 4] = [
        HeaderFormat {
            checksums: false,
            timestamps: false,
        },
        HeaderFormat {
            checksums: true,
            timestamps: false,
        },
        HeaderFormat {
            checksums: false,
            timestamps: true,
        },
        HeaderFormat {
            checksums: true,
            timestamps: true,
        },
    ];

    fn header(kind: EntryKind, chunk_id: ChunkId, length: u32, version: Version) -> EntryHeader {
        EntryHeader {
            kind,
            tombstone: false,
            range: 7,
            owner: 0x0002,
            chunk_id,
            length,
            version,
            timestamp: 1234,
            checksum: 0xCAFE_BABE,
            chain: None,
        }
    }

    #[test]
    fn test_local_id_width_classes() {
        assert_eq!(local_id_width(0), 1);
        assert_eq!(local_id_width(254), 1);
        assert_eq!(local_id_width(255), 2);
        assert_eq!(local_id_width(65_534), 2);
        assert_eq!(local_id_width(65_535), 4);
        assert_eq!(local_id_width(0xFFFF_FFFE), 4);
        assert_eq!(local_id_width(0xFFFF_FFFF), 6);
        assert_eq!(local_id_width(MAX_LOCAL_ID), 6);
    }

    #[test]
    fn test_local_id_width_is_minimal() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let bits = rng.gen_range(0..=48);
            let local_id = rng.r#gen::<u64>() & ((1u64 << bits) - 1).max(1) & MAX_LOCAL_ID;
            let width = u32::from(local_id_width(local_id));
            assert!(LOCAL_ID_WIDTHS.contains(&(width as u8)));
            // The width holds the local ID itself
            assert!(width == 8 || local_id < (1u64 << (8 * width)));
            // No smaller class holds local_id + 1
            for smaller in LOCAL_ID_WIDTHS.iter().filter(|w| u32::from(**w) < width) {
                assert!(local_id + 1 >= (1u64 << (8 * u32::from(*smaller))));
            }
        }
    }

    #[test]
    fn test_length_width_classes() {
        assert_eq!(length_width(0), 1);
        assert_eq!(length_width(254), 1);
        assert_eq!(length_width(255), 2);
        assert_eq!(length_width(65_534), 2);
        assert_eq!(length_width(65_535), 3);
        assert_eq!(length_width(MAX_PAYLOAD_LENGTH), 3);
    }

    #[test]
    fn test_version_width_classes() {
        assert_eq!(version_width(1), 0);
        assert_eq!(version_width(0), 1);
        assert_eq!(version_width(2), 1);
        assert_eq!(version_width(255), 1);
        assert_eq!(version_width(256), 2);
        assert_eq!(version_width(Version::MAX_VERSION), 3);
    }

    #[test]
    fn test_round_trip_random() {
        let mut rng = rand::thread_rng();
        for format in ALL_FORMATS {
            let codec = HeaderCodec::new(format);
            for _ in 0..2_000 {
                let kind = if rng.r#gen() {
                    EntryKind::Migration
                } else {
                    EntryKind::Default
                };
                let shape = if rng.r#gen() {
                    LogShape::Primary
                } else {
                    LogShape::Secondary
                };
                let mut h = header(
                    kind,
                    ChunkId::new(rng.r#gen(), rng.r#gen::<u64>() >> rng.gen_range(16..64)),
                    rng.gen_range(0..=MAX_PAYLOAD_LENGTH),
                    Version::new(rng.r#gen(), rng.gen_range(1..=Version::MAX_VERSION)),
                );
                h.tombstone = rng.r#gen();
                h.timestamp = rng.r#gen();
                h.checksum = rng.r#gen();

                let encoded = codec.encode(shape, &h).unwrap();
                let decoded = codec
                    .decode(encoded.as_slice(), 0, shape, kind == EntryKind::Migration)
                    .unwrap();

                assert_eq!(decoded.header_size, encoded.len());
                assert_eq!(decoded.shape.kind, kind);
                assert_eq!(decoded.is_tombstone(), h.tombstone);
                assert_eq!(decoded.local_id, h.chunk_id.local_id());
                assert_eq!(decoded.length, h.length);
                assert_eq!(decoded.version, h.version);
                assert_eq!(decoded.chunk_id(h.chunk_id.creator()), h.chunk_id);
                if kind == EntryKind::Migration {
                    assert_eq!(decoded.creator, Some(h.chunk_id.creator()));
                }
                if shape == LogShape::Primary {
                    assert_eq!(decoded.range, Some(h.range));
                    assert_eq!(decoded.owner, Some(h.owner));
                } else {
                    assert_eq!(decoded.range, None);
                }
                assert_eq!(decoded.timestamp, format.timestamps.then_some(h.timestamp));
                assert_eq!(decoded.checksum, format.checksums.then_some(h.checksum));
            }
        }
    }

    #[test]
    fn test_header_size_from_type_byte_only() {
        for format in ALL_FORMATS {
            let codec = HeaderCodec::new(format);
            for shape in [LogShape::Primary, LogShape::Secondary] {
                for kind in [EntryKind::Default, EntryKind::Migration] {
                    let h = header(kind, ChunkId::new(9, 70_000), 300, Version::new(2, 1));
                    let encoded = codec.encode(shape, &h).unwrap();
                    // Only the type byte is available
                    let size = codec
                        .header_size(&encoded.as_slice()[..1], 0, shape, kind == EntryKind::Migration)
                        .unwrap();
                    assert_eq!(size, encoded.len());
                }
            }
        }
    }

    #[test]
    fn test_type_byte_never_zero() {
        let codec = HeaderCodec::new(HeaderFormat::default());
        let h = header(EntryKind::Default, ChunkId::new(1, 0), 0, Version::first(0));
        let encoded = codec.encode(LogShape::Secondary, &h).unwrap();
        assert_ne!(encoded.as_slice()[0], 0);
    }

    #[test]
    fn test_max_header_size() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: true,
        });
        let mut h = header(
            EntryKind::Migration,
            ChunkId::new(0xFFFE, MAX_LOCAL_ID),
            MAX_PAYLOAD_LENGTH,
            Version::new(0xFFFF, Version::MAX_VERSION),
        );
        let single = codec.encode(LogShape::Primary, &h).unwrap();
        h.chain = Some(ChainLink { index: 3, count: 4 });
        let encoded = codec.encode(LogShape::Primary, &h).unwrap();
        assert_eq!(encoded.len(), MAX_LOG_ENTRY_HEADER_SIZE);
        assert_eq!(single.len() + CHAIN_SIZE, encoded.len());
    }

    #[test]
    fn test_chained_header_round_trip() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: true,
        });
        for shape in [LogShape::Primary, LogShape::Secondary] {
            for kind in [EntryKind::Default, EntryKind::Migration] {
                // A short link still gets the 3-byte length of a chain
                let mut h = header(kind, ChunkId::new(4, 300), 17, Version::new(1, 9));
                h.chain = Some(ChainLink { index: 2, count: 3 });
                let encoded = codec.encode(shape, &h).unwrap();
                assert_eq!((encoded.as_slice()[0] >> LEN_WIDTH_SHIFT) & WIDTH_CODE_MASK, 0);

                let decoded = codec
                    .decode(encoded.as_slice(), 0, shape, kind == EntryKind::Migration)
                    .unwrap();
                assert!(decoded.shape.chained);
                assert_eq!(decoded.chain, h.chain);
                assert_eq!(decoded.length, 17);
                assert_eq!(decoded.version, h.version);
                assert_eq!(decoded.timestamp, Some(h.timestamp));
                assert_eq!(decoded.checksum, Some(h.checksum));
                assert_eq!(decoded.header_size, encoded.len());
            }
        }
    }

    #[test]
    fn test_chained_entry_converts_to_secondary() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: false,
        });
        let mut h = header(EntryKind::Default, ChunkId::new(1, 8), 4, Version::new(0, 2));
        h.chain = Some(ChainLink { index: 0, count: 2 });
        let mut primary = codec.encode(LogShape::Primary, &h).unwrap().as_slice().to_vec();
        primary.extend_from_slice(b"abcd");

        let mut out = vec![0u8; 64];
        let written =
            convert_primary_to_secondary(&primary, 0, &mut out, 0, primary.len(), primary.len(), CONVERSION_OFFSET)
                .unwrap();
        let decoded = codec.decode(&out[..written], 0, LogShape::Secondary, false).unwrap();
        assert_eq!(decoded.chain, h.chain);
        assert_eq!(&out[decoded.header_size..written], b"abcd");
    }

    #[test]
    fn test_invalid_chain_links_rejected() {
        let codec = HeaderCodec::new(HeaderFormat::default());
        let mut h = header(EntryKind::Default, ChunkId::new(1, 1), 10, Version::first(0));
        h.chain = Some(ChainLink { index: 2, count: 2 });
        assert!(codec.encode(LogShape::Secondary, &h).is_err());
        h.chain = Some(ChainLink { index: 0, count: 1 });
        assert!(codec.encode(LogShape::Secondary, &h).is_err());

        h.chain = Some(ChainLink { index: 1, count: 2 });
        let mut bytes = codec.encode(LogShape::Secondary, &h).unwrap().as_slice().to_vec();
        let chain_offset = bytes.len() - CHAIN_SIZE;
        bytes[chain_offset] = 5;
        let err = codec.decode(&bytes, 0, LogShape::Secondary, false).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_chain_layout() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: true,
        });
        let max_entry = 32 * 1024;

        let small = header(EntryKind::Default, ChunkId::new(1, 1), 1000, Version::first(0));
        assert_eq!(codec.chain_layout(&small, max_entry).unwrap(), None);

        // type + range + owner + lid(1) + len(3) + epoch(2) + chain(2) + ts + crc
        let large = header(EntryKind::Default, ChunkId::new(1, 1), 100_000, Version::first(0));
        let (link_size, count) = codec.chain_layout(&large, max_entry).unwrap().unwrap();
        assert_eq!(link_size, max_entry - 20);
        assert_eq!(count, 4);
        assert!(link_size * usize::from(count) >= 100_000);
        assert!(link_size * (usize::from(count) - 1) < 100_000);

        let huge = header(
            EntryKind::Default,
            ChunkId::new(1, 1),
            (max_entry * 300) as u32,
            Version::first(0),
        );
        assert!(matches!(
            codec.chain_layout(&huge, max_entry),
            Err(Error::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_convert_rejects_out_of_bounds_entries() {
        let ring = vec![0x10u8; 32];
        let mut out = vec![0u8; 32];
        // Offset beyond the ring
        let err = convert_primary_to_secondary(&ring, 40, &mut out, 0, 10, 0, CONVERSION_OFFSET).unwrap_err();
        assert!(err.is_corruption());
        // Entry longer than the ring
        assert!(convert_primary_to_secondary(&ring, 0, &mut out, 0, 64, 32, CONVERSION_OFFSET).is_err());
        // Output too short
        let mut short = vec![0u8; 4];
        assert!(convert_primary_to_secondary(&ring, 0, &mut short, 0, 16, 32, CONVERSION_OFFSET).is_err());
        // Shorter than the dropped prefix
        assert!(convert_primary_to_secondary(&ring, 0, &mut out, 0, 2, 32, CONVERSION_OFFSET).is_err());
    }

    #[test]
    fn test_version_one_has_no_version_bytes() {
        let codec = HeaderCodec::new(HeaderFormat::default());
        let one = header(EntryKind::Default, ChunkId::new(1, 5), 2, Version::new(1, 1));
        let two = header(EntryKind::Default, ChunkId::new(1, 5), 2, Version::new(1, 2));
        let a = codec.encode(LogShape::Secondary, &one).unwrap();
        let b = codec.encode(LogShape::Secondary, &two).unwrap();
        assert_eq!(a.len() + 1, b.len());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = HeaderCodec::new(HeaderFormat::default());
        let h = header(
            EntryKind::Default,
            ChunkId::new(1, 1),
            MAX_PAYLOAD_LENGTH + 1,
            Version::first(0),
        );
        assert!(matches!(
            codec.encode(LogShape::Primary, &h),
            Err(Error::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_errors() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: false,
        });

        // Zero type byte marks the end of a segment
        assert!(codec.decode(&[0, 0, 0], 0, LogShape::Secondary, false).is_err());

        // Truncated header
        let h = header(EntryKind::Default, ChunkId::new(1, 1000), 10, Version::new(0, 3));
        let encoded = codec.encode(LogShape::Secondary, &h).unwrap();
        let truncated = &encoded.as_slice()[..encoded.len() - 1];
        let err = codec.decode(truncated, 0, LogShape::Secondary, false).unwrap_err();
        assert!(err.is_corruption());

        // Secondary entries never carry the migration flag
        let primary = codec
            .encode(LogShape::Primary, &header(EntryKind::Migration, ChunkId::new(3, 1), 1, Version::first(0)))
            .unwrap();
        assert!(codec.decode(primary.as_slice(), 0, LogShape::Secondary, true).is_err());

        // Offset beyond buffer
        assert!(codec.decode(encoded.as_slice(), 64, LogShape::Secondary, false).is_err());
    }

    /// Build a primary entry (header + payload) and its expected secondary form
    fn entry_pair(codec: &HeaderCodec, kind: EntryKind, payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut h = header(kind, ChunkId::new(0x0010, 4242), payload.len() as u32, Version::new(3, 77));
        h.checksum = chunklog_common::compute_payload_crc(payload);
        let mut primary = codec.encode(LogShape::Primary, &h).unwrap().as_slice().to_vec();
        primary.extend_from_slice(payload);
        let mut secondary = codec.encode(LogShape::Secondary, &h).unwrap().as_slice().to_vec();
        secondary.extend_from_slice(payload);
        (primary, secondary)
    }

    #[test]
    fn test_convert_contiguous() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: true,
        });
        for kind in [EntryKind::Default, EntryKind::Migration] {
            let (primary, secondary) = entry_pair(&codec, kind, b"payload bytes");
            let mut ring = vec![0u8; 128];
            ring[10..10 + primary.len()].copy_from_slice(&primary);

            let mut out = vec![0u8; 128];
            let written = convert_primary_to_secondary(
                &ring,
                10,
                &mut out,
                5,
                primary.len(),
                ring.len() - 10,
                CONVERSION_OFFSET,
            )
            .unwrap();
            assert_eq!(written, secondary.len());
            assert_eq!(written, secondary_entry_size(primary.len()));
            assert_eq!(&out[5..5 + written], secondary.as_slice());
        }
    }

    #[test]
    fn test_convert_bisected_at_every_position() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: false,
        });
        for kind in [EntryKind::Default, EntryKind::Migration] {
            let (primary, secondary) = entry_pair(&codec, kind, b"wrapped around the ring end");
            let ring_len = 64;
            // The entry starts `until_wrap` bytes before the physical end
            for until_wrap in 1..primary.len() {
                let start = ring_len - until_wrap;
                let mut ring = vec![0xEEu8; ring_len];
                ring[start..].copy_from_slice(&primary[..until_wrap]);
                ring[..primary.len() - until_wrap].copy_from_slice(&primary[until_wrap..]);

                let mut out = vec![0u8; 64];
                let written = convert_primary_to_secondary(
                    &ring,
                    start,
                    &mut out,
                    0,
                    primary.len(),
                    until_wrap,
                    CONVERSION_OFFSET,
                )
                .unwrap();
                assert_eq!(written, secondary.len(), "until_wrap={until_wrap}");
                assert_eq!(&out[..written], secondary.as_slice(), "until_wrap={until_wrap}");
            }
        }
    }

    #[test]
    fn test_approx_header_size() {
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: true,
            timestamps: false,
        });
        // type + lid(1) + len(1) + epoch(2) + version(1) + crc(4)
        assert_eq!(codec.approx_secondary_header_size(false, 5, 100), 10);
        // plus creator
        assert_eq!(codec.approx_secondary_header_size(true, 5, 100), 12);
        // wider fields
        assert_eq!(codec.approx_secondary_header_size(false, 70_000, 70_000), 15);
    }
}
