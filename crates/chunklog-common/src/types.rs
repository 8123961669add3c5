//! Core type definitions for chunklog
//!
//! Identifiers for nodes, backup ranges and chunks, and the version pair
//! used to order stored copies of the same chunk.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node in the cluster
pub type NodeId = u16;

/// Identifier of a backup range, scoped per owning node
pub type RangeId = u8;

/// Node ID reserved for the migration / backup-range namespace
pub const RESERVED_NODE_ID: NodeId = 0xFFFF;

/// Number of bits of a chunk ID used for the local ID
pub const LOCAL_ID_BITS: u32 = 48;

/// Largest representable local ID
pub const MAX_LOCAL_ID: u64 = (1 << LOCAL_ID_BITS) - 1;

/// Largest header a log entry can carry (primary migration shape of a
/// chained entry with all optional fields at maximum width)
pub const MAX_LOG_ENTRY_HEADER_SIZE: usize = 30;

/// 64-bit chunk identifier: creator node ID (high 16 bits) + local ID (48 bits)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct ChunkId(u64);

impl ChunkId {
    /// Create a chunk ID from its creator and local ID
    #[must_use]
    pub const fn new(creator: NodeId, local_id: u64) -> Self {
        Self(((creator as u64) << LOCAL_ID_BITS) | (local_id & MAX_LOCAL_ID))
    }

    /// Create from the raw 64-bit representation
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw 64-bit representation
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Node that created the chunk
    #[must_use]
    pub const fn creator(self) -> NodeId {
        (self.0 >> LOCAL_ID_BITS) as NodeId
    }

    /// Local ID within the creator's ID space
    #[must_use]
    pub const fn local_id(self) -> u64 {
        self.0 & MAX_LOCAL_ID
    }

    /// Check whether the next local ID of the same creator is `other`
    #[must_use]
    pub const fn is_followed_by(self, other: Self) -> bool {
        self.creator() == other.creator() && self.local_id() + 1 == other.local_id()
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId(0x{:016X})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Version of a stored chunk copy
///
/// Versions are ordered lexicographically on `(epoch, version)`; the derived
/// ordering relies on the field order below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    /// Epoch, bumped when the version counter wraps
    pub epoch: u16,
    /// Version number (24 bits)
    pub version: u32,
}

impl Version {
    /// Largest version number that fits into the 3-byte header field
    pub const MAX_VERSION: u32 = 0x00FF_FFFF;

    /// Marker for "no version known"
    pub const UNKNOWN: Self = Self {
        epoch: 0,
        version: 0,
    };

    /// Create a new version
    #[must_use]
    pub const fn new(epoch: u16, version: u32) -> Self {
        Self { epoch, version }
    }

    /// First version within the given epoch
    #[must_use]
    pub const fn first(epoch: u16) -> Self {
        Self { epoch, version: 1 }
    }

    /// Whether this is a real version and not [`Version::UNKNOWN`]
    #[must_use]
    pub const fn is_known(self) -> bool {
        self.version != 0
    }

    /// Strict "newer than" relation
    #[must_use]
    pub fn is_newer_than(self, other: Self) -> bool {
        self > other
    }

    /// Successor of this version; wraps into the next epoch at [`Version::MAX_VERSION`]
    #[must_use]
    pub const fn next(self) -> Self {
        if self.version >= Self::MAX_VERSION {
            Self {
                epoch: self.epoch.wrapping_add(1),
                version: 1,
            }
        } else {
            Self {
                epoch: self.epoch,
                version: self.version + 1,
            }
        }
    }

    /// Pack into a single integer (used by the version tables)
    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.epoch as u64) << 32) | self.version as u64
    }

    /// Inverse of [`Version::pack`]
    #[must_use]
    pub const fn unpack(packed: u64) -> Self {
        Self {
            epoch: (packed >> 32) as u16,
            version: packed as u32,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.version)
    }
}

/// Node-wide key of a backup range: the owner and its range ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeKey {
    /// Node owning the range
    pub owner: NodeId,
    /// Range ID scoped to the owner
    pub range: RangeId,
}

impl RangeKey {
    /// Create a new range key
    #[must_use]
    pub const fn new(owner: NodeId, range: RangeId) -> Self {
        Self { owner, range }
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}/{}", self.owner, self.range)
    }
}
