//! chunklog Storage - Log-structured backup engine
//!
//! This crate implements the backup side of a chunk store:
//! - Variable-length log entry headers
//! - Pluggable log file access (buffered, O_DIRECT, raw partition)
//! - Primary write buffer and primary log
//! - One segmented secondary log per backup range with version tracking
//! - Background reorganization (cost-benefit segment compaction)
//! - Recovery of a backup range from its secondary log

pub mod catalog;
pub mod context;
pub mod disk;
pub mod header;
pub mod messages;
pub mod primary;
pub mod range_map;
pub mod raw_io;
pub mod recovery;
pub mod reorg;
pub mod secondary;
pub mod service;
pub mod version;
pub mod version_log;
pub mod write_buffer;

// Re-exports
pub use catalog::LogCatalog;
pub use context::LogContext;
pub use disk::{DiskAccess, LogFile};
pub use header::{
    ChainLink, DecodedHeader, EncodedHeader, EntryHeader, EntryKind, HeaderCodec, HeaderFormat,
    LogShape,
};
pub use messages::{LogKind, Message, MessageDispatcher, Response, decode_chunks, encode_chunks};
pub use primary::PrimaryLog;
pub use range_map::{BatchRouter, RangeBufferMap};
pub use recovery::{RecoveredChunk, RecoveryResult, recover_from_file};
pub use reorg::{ReorgStats, Reorganizer};
pub use secondary::{LogFileName, ReorgPhase, SecondaryLog, SecondaryLogBuffer, SegmentHeader};
pub use service::{EngineStats, LogEngine};
pub use version::VersionStore;
pub use write_buffer::{FlushSink, PrimaryWriteBuffer, WriteBufferStats};
