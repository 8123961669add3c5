//! Secondary logs
//!
//! Every backup range owns one secondary log on disk, split into
//! fixed-size segments, and a small staging buffer in memory:
//! ```text
//!  write buffer ──► SecondaryLogBuffer ──► SecondaryLog
//!                   (< buffer size)        +-----------+-----------+-----+
//!                   ──── large batches ──► | segment 0 | segment 1 | ... |
//!                                          +-----------+-----------+-----+
//! ```

mod buffer;
mod log;
mod segment;

pub use buffer::SecondaryLogBuffer;
pub use log::{LogFileName, ReorgPhase, SecondaryLog};
pub use segment::{EntryIter, SegmentHeader, fit_prefix};
