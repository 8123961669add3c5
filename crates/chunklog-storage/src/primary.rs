//! Primary log
//!
//! An append-only file receiving the primary-shape bytes of entries that
//! were only staged in a secondary log buffer. Once it would overflow, the
//! caller flushes every secondary log buffer and resets the log, which
//! truncates it.

use crate::context::LogContext;
use crate::disk::LogFile;
use chunklog_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the primary log
pub const PRIMARY_LOG_NAME: &str = "primary.log";

struct PrimaryState {
    file: Box<dyn LogFile>,
    write_pos: u64,
}

pub struct PrimaryLog {
    size: u64,
    state: Mutex<PrimaryState>,
}

impl PrimaryLog {
    /// Create (or replace) the primary log
    pub fn create(ctx: &Arc<LogContext>) -> Result<Self> {
        let size = ctx.config().primary_log_size;
        let mut file = ctx.access().create_log(PRIMARY_LOG_NAME, size)?;
        file.write_truncate(0, &[])?;
        info!("Created primary log ({} bytes)", size);
        Ok(Self {
            size,
            state: Mutex::new(PrimaryState { file, write_pos: 0 }),
        })
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bytes written since the last reset
    pub fn occupied(&self) -> u64 {
        self.state.lock().write_pos
    }

    /// Append `data`; returns `false` without writing if it does not fit
    pub fn append(&self, data: &[u8]) -> Result<bool> {
        if data.len() as u64 > self.size {
            return Err(Error::EntryTooLarge {
                size: data.len(),
                max: self.size as usize,
            });
        }

        let mut state = self.state.lock();
        if state.write_pos + data.len() as u64 > self.size {
            return Ok(false);
        }
        let pos = state.file.append(data)?;
        state.write_pos = pos + data.len() as u64;
        Ok(true)
    }

    /// Truncate and start over at offset 0
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.write_truncate(0, &[])?;
        debug!("Reset primary log after {} bytes", state.write_pos);
        state.write_pos = 0;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync()
    }
}
