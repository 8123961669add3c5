//! Node-wide state shared by all logs of one engine

use crate::disk::DiskAccess;
use crate::header::{HeaderCodec, HeaderFormat};
use chunklog_common::{LogConfig, NodeId, Result};
use std::sync::Arc;
use std::time::Instant;

/// Validated configuration, header codec, disk access and the engine clock
pub struct LogContext {
    config: LogConfig,
    node_id: NodeId,
    codec: HeaderCodec,
    access: DiskAccess,
    started: Instant,
}

impl LogContext {
    /// Validate the configuration and set up disk access
    pub fn new(config: LogConfig, node_id: NodeId) -> Result<Arc<Self>> {
        config.validate()?;
        let access = DiskAccess::open(&config)?;
        let codec = HeaderCodec::new(HeaderFormat {
            checksums: config.use_checksums,
            timestamps: config.use_timestamps,
        });
        Ok(Arc::new(Self {
            config,
            node_id,
            codec,
            access,
            started: Instant::now(),
        }))
    }

    pub const fn config(&self) -> &LogConfig {
        &self.config
    }

    /// ID of the node running this engine
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub const fn codec(&self) -> &HeaderCodec {
        &self.codec
    }

    pub const fn access(&self) -> &DiskAccess {
        &self.access
    }

    /// Seconds since engine start, the time base of entry timestamps
    pub fn now_secs(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX)
    }
}

/// Small configuration used by unit tests: 64 KiB segments, 512 KiB
/// secondary logs
#[cfg(test)]
pub(crate) fn test_config(dir: &std::path::Path) -> LogConfig {
    LogConfig {
        backup_directory: dir.to_path_buf(),
        use_checksums: true,
        flash_page_size: 4 * 1024,
        log_segment_size: 64 * 1024,
        primary_log_size: 256 * 1024,
        write_buffer_size: 256 * 1024,
        secondary_log_buffer_size: 16 * 1024,
        backup_range_size: 256 * 1024,
        max_chunk_size: 16 * 1024,
        write_buffer_flush_timeout_ms: 20,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) fn test_context(dir: &std::path::Path) -> Arc<LogContext> {
    LogContext::new(test_config(dir), 1).unwrap()
}
