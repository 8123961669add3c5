//! Configuration types for chunklog
//!
//! [`LogConfig`] carries every tunable of the log engine. It is usually
//! deserialized from the `[log]` table of a TOML file and must pass
//! [`LogConfig::validate`] before an engine is started.

use crate::error::{Error, Result};
use crate::types::MAX_LOG_ENTRY_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Cold data threshold used when nothing else is configured (seconds)
pub const DEFAULT_COLD_DATA_THRESHOLD_SECS: u32 = 9000;

/// How log files are accessed on disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarddriveAccess {
    /// Regular files through the OS page cache
    #[default]
    BufferedFile,
    /// Regular files opened with O_DIRECT (F_NOCACHE on macOS)
    Direct,
    /// Regions of a raw partition, bypassing the filesystem
    RawPartition,
}

/// Log engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding primary and secondary log files
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    /// Disk access backend
    #[serde(default)]
    pub harddrive_access: HarddriveAccess,
    /// Device used by the raw partition backend
    #[serde(default = "default_raw_device_path")]
    pub raw_device_path: PathBuf,
    /// Store a CRC of every payload
    #[serde(default = "default_true")]
    pub use_checksums: bool,
    /// Store a write timestamp in every header
    #[serde(default = "default_true")]
    pub use_timestamps: bool,
    /// Flash page size in bytes
    #[serde(default = "default_flash_page_size")]
    pub flash_page_size: u64,
    /// Secondary log segment size in bytes
    #[serde(default = "default_log_segment_size")]
    pub log_segment_size: u64,
    /// Primary log size in bytes
    #[serde(default = "default_primary_log_size")]
    pub primary_log_size: u64,
    /// Primary write buffer size in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: u64,
    /// Per-range secondary log buffer size in bytes
    #[serde(default = "default_secondary_log_buffer_size")]
    pub secondary_log_buffer_size: u64,
    /// Backup range size in bytes (a secondary log is twice as large)
    #[serde(default = "default_backup_range_size")]
    pub backup_range_size: u64,
    /// Largest chunk the store may hand to the log
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Utilization (percent) above which a log is reorganized in the background
    #[serde(default = "default_utilization_activate")]
    pub utilization_activate_reorganization: u8,
    /// Utilization (percent) above which a log is reorganized promptly
    #[serde(default = "default_utilization_prompt")]
    pub utilization_prompt_reorganization: u8,
    /// Entries older than this no longer add to a segment's age score
    #[serde(default = "default_cold_data_threshold")]
    pub cold_data_threshold_secs: u32,
    /// Assumed average chunk size used to size the dense version window
    #[serde(default = "default_version_array_chunk_size")]
    pub version_array_chunk_size: u64,
    /// Longest time the write buffer holds data without flushing
    #[serde(default = "default_flush_timeout_ms")]
    pub write_buffer_flush_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backup_directory: default_backup_directory(),
            harddrive_access: HarddriveAccess::default(),
            raw_device_path: default_raw_device_path(),
            use_checksums: true,
            use_timestamps: true,
            flash_page_size: default_flash_page_size(),
            log_segment_size: default_log_segment_size(),
            primary_log_size: default_primary_log_size(),
            write_buffer_size: default_write_buffer_size(),
            secondary_log_buffer_size: default_secondary_log_buffer_size(),
            backup_range_size: default_backup_range_size(),
            max_chunk_size: default_max_chunk_size(),
            utilization_activate_reorganization: default_utilization_activate(),
            utilization_prompt_reorganization: default_utilization_prompt(),
            cold_data_threshold_secs: default_cold_data_threshold(),
            version_array_chunk_size: default_version_array_chunk_size(),
            write_buffer_flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("./log")
}

fn default_raw_device_path() -> PathBuf {
    PathBuf::from("/dev/raw/raw1")
}

const fn default_true() -> bool {
    true
}

const fn default_flash_page_size() -> u64 {
    4 * KB
}

const fn default_log_segment_size() -> u64 {
    8 * MB
}

const fn default_primary_log_size() -> u64 {
    256 * MB
}

const fn default_write_buffer_size() -> u64 {
    32 * MB
}

const fn default_secondary_log_buffer_size() -> u64 {
    128 * KB
}

const fn default_backup_range_size() -> u64 {
    256 * MB
}

const fn default_max_chunk_size() -> u64 {
    MB
}

const fn default_utilization_activate() -> u8 {
    60
}

const fn default_utilization_prompt() -> u8 {
    75
}

const fn default_cold_data_threshold() -> u32 {
    DEFAULT_COLD_DATA_THRESHOLD_SECS
}

const fn default_version_array_chunk_size() -> u64 {
    64
}

const fn default_flush_timeout_ms() -> u64 {
    100
}

impl LogConfig {
    /// Size of one secondary log (two backup ranges worth of data)
    #[must_use]
    pub const fn secondary_log_size(&self) -> u64 {
        self.backup_range_size * 2
    }

    /// Number of segments per secondary log
    #[must_use]
    pub const fn segments_per_log(&self) -> u64 {
        self.secondary_log_size() / self.log_segment_size
    }

    /// Capacity of the dense version window of one range
    ///
    /// Half a secondary log divided by the assumed chunk size, plus one slot
    /// so that local ID 0 is covered by the very first range.
    #[must_use]
    pub fn version_array_capacity(&self) -> usize {
        let per_chunk = self.version_array_chunk_size.max(1);
        usize::try_from(self.secondary_log_size() / 2 / per_chunk + 1).unwrap_or(usize::MAX)
    }

    /// Size of the version log kept next to every secondary log
    #[must_use]
    pub const fn version_log_size(&self) -> u64 {
        self.secondary_log_size() / 4
    }

    /// Largest log entry (header and payload). Larger chunks are split into
    /// chained entries.
    #[must_use]
    pub const fn max_log_entry_size(&self) -> u64 {
        self.log_segment_size / 2
    }

    /// Write buffer flush timeout
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.write_buffer_flush_timeout_ms)
    }

    /// Check all size relationships and thresholds.
    ///
    /// Returns a configuration error for every violated invariant. Risky
    /// but permitted settings are only logged.
    pub fn validate(&self) -> Result<()> {
        let page = self.flash_page_size;
        if page == 0 {
            return Err(Error::configuration("flash page size must not be 0"));
        }

        let sizes = [
            ("primary log size", self.primary_log_size),
            ("secondary log size", self.secondary_log_size()),
            ("write buffer size", self.write_buffer_size),
            ("log segment size", self.log_segment_size),
            ("secondary log buffer size", self.secondary_log_buffer_size),
        ];
        for (name, size) in sizes {
            if size % page != 0 || size <= page {
                return Err(Error::configuration(format!(
                    "{name} ({size}) must be a multiple of and greater than the flash page size ({page})"
                )));
            }
        }

        let segment = self.log_segment_size;
        let segmented = [
            ("primary log size", self.primary_log_size),
            ("secondary log size", self.secondary_log_size()),
            ("write buffer size", self.write_buffer_size),
        ];
        for (name, size) in segmented {
            if size % segment != 0 || size <= segment {
                return Err(Error::configuration(format!(
                    "{name} ({size}) must be a multiple of and greater than the segment size ({segment})"
                )));
            }
        }

        if self.secondary_log_buffer_size > segment {
            return Err(Error::configuration(format!(
                "secondary log buffer size ({}) must not exceed the segment size ({segment})",
                self.secondary_log_buffer_size
            )));
        }

        if self.secondary_log_size() <= self.max_chunk_size
            || self.write_buffer_size <= self.max_chunk_size
        {
            return Err(Error::configuration(format!(
                "secondary log size and write buffer size must be greater than the max chunk size ({})",
                self.max_chunk_size
            )));
        }

        let link_payload = self
            .max_log_entry_size()
            .saturating_sub(MAX_LOG_ENTRY_HEADER_SIZE as u64)
            .max(1);
        if self.max_chunk_size.div_ceil(link_payload) > u64::from(u8::MAX) {
            return Err(Error::configuration(format!(
                "a chunk of max size ({}) needs more than {} chained entries of {} bytes",
                self.max_chunk_size,
                u8::MAX,
                self.max_log_entry_size()
            )));
        }

        let activate = self.utilization_activate_reorganization;
        let prompt = self.utilization_prompt_reorganization;
        if activate == 0 || activate > 100 || prompt == 0 || prompt > 100 {
            return Err(Error::configuration(
                "reorganization thresholds must be percentages between 1 and 100",
            ));
        }
        if activate > prompt {
            return Err(Error::configuration(format!(
                "activation threshold ({activate}%) must not exceed prompt threshold ({prompt}%)"
            )));
        }

        if self.version_array_chunk_size == 0 {
            return Err(Error::configuration(
                "version array chunk size must not be 0",
            ));
        }

        if prompt <= 50 {
            warn!(
                "Prompt reorganization threshold is {}% (<= 50%), reorganization runs continuously",
                prompt
            );
        }

        if !self.use_timestamps && self.cold_data_threshold_secs != DEFAULT_COLD_DATA_THRESHOLD_SECS {
            warn!("Cold data threshold was modified, but timestamps are disabled");
        }

        Ok(())
    }
}
