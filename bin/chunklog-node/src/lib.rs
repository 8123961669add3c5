//! chunklog node configuration
//!
//! A node is configured from a TOML file:
//! ```toml
//! [node]
//! id = 1
//!
//! [log]
//! backup_directory = "/var/lib/chunklog"
//! log_segment_size = 8388608
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//! Every table and key is optional. Command line flags override the file.

use anyhow::{Context, Result, bail};
use chunklog_common::{LogConfig, NodeId, RESERVED_NODE_ID};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_id")]
    pub id: NodeId,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_node_id() -> NodeId {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Command line values that take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub node_id: Option<NodeId>,
    pub backup_directory: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Load `path`, or the defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Merge CLI values into the file configuration (CLI takes precedence)
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(id) = overrides.node_id {
            self.node.id = id;
        }
        if let Some(dir) = overrides.backup_directory {
            self.log.backup_directory = dir;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
        self
    }

    /// Check the node ID and the log configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.id == RESERVED_NODE_ID {
            bail!("node ID 0x{:04X} is reserved", RESERVED_NODE_ID);
        }
        self.log.validate()?;
        Ok(())
    }

    /// Human-readable summary of the derived log geometry
    #[must_use]
    pub fn describe(&self) -> String {
        let log = &self.log;
        format!(
            "node 0x{:04X}\n\
             backup directory: {}\n\
             access: {:?}, checksums: {}, timestamps: {}\n\
             segment size: {} bytes, {} segments per secondary log ({} bytes)\n\
             primary log: {} bytes, write buffer: {} bytes, range buffer: {} bytes\n\
             reorganization: activate at {}%, prompt at {}%\n",
            self.node.id,
            log.backup_directory.display(),
            log.harddrive_access,
            log.use_checksums,
            log.use_timestamps,
            log.log_segment_size,
            log.segments_per_log(),
            log.secondary_log_size(),
            log.primary_log_size,
            log.write_buffer_size,
            log.secondary_log_buffer_size,
            log.utilization_activate_reorganization,
            log.utilization_prompt_reorganization,
        )
    }
}
