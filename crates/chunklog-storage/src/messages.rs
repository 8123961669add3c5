//! Backup messages handled by the log engine
//!
//! The transport is not part of this crate: whoever receives a message
//! deserializes it into a [`Message`] and passes it to a
//! [`MessageDispatcher`], which answers requests with a [`Response`].
//!
//! Log message payloads are a sequence of chunk records:
//! ```text
//! +-------------+------------+-----------------+
//! | Chunk ID 8B | Length 4B  | Payload (Length)|  ... repeated
//! +-------------+------------+-----------------+
//! ```
//! All integers are little-endian.

use crate::service::LogEngine;
use chunklog_common::{ChunkId, Error, NodeId, RangeId, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

const RECORD_HEADER_SIZE: usize = 8 + 4;

/// Encode chunk records for a log message payload
pub fn encode_chunks<'a>(chunks: impl IntoIterator<Item = (ChunkId, &'a [u8])>) -> Vec<u8> {
    let mut out = Vec::new();
    for (chunk_id, payload) in chunks {
        out.extend_from_slice(&chunk_id.raw().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}

/// Decode exactly `count` chunk records
pub fn decode_chunks(payload: &[u8], count: usize) -> Result<Vec<(ChunkId, &[u8])>> {
    let mut chunks = Vec::with_capacity(count.min(payload.len() / RECORD_HEADER_SIZE));
    let mut pos = 0;
    for i in 0..count {
        let header = payload.get(pos..pos + RECORD_HEADER_SIZE).ok_or_else(|| {
            Error::invalid_argument(format!("log message truncated in record header {i} of {count}"))
        })?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&header[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[8..]);
        let len = u32::from_le_bytes(len) as usize;

        pos += RECORD_HEADER_SIZE;
        let data = payload.get(pos..pos + len).ok_or_else(|| {
            Error::invalid_argument(format!("log message truncated in payload of record {i} of {count}"))
        })?;
        chunks.push((ChunkId::from_raw(u64::from_le_bytes(id)), data));
        pos += len;
    }

    if pos != payload.len() {
        return Err(Error::invalid_argument(format!(
            "{} trailing bytes after {count} records",
            payload.len() - pos
        )));
    }
    Ok(chunks)
}

/// How a log message was produced by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Chunks of a named data structure
    Named,
    /// Chunks without a name
    Anonymous,
    /// Pre-assembled buffer of records
    Buffer,
}

/// Messages consumed by the log engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Create a range for chunks created by `source`
    InitBackupRange { source: NodeId, range: RangeId },
    /// Create a range for chunks migrated to `source`
    InitMigrationBackupRange { source: NodeId, range: RangeId },
    /// Take over a range of a failed node
    InitRecoveredBackupRange {
        source: NodeId,
        range: RangeId,
        original_range: RangeId,
        original_owner: NodeId,
        is_new_range: bool,
    },
    /// Chunks to back up in `source`'s range
    Log {
        source: NodeId,
        range: RangeId,
        count: u32,
        kind: LogKind,
        payload: Vec<u8>,
    },
    /// Chunks removed from a range
    Remove {
        source: NodeId,
        range: RangeId,
        owner: NodeId,
        chunk_ids: Vec<ChunkId>,
    },
    /// Report for a node
    GetUtilization { node: NodeId },
}

impl Message {
    /// Whether the sender waits for a response
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::InitBackupRange { .. }
                | Self::InitMigrationBackupRange { .. }
                | Self::InitRecoveredBackupRange { .. }
                | Self::GetUtilization { .. }
        )
    }
}

/// Responses to requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Outcome of a range initialization
    Success(bool),
    Utilization(String),
}

/// Routes messages to a [`LogEngine`]
pub struct MessageDispatcher {
    engine: Arc<LogEngine>,
}

impl MessageDispatcher {
    pub const fn new(engine: Arc<LogEngine>) -> Self {
        Self { engine }
    }

    /// Handle one message. Requests get a response, failures of one-way
    /// messages are logged.
    pub fn dispatch(&self, message: Message) -> Option<Response> {
        match message {
            Message::InitBackupRange { source, range } => {
                Some(self.acknowledge(self.engine.init_backup_range(source, range)))
            }
            Message::InitMigrationBackupRange { source, range } => {
                Some(self.acknowledge(self.engine.init_migration_backup_range(source, range)))
            }
            Message::InitRecoveredBackupRange {
                source,
                range,
                original_range,
                original_owner,
                is_new_range,
            } => Some(self.acknowledge(self.engine.init_recovered_backup_range(
                range,
                original_range,
                original_owner,
                source,
                is_new_range,
            ))),
            Message::Log {
                source,
                range,
                count,
                kind,
                payload,
            } => {
                match self.engine.log_chunks(source, range, count as usize, &payload) {
                    Ok(logged) => debug!("Logged {} chunks ({:?}) from 0x{:04X}", logged, kind, source),
                    Err(e) => error!("Log message from 0x{:04X} for range {} failed: {}", source, range, e),
                }
                None
            }
            Message::Remove {
                source,
                range,
                owner,
                chunk_ids,
            } => {
                if let Err(e) = self.engine.remove_chunks(owner, range, &chunk_ids) {
                    error!("Remove message from 0x{:04X} for range {} failed: {}", source, range, e);
                }
                None
            }
            Message::GetUtilization { node } => {
                let report = if node == self.engine.node_id() {
                    self.engine.current_utilization()
                } else {
                    format!("Node 0x{node:04X} is not served here\n")
                };
                Some(Response::Utilization(report))
            }
        }
    }

    fn acknowledge(&self, result: Result<()>) -> Response {
        if let Err(e) = &result {
            error!("Backup range request on node 0x{:04X} failed: {}", self.engine.node_id(), e);
        }
        Response::Success(result.is_ok())
    }
}
