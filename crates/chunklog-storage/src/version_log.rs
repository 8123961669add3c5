//! Persisted version log of a backup range
//!
//! Version changes are appended to a file next to the secondary log so that
//! versions survive when compaction drops the entries carrying them. On open
//! all records are merged (newest version wins) and written back compacted.
//!
//! Record format:
//! ```text
//! +----------+-------+---------+
//! | Chunk ID | Epoch | Version |
//! | 8B       | 2B    | 3B      |
//! +----------+-------+---------+
//! ```
//!
//! All fields are little-endian. A record with version number 0 ends the
//! log; every write is followed by one.

use crate::disk::{DiskAccess, LogFile};
use chunklog_common::{ChunkId, Error, Result, Version};
use tracing::{debug, info};

/// Size of one record
pub const VERSION_RECORD_SIZE: usize = 13;

/// Records read per file access
const READ_BATCH_RECORDS: usize = 4096;

const END_RECORD: [u8; VERSION_RECORD_SIZE] = [0; VERSION_RECORD_SIZE];

fn encode_record(chunk_id: ChunkId, version: Version, out: &mut Vec<u8>) {
    out.extend_from_slice(&chunk_id.raw().to_le_bytes());
    out.extend_from_slice(&version.epoch.to_le_bytes());
    out.extend_from_slice(&version.version.to_le_bytes()[..3]);
}

/// Decode one record; `None` for the end record
fn decode_record(buf: &[u8]) -> Option<(ChunkId, Version)> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    let epoch = u16::from_le_bytes([buf[8], buf[9]]);
    let version = u32::from_le_bytes([buf[10], buf[11], buf[12], 0]);
    (version != 0).then(|| (ChunkId::from_raw(u64::from_le_bytes(raw)), Version::new(epoch, version)))
}

fn encode_records(records: &[(ChunkId, Version)]) -> Vec<u8> {
    let mut out = Vec::with_capacity((records.len() + 1) * VERSION_RECORD_SIZE);
    for (chunk_id, version) in records {
        encode_record(*chunk_id, *version, &mut out);
    }
    out
}

/// Append-only file of version records
pub struct VersionLog {
    file: Box<dyn LogFile>,
    /// Bytes of records before the end record
    used: u64,
}

impl VersionLog {
    /// Create (or replace) an empty version log
    pub fn create(access: &DiskAccess, name: &str, size: u64) -> Result<Self> {
        let mut file = access.create_log(name, size)?;
        file.write_truncate(0, &END_RECORD)?;
        debug!("Created version log {} ({} bytes)", name, size);
        Ok(Self { file, used: 0 })
    }

    /// Open a version log and read all of its records, oldest first. The
    /// log is not written; [`Self::write_back`] sets where appends go.
    pub fn open(access: &DiskAccess, name: &str) -> Result<(Self, Vec<(ChunkId, Version)>)> {
        let file = access.open_log(name)?;
        let size = file.size();
        let mut records = Vec::new();
        let mut buf = vec![0u8; READ_BATCH_RECORDS * VERSION_RECORD_SIZE];
        let mut offset = 0u64;

        'read: while offset + VERSION_RECORD_SIZE as u64 <= size {
            let whole = ((size - offset) as usize / VERSION_RECORD_SIZE).min(READ_BATCH_RECORDS);
            let batch = &mut buf[..whole * VERSION_RECORD_SIZE];
            file.read_at(offset, batch)?;
            for record in batch.chunks_exact(VERSION_RECORD_SIZE) {
                match decode_record(record) {
                    Some(record) => records.push(record),
                    None => break 'read,
                }
                offset += VERSION_RECORD_SIZE as u64;
            }
        }

        info!("Read {} records from version log {}", records.len(), name);
        Ok((Self { file, used: offset }, records))
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Bytes held by records
    pub const fn used(&self) -> u64 {
        self.used
    }

    /// Records the file holds at most
    pub fn capacity(&self) -> usize {
        (self.file.size() as usize / VERSION_RECORD_SIZE).saturating_sub(1)
    }

    /// Whether `count` more records fit behind the current ones
    pub fn fits(&self, count: usize) -> bool {
        self.used + ((count + 1) * VERSION_RECORD_SIZE) as u64 <= self.file.size()
    }

    /// Append records after the current ones
    pub fn append(&mut self, records: &[(ChunkId, Version)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if !self.fits(records.len()) {
            return Err(Error::Storage(format!(
                "version log {} has no room for {} records",
                self.name(),
                records.len()
            )));
        }
        let mut data = encode_records(records);
        let len = data.len() as u64;
        data.extend_from_slice(&END_RECORD);
        self.file.write_at(self.used, &data)?;
        self.used += len;
        Ok(())
    }

    /// Replace all records by `records`
    pub fn write_back(&mut self, records: &[(ChunkId, Version)]) -> Result<()> {
        if records.len() > self.capacity() {
            return Err(Error::Storage(format!(
                "version log {} cannot hold {} records",
                self.name(),
                records.len()
            )));
        }
        let mut data = encode_records(records);
        let len = data.len() as u64;
        data.extend_from_slice(&END_RECORD);
        self.file.write_truncate(0, &data)?;
        self.used = len;
        debug!("Wrote back {} records to version log {}", records.len(), self.name());
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        self.file.rename(new_name)
    }

    /// Delete the file
    pub fn remove(self) -> Result<()> {
        self.file.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(dir: &std::path::Path) -> DiskAccess {
        DiskAccess::Buffered {
            dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let mut log = VersionLog::create(&access, "r.ver", 4096).unwrap();
        log.append(&[(ChunkId::new(1, 5), Version::new(0, 3))]).unwrap();
        log.append(&[
            (ChunkId::new(1, 6), Version::new(2, 0x00AB_CDEF)),
            (ChunkId::new(1, 5), Version::new(0, 4)),
        ])
        .unwrap();
        assert_eq!(log.used(), 3 * VERSION_RECORD_SIZE as u64);
        log.sync().unwrap();
        drop(log);

        let (log, records) = VersionLog::open(&access, "r.ver").unwrap();
        assert_eq!(
            records,
            vec![
                (ChunkId::new(1, 5), Version::new(0, 3)),
                (ChunkId::new(1, 6), Version::new(2, 0x00AB_CDEF)),
                (ChunkId::new(1, 5), Version::new(0, 4)),
            ]
        );
        assert_eq!(log.used(), 3 * VERSION_RECORD_SIZE as u64);
    }

    #[test]
    fn test_write_back_replaces_records() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let mut log = VersionLog::create(&access, "r.ver", 4096).unwrap();
        let many: Vec<_> = (0..50).map(|i| (ChunkId::new(1, i), Version::new(0, 1))).collect();
        log.append(&many).unwrap();

        log.write_back(&[(ChunkId::new(1, 7), Version::new(0, 9))]).unwrap();
        log.append(&[(ChunkId::new(1, 8), Version::new(0, 2))]).unwrap();
        drop(log);

        let (_, records) = VersionLog::open(&access, "r.ver").unwrap();
        assert_eq!(
            records,
            vec![
                (ChunkId::new(1, 7), Version::new(0, 9)),
                (ChunkId::new(1, 8), Version::new(0, 2)),
            ]
        );
    }

    #[test]
    fn test_full_log_rejects_append() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let mut log = VersionLog::create(&access, "r.ver", 4096).unwrap();
        // 4096 bytes hold 314 records plus the end record
        let records: Vec<_> = (0..314).map(|i| (ChunkId::new(1, i), Version::new(0, 2))).collect();
        log.append(&records).unwrap();
        assert_eq!(log.capacity(), 314);
        assert!(!log.fits(1));
        assert!(log.append(&[(ChunkId::new(1, 999), Version::new(0, 2))]).is_err());
        assert!(log.write_back(&[records.clone(), records].concat()).is_err());
    }
}
