//! Log file access
//!
//! Primary and secondary logs are fixed-size files accessed by offset.
//! Logs written front to back (the primary log, version logs) use the append
//! position instead: `append` writes there and advances it, `write_truncate`
//! writes and makes the end of its data the new append position. The
//! access method is chosen once per node from [`HarddriveAccess`]:
//! - `BufferedFile`: regular files through the page cache
//! - `Direct`: regular files opened with O_DIRECT, unaligned writes are done
//!   as read-modify-write of the covering aligned blocks
//! - `RawPartition`: one device (or large file) holding every log in an
//!   allocated region, with a JSON region index in the first 64 KiB
//!
//! Raw partition layout:
//! ```text
//! +---------------------------+------------+------------+-----
//! | Index header (64 KiB)     | Region 0   | Region 1   | ...
//! | magic | len | JSON index  | (aligned)  | (aligned)  |
//! +---------------------------+------------+------------+-----
//! ```

use crate::raw_io::{
    ALIGNMENT, AlignedBuffer, align_down, align_up, block_device_size, is_block_device,
    open_direct, preallocate,
};
use chunklog_common::{Error, HarddriveAccess, LogConfig, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Size of the raw partition index header
pub const RAW_INDEX_SIZE: u64 = 64 * 1024;

const RAW_MAGIC: &[u8; 8] = b"CHLGRAW1";

/// One log file, addressed by offset
pub trait LogFile: Send + Sync {
    /// Name of the log (file name, or region name on a raw partition)
    fn name(&self) -> &str;

    /// Size in bytes
    fn size(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Write `data` at the append position and advance it. Returns the
    /// offset written to. The append position of a new log is 0, that of an
    /// opened log is its size.
    fn append(&mut self, data: &[u8]) -> Result<u64>;

    /// Write `data` at `offset` and discard everything behind it; the end
    /// of `data` becomes the append position. The byte at the new end reads
    /// as zero. The size is kept.
    fn write_truncate(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()>;

    /// Give the log a new name
    fn rename(&mut self, new_name: &str) -> Result<()>;

    /// Delete the log
    fn remove(self: Box<Self>) -> Result<()>;
}

fn check_bounds(name: &str, size: u64, offset: u64, len: usize) -> Result<()> {
    if offset + len as u64 > size {
        return Err(Error::Storage(format!(
            "access of {len} bytes at offset {offset} beyond end of {name} ({size} bytes)"
        )));
    }
    Ok(())
}

/// Regular file through the page cache
pub struct BufferedFile {
    file: File,
    path: PathBuf,
    name: String,
    size: u64,
    /// Append position
    end: u64,
}

impl BufferedFile {
    /// Create (or truncate) a log file of the given size
    pub fn create(dir: &Path, name: &str, size: u64) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path.display(), e)))?;
        preallocate(&file, &path, size)?;
        Ok(Self {
            file,
            path,
            name: name.to_string(),
            size,
            end: 0,
        })
    }

    /// Open an existing log file
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to get metadata for {}: {}", path.display(), e)))?
            .len();
        Ok(Self {
            file,
            path,
            name: name.to_string(),
            size,
            end: size,
        })
    }
}

impl LogFile for BufferedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(&self.name, self.size, offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {}", self.path.display(), e)))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(&self.name, self.size, offset, data.len())?;
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.path.display(), e)))
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.write_at(offset, data)?;
        self.end += data.len() as u64;
        Ok(offset)
    }

    fn write_truncate(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data)?;
        let end = offset + data.len() as u64;
        // Cut, then reserve the full size again
        self.file
            .set_len(end)
            .map_err(|e| Error::Storage(format!("failed to truncate {}: {}", self.path.display(), e)))?;
        preallocate(&self.file, &self.path, self.size)?;
        self.end = end;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {}", self.path.display(), e)))
    }

    fn rename(&mut self, new_name: &str) -> Result<()> {
        let new_path = self.path.with_file_name(new_name);
        std::fs::rename(&self.path, &new_path).map_err(|e| {
            Error::Storage(format!("failed to rename {} to {}: {}", self.path.display(), new_name, e))
        })?;
        self.path = new_path;
        self.name = new_name.to_string();
        Ok(())
    }

    fn remove(self: Box<Self>) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)
            .map_err(|e| Error::Storage(format!("failed to remove {}: {}", path.display(), e)))
    }
}

/// Regular file opened for direct I/O
pub struct DirectFile {
    file: File,
    path: PathBuf,
    name: String,
    size: u64,
    /// Append position
    end: u64,
}

impl DirectFile {
    /// Create (or truncate) a log file of the given size, rounded up to [`ALIGNMENT`]
    pub fn create(dir: &Path, name: &str, size: u64) -> Result<Self> {
        let path = dir.join(name);
        let file = open_direct(&path, true)?;
        let size = align_up(size);
        preallocate(&file, &path, size)?;
        Ok(Self {
            file,
            path,
            name: name.to_string(),
            size,
            end: 0,
        })
    }

    /// Open an existing log file
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = open_direct(&path, false)?;
        let size = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to get metadata for {}: {}", path.display(), e)))?
            .len();
        Ok(Self {
            file,
            path,
            name: name.to_string(),
            size,
            end: size,
        })
    }

    /// Read the aligned block range covering `[offset, offset + len)`
    fn read_covering(&self, offset: u64, len: usize) -> Result<(u64, AlignedBuffer)> {
        let start = align_down(offset);
        let end = align_up(offset + len as u64);
        let mut bounce = AlignedBuffer::new((end - start) as usize)?;
        self.file
            .read_exact_at(&mut bounce, start)
            .map_err(|e| Error::Storage(format!("read failed on {}: {}", self.path.display(), e)))?;
        Ok((start, bounce))
    }
}

impl LogFile for DirectFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(&self.name, self.size, offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let (start, bounce) = self.read_covering(offset, buf.len())?;
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&bounce[skip..skip + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(&self.name, self.size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let (start, mut bounce) = self.read_covering(offset, data.len())?;
        let skip = (offset - start) as usize;
        bounce[skip..skip + data.len()].copy_from_slice(data);
        self.file
            .write_all_at(&bounce, start)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.path.display(), e)))
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.write_at(offset, data)?;
        self.end += data.len() as u64;
        Ok(offset)
    }

    fn write_truncate(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data)?;
        let end = offset + data.len() as u64;
        // The length must stay aligned: zero the rest of the last block
        let block_end = align_up(end).min(self.size);
        if block_end > end {
            self.write_at(end, &vec![0u8; (block_end - end) as usize])?;
        }
        self.file
            .set_len(block_end)
            .map_err(|e| Error::Storage(format!("failed to truncate {}: {}", self.path.display(), e)))?;
        preallocate(&self.file, &self.path, self.size)?;
        self.end = end;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {}", self.path.display(), e)))
    }

    fn rename(&mut self, new_name: &str) -> Result<()> {
        let new_path = self.path.with_file_name(new_name);
        std::fs::rename(&self.path, &new_path).map_err(|e| {
            Error::Storage(format!("failed to rename {} to {}: {}", self.path.display(), new_name, e))
        })?;
        self.path = new_path;
        self.name = new_name.to_string();
        Ok(())
    }

    fn remove(self: Box<Self>) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)
            .map_err(|e| Error::Storage(format!("failed to remove {}: {}", path.display(), e)))
    }
}

/// Allocated region of a raw partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct FreeExtent {
    offset: u64,
    size: u64,
}

/// Persistent region index of a raw partition
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegionIndex {
    regions: Vec<Region>,
    free: Vec<FreeExtent>,
    /// First never-allocated byte
    next_offset: u64,
}

impl RegionIndex {
    fn allocate(&mut self, size: u64, capacity: u64) -> Option<u64> {
        if let Some(pos) = self.free.iter().position(|f| f.size >= size) {
            let extent = &mut self.free[pos];
            let offset = extent.offset;
            extent.offset += size;
            extent.size -= size;
            if extent.size == 0 {
                self.free.remove(pos);
            }
            return Some(offset);
        }
        if self.next_offset + size > capacity {
            return None;
        }
        let offset = self.next_offset;
        self.next_offset += size;
        Some(offset)
    }

    fn release(&mut self, offset: u64, size: u64) {
        self.free.push(FreeExtent { offset, size });
        self.free.sort_by_key(|f| f.offset);
        // Merge neighbours
        let mut merged: Vec<FreeExtent> = Vec::with_capacity(self.free.len());
        for extent in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == extent.offset => last.size += extent.size,
                _ => merged.push(extent),
            }
        }
        // Give the tail back to the bump allocator
        if let Some(last) = merged.last()
            && last.offset + last.size == self.next_offset
        {
            self.next_offset = last.offset;
            merged.pop();
        }
        self.free = merged;
    }
}

/// A device or large file holding all logs of a node
pub struct RawPartition {
    file: File,
    path: PathBuf,
    capacity: u64,
    index: Mutex<RegionIndex>,
}

impl RawPartition {
    /// Open a raw partition, formatting it if it carries no index yet
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let block_device = is_block_device(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!block_device)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;

        // Regular files grow on demand
        let capacity = if block_device {
            block_device_size(&file, path)?
        } else {
            u64::MAX
        };

        let mut header = vec![0u8; RAW_INDEX_SIZE as usize];
        let existing = file
            .metadata()
            .map(|m| m.len() >= RAW_INDEX_SIZE)
            .unwrap_or(false)
            || block_device;
        if existing {
            file.read_exact_at(&mut header, 0).map_err(|e| {
                Error::Storage(format!("failed to read index of {}: {}", path.display(), e))
            })?;
        }

        let partition = if &header[..RAW_MAGIC.len()] == RAW_MAGIC {
            let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
            let json = header.get(12..12 + len).ok_or_else(|| {
                Error::corruption(format!("raw partition index of {} truncated", path.display()))
            })?;
            let index: RegionIndex = serde_json::from_slice(json).map_err(|e| {
                Error::corruption(format!("invalid raw partition index in {}: {}", path.display(), e))
            })?;
            info!(
                "Opened raw partition {} with {} logs",
                path.display(),
                index.regions.len()
            );
            Self {
                file,
                path: path.to_path_buf(),
                capacity,
                index: Mutex::new(index),
            }
        } else {
            info!("Formatting raw partition {}", path.display());
            let partition = Self {
                file,
                path: path.to_path_buf(),
                capacity,
                index: Mutex::new(RegionIndex {
                    next_offset: RAW_INDEX_SIZE,
                    ..Default::default()
                }),
            };
            partition.persist(&partition.index.lock())?;
            partition
        };

        Ok(Arc::new(partition))
    }

    fn persist(&self, index: &RegionIndex) -> Result<()> {
        let json = serde_json::to_vec(index)
            .map_err(|e| Error::internal(format!("failed to encode raw partition index: {e}")))?;
        if json.len() + 12 > RAW_INDEX_SIZE as usize {
            return Err(Error::Storage(format!(
                "raw partition index of {} exceeds {} bytes",
                self.path.display(),
                RAW_INDEX_SIZE
            )));
        }
        let mut header = vec![0u8; RAW_INDEX_SIZE as usize];
        header[..8].copy_from_slice(RAW_MAGIC);
        header[8..12].copy_from_slice(&(json.len() as u32).to_le_bytes());
        header[12..12 + json.len()].copy_from_slice(&json);
        self.file
            .write_all_at(&header, 0)
            .and_then(|()| self.file.sync_data())
            .map_err(|e| Error::Storage(format!("failed to write index of {}: {}", self.path.display(), e)))
    }

    /// Allocate a region for a new log; an existing region of that name is replaced
    pub fn create(self: &Arc<Self>, name: &str, size: u64) -> Result<RawRegionFile> {
        let size = align_up(size);
        let mut index = self.index.lock();
        if let Some(pos) = index.regions.iter().position(|r| r.name == name) {
            let old = index.regions.remove(pos);
            index.release(old.offset, old.size);
        }
        let offset = index.allocate(size, self.capacity).ok_or_else(|| {
            Error::Storage(format!(
                "raw partition {} has no room for {} bytes",
                self.path.display(),
                size
            ))
        })?;
        index.regions.push(Region {
            name: name.to_string(),
            offset,
            size,
        });
        self.persist(&index)?;

        if self.capacity == u64::MAX {
            let end = offset + size;
            let len = self
                .file
                .metadata()
                .map_err(|e| Error::Storage(format!("failed to get metadata for {}: {}", self.path.display(), e)))?
                .len();
            if len < end {
                self.file.set_len(end).map_err(|e| {
                    Error::Storage(format!("failed to grow {}: {}", self.path.display(), e))
                })?;
            }
        }

        // Stale data of an earlier log must not look like entries
        let zeros = vec![0u8; ALIGNMENT.min(size as usize)];
        self.file
            .write_all_at(&zeros, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.path.display(), e)))?;

        debug!("Allocated region {} at {} ({} bytes)", name, offset, size);
        Ok(RawRegionFile {
            partition: Arc::clone(self),
            region: Region {
                name: name.to_string(),
                offset,
                size,
            },
            end: 0,
        })
    }

    /// Open the region of an existing log
    pub fn open_region(self: &Arc<Self>, name: &str) -> Result<RawRegionFile> {
        let index = self.index.lock();
        let region = index
            .regions
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("log {} not found on {}", name, self.path.display())))?;
        Ok(RawRegionFile {
            partition: Arc::clone(self),
            end: region.size,
            region,
        })
    }

    /// Names of all logs on the partition
    pub fn list(&self) -> Vec<String> {
        self.index.lock().regions.iter().map(|r| r.name.clone()).collect()
    }

    fn rename_region(&self, old: &str, new: &str) -> Result<()> {
        let mut index = self.index.lock();
        if index.regions.iter().any(|r| r.name == new) {
            return Err(Error::Storage(format!("log {new} already exists")));
        }
        let region = index
            .regions
            .iter_mut()
            .find(|r| r.name == old)
            .ok_or_else(|| Error::Storage(format!("log {old} not found")))?;
        region.name = new.to_string();
        self.persist(&index)
    }

    fn remove_region(&self, name: &str) -> Result<()> {
        let mut index = self.index.lock();
        let pos = index
            .regions
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::Storage(format!("log {name} not found")))?;
        let region = index.regions.remove(pos);
        index.release(region.offset, region.size);
        self.persist(&index)
    }
}

/// A log stored in a region of a [`RawPartition`]
pub struct RawRegionFile {
    partition: Arc<RawPartition>,
    region: Region,
    /// Append position
    end: u64,
}

impl LogFile for RawRegionFile {
    fn name(&self) -> &str {
        &self.region.name
    }

    fn size(&self) -> u64 {
        self.region.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(&self.region.name, self.region.size, offset, buf.len())?;
        self.partition
            .file
            .read_exact_at(buf, self.region.offset + offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {}", self.region.name, e)))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(&self.region.name, self.region.size, offset, data.len())?;
        self.partition
            .file
            .write_all_at(data, self.region.offset + offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.region.name, e)))
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.write_at(offset, data)?;
        self.end += data.len() as u64;
        Ok(offset)
    }

    fn write_truncate(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data)?;
        let end = offset + data.len() as u64;
        // A region cannot shrink; a zero byte marks the cut
        if end < self.region.size {
            self.write_at(end, &[0])?;
        }
        self.end = end;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.partition
            .file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {}", self.region.name, e)))
    }

    fn rename(&mut self, new_name: &str) -> Result<()> {
        self.partition.rename_region(&self.region.name, new_name)?;
        self.region.name = new_name.to_string();
        Ok(())
    }

    fn remove(self: Box<Self>) -> Result<()> {
        self.partition.remove_region(&self.region.name)
    }
}

/// Factory for log files under the configured access method
#[derive(Clone)]
pub enum DiskAccess {
    Buffered { dir: PathBuf },
    Direct { dir: PathBuf },
    RawPartition(Arc<RawPartition>),
}

impl DiskAccess {
    /// Set up log access for the configured method
    pub fn open(config: &LogConfig) -> Result<Self> {
        let dir = config.backup_directory.clone();
        match config.harddrive_access {
            HarddriveAccess::BufferedFile => {
                create_dir(&dir)?;
                Ok(Self::Buffered { dir })
            }
            HarddriveAccess::Direct => {
                create_dir(&dir)?;
                Ok(Self::Direct { dir })
            }
            HarddriveAccess::RawPartition => {
                let device = &config.raw_device_path;
                if device.as_os_str().is_empty() {
                    return Err(Error::configuration(
                        "raw_device_path is required for raw partition access",
                    ));
                }
                Ok(Self::RawPartition(RawPartition::open(device)?))
            }
        }
    }

    /// Create (or recreate) a log of the given size
    pub fn create_log(&self, name: &str, size: u64) -> Result<Box<dyn LogFile>> {
        Ok(match self {
            Self::Buffered { dir } => Box::new(BufferedFile::create(dir, name, size)?),
            Self::Direct { dir } => Box::new(DirectFile::create(dir, name, size)?),
            Self::RawPartition(partition) => Box::new(partition.create(name, size)?),
        })
    }

    /// Open an existing log
    pub fn open_log(&self, name: &str) -> Result<Box<dyn LogFile>> {
        Ok(match self {
            Self::Buffered { dir } => Box::new(BufferedFile::open(dir, name)?),
            Self::Direct { dir } => Box::new(DirectFile::open(dir, name)?),
            Self::RawPartition(partition) => Box::new(partition.open_region(name)?),
        })
    }

    /// Whether a log with this name exists
    pub fn exists(&self, name: &str) -> bool {
        match self {
            Self::Buffered { dir } | Self::Direct { dir } => dir.join(name).is_file(),
            Self::RawPartition(partition) => partition.list().iter().any(|n| n == name),
        }
    }

    /// Names of all `.log` files, sorted
    pub fn list_logs(&self) -> Result<Vec<String>> {
        let mut names = match self {
            Self::Buffered { dir } | Self::Direct { dir } => {
                let entries = std::fs::read_dir(dir)
                    .map_err(|e| Error::Storage(format!("failed to list {}: {}", dir.display(), e)))?;
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|e| {
                        Error::Storage(format!("failed to list {}: {}", dir.display(), e))
                    })?;
                    if let Some(name) = entry.file_name().to_str()
                        && name.ends_with(".log")
                    {
                        names.push(name.to_string());
                    }
                }
                names
            }
            Self::RawPartition(partition) => partition
                .list()
                .into_iter()
                .filter(|name| name.ends_with(".log"))
                .collect(),
        };
        names.sort();
        Ok(names)
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Storage(format!("failed to create directory {}: {}", dir.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(access: &DiskAccess) {
        let mut log = access.create_log("N0001_sec0002_3.log", 3 * 4096).unwrap();
        assert_eq!(log.size(), 3 * 4096);

        // Unaligned write crossing a block boundary
        log.write_at(4090, b"across the boundary").unwrap();
        let mut buf = vec![0u8; 19];
        log.read_at(4090, &mut buf).unwrap();
        assert_eq!(&buf, b"across the boundary");

        // Untouched bytes read back as zero
        let mut zeros = vec![0xFFu8; 16];
        log.read_at(8192, &mut zeros).unwrap();
        assert!(zeros.iter().all(|b| *b == 0));

        assert!(log.write_at(3 * 4096 - 2, b"abc").is_err());
        log.sync().unwrap();

        log.rename("N0001_sec0002_3_renamed.log").unwrap();
        assert_eq!(log.name(), "N0001_sec0002_3_renamed.log");
        drop(log);

        let log = access.open_log("N0001_sec0002_3_renamed.log").unwrap();
        let mut buf = vec![0u8; 19];
        log.read_at(4090, &mut buf).unwrap();
        assert_eq!(&buf, b"across the boundary");
        assert_eq!(access.list_logs().unwrap(), vec!["N0001_sec0002_3_renamed.log"]);

        log.remove().unwrap();
        assert!(!access.exists("N0001_sec0002_3_renamed.log"));
    }

    fn exercise_append(access: &DiskAccess) {
        let mut log = access.create_log("primary.log", 2 * 4096).unwrap();
        assert_eq!(log.append(b"first").unwrap(), 0);
        assert_eq!(log.append(b"second").unwrap(), 5);
        let mut buf = vec![0u8; 11];
        log.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"firstsecond");

        // Cut behind "firXY": the rest is gone, appends continue at the cut
        log.write_truncate(3, b"XY").unwrap();
        let mut cut = [0xFFu8; 1];
        log.read_at(5, &mut cut).unwrap();
        assert_eq!(cut, [0]);
        assert_eq!(log.size(), 2 * 4096);
        assert_eq!(log.append(b"!").unwrap(), 5);
        let mut buf = vec![0u8; 6];
        log.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"firXY!");

        // The whole size stays usable, but not more
        log.write_at(2 * 4096 - 4, b"tail").unwrap();
        assert!(log.append(&vec![1u8; 2 * 4096]).is_err());

        log.write_truncate(0, &[]).unwrap();
        assert_eq!(log.append(b"again").unwrap(), 0);
        log.remove().unwrap();
    }

    #[test]
    fn test_buffered_file() {
        let dir = tempfile::tempdir().unwrap();
        let access = DiskAccess::Buffered {
            dir: dir.path().to_path_buf(),
        };
        exercise(&access);
        exercise_append(&access);
    }

    #[test]
    fn test_direct_file() {
        let dir = tempfile::tempdir().unwrap();
        let access = DiskAccess::Direct {
            dir: dir.path().to_path_buf(),
        };
        exercise(&access);
        exercise_append(&access);
    }

    #[test]
    fn test_raw_partition() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device.img");
        let access = DiskAccess::RawPartition(RawPartition::open(&device).unwrap());
        exercise(&access);
        exercise_append(&access);
    }

    #[test]
    fn test_opened_log_appends_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let access = DiskAccess::Buffered {
            dir: dir.path().to_path_buf(),
        };
        let mut log = access.create_log("v.ver", 4096).unwrap();
        log.append(b"abc").unwrap();
        drop(log);

        let mut log = access.open_log("v.ver").unwrap();
        // The append position of an opened log is its end
        assert!(log.append(b"x").is_err());
        log.write_truncate(0, b"abc").unwrap();
        assert_eq!(log.append(b"d").unwrap(), 3);
    }

    #[test]
    fn test_raw_partition_reopen_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device.img");
        {
            let access = DiskAccess::RawPartition(RawPartition::open(&device).unwrap());
            let mut a = access.create_log("a.log", 8192).unwrap();
            a.write_at(0, b"first").unwrap();
            let b = access.create_log("b.log", 8192).unwrap();
            drop(b);
            access.open_log("b.log").unwrap().remove().unwrap();
        }

        let partition = RawPartition::open(&device).unwrap();
        assert_eq!(partition.list(), vec!["a.log".to_string()]);
        let a = partition.open_region("a.log").unwrap();
        let mut buf = [0u8; 5];
        a.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"first");

        // The freed tail is handed out again
        let c = partition.create("c.log", 8192).unwrap();
        assert_eq!(c.region.offset, RAW_INDEX_SIZE + 8192);
    }

    #[test]
    fn test_region_index_merges_free_extents() {
        let mut index = RegionIndex {
            next_offset: 0,
            ..Default::default()
        };
        let a = index.allocate(100, 1000).unwrap();
        let b = index.allocate(100, 1000).unwrap();
        let c = index.allocate(100, 1000).unwrap();
        assert_eq!((a, b, c), (0, 100, 200));
        assert!(index.allocate(800, 1000).is_none());

        index.release(a, 100);
        index.release(b, 100);
        assert_eq!(index.free, vec![FreeExtent { offset: 0, size: 200 }]);
        assert_eq!(index.allocate(150, 1000), Some(0));

        // Freeing the last allocation returns the tail to the bump allocator
        index.release(c, 100);
        assert_eq!(index.next_offset, 150);
        assert!(index.free.is_empty());
    }
}
