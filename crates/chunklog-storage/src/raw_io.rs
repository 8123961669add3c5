//! Uncached file access for log files and raw partitions
//!
//! Log files opened for direct access skip the page cache (O_DIRECT on
//! Linux, F_NOCACHE on macOS).
//!
//! Direct I/O requires offsets, lengths and buffers aligned to [`ALIGNMENT`].

use chunklog_common::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;
use tracing::warn;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

/// Round `value` down to a multiple of [`ALIGNMENT`]
#[must_use]
pub const fn align_down(value: u64) -> u64 {
    value & !(ALIGNMENT as u64 - 1)
}

/// Round `value` up to a multiple of [`ALIGNMENT`]
#[must_use]
pub const fn align_up(value: u64) -> u64 {
    align_down(value + ALIGNMENT as u64 - 1)
}

/// Open a file for direct I/O.
///
/// Filesystems without direct I/O support (tmpfs for one) reject O_DIRECT
/// with EINVAL; the file is then opened through the page cache instead.
pub fn open_direct(path: &Path, create: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if create {
        options.create(true).truncate(true);
    }

    #[cfg(target_os = "linux")]
    {
        let mut direct = options.clone();
        direct.custom_flags(libc::O_DIRECT);
        match direct.open(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!("{} does not support O_DIRECT, using buffered I/O", path.display());
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to open {}: {}",
                    path.display(),
                    e
                )));
            }
        }
    }

    let file = options
        .open(path)
        .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;

    #[cfg(target_os = "macos")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret == -1 {
            warn!(
                "failed to set F_NOCACHE on {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        }
    }

    Ok(file)
}

/// Reserve `size` bytes for a freshly created file
pub fn preallocate(file: &File, path: &Path, size: u64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let len = libc::off_t::try_from(size)
            .map_err(|_| Error::Storage(format!("size {size} too large for {}", path.display())))?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
        if ret == 0 {
            return Ok(());
        }
        // Not supported by the filesystem, fall through to a sparse file
    }

    file.set_len(size)
        .map_err(|e| Error::Storage(format!("failed to set size for {}: {}", path.display(), e)))
}

/// Check if path is a block device
#[must_use]
pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Get block device size using ioctl
#[cfg(target_os = "linux")]
pub fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 ioctl
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes one u64 into `size`
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret == -1 {
        return Err(Error::Storage(format!(
            "failed to get block device size for {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(size)
}

/// Get block device size (non-Linux fallback)
#[cfg(not(target_os = "linux"))]
pub fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::End(0))
        .map_err(|e| Error::Storage(format!("failed to get device size for {}: {}", path.display(), e)))
}

/// Zeroed buffer aligned for direct I/O
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a buffer of at least `size` bytes, rounded up to [`ALIGNMENT`]
    pub fn new(size: usize) -> Result<Self> {
        let aligned_size = (size.max(1)).div_ceil(ALIGNMENT) * ALIGNMENT;
        let layout = Layout::from_size_align(aligned_size, ALIGNMENT)
            .map_err(|e| Error::internal(format!("invalid layout for aligned buffer: {e}")))?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::internal(format!("failed to allocate {aligned_size} byte aligned buffer"))
        })?;
        Ok(Self { ptr, layout })
    }

    /// Buffer size
    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Never true, buffers hold at least one aligned block
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.len(), ALIGNMENT);
        assert_eq!(buf.as_ptr() as usize % ALIGNMENT, 0);
        assert!(buf.iter().all(|b| *b == 0));

        buf[..5].copy_from_slice(b"hello");
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(4097), 4096);
        assert_eq!(align_up(4097), 8192);
        assert_eq!(align_up(8192), 8192);
        assert_eq!(align_down(0), 0);
    }

    #[test]
    fn test_direct_file_create_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direct.log");

        let file = open_direct(&path, true).unwrap();
        preallocate(&file, &path, 8192).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);

        let mut buf = AlignedBuffer::new(ALIGNMENT).unwrap();
        buf[..17].copy_from_slice(b"test data pattern");
        file.write_all_at(&buf, 4096).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let file = open_direct(&path, false).unwrap();
        let mut read = AlignedBuffer::new(ALIGNMENT).unwrap();
        file.read_exact_at(&mut read, 4096).unwrap();
        assert!(read.starts_with(b"test data pattern"));
        assert!(!is_block_device(&path));
    }
}
