//! Raw device access
//!
//! Opens data/metadata/journal devices with `O_DIRECT` (falling back to
//! buffered I/O where the filesystem refuses it), takes the advisory
//! exclusive lock, and probes size and sector geometry for both regular
//! files and block devices.

use crate::error::{EngineError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::warn;

/// Memory alignment used for direct-I/O buffers.
pub const MEM_ALIGNMENT: usize = 512;

/// Sector size assumed for regular files (stat'ing a file reports the
/// filesystem preferred block size, which is irrelevant for our layout).
const FILE_SECTOR: u32 = 512;

/// One open device (or file region host).
pub struct Device {
    file: File,
    path: String,
    /// Total device/file size in bytes
    pub size: u64,
    /// Logical sector size
    pub sector: u32,
    /// Whether the handle is in O_DIRECT mode
    pub direct: bool,
}

impl Device {
    /// Open a device read-write, optionally taking `flock(LOCK_EX|LOCK_NB)`.
    pub fn open(path: &Path, readonly: bool, lock: bool) -> Result<Self> {
        let path_str = path.display().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true);
        }

        let mut direct_options = options.clone();
        direct_options.custom_flags(libc::O_DIRECT);

        let (file, direct) = match direct_options.open(path) {
            Ok(f) => (f, true),
            Err(direct_err) => {
                let f = options.open(path).map_err(|e| EngineError::Device {
                    path: path_str.clone(),
                    msg: e.to_string(),
                })?;
                warn!(
                    path = %path_str,
                    "O_DIRECT unavailable ({direct_err}), using buffered I/O"
                );
                (f, false)
            }
        };

        if lock {
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(EngineError::DeviceLock {
                    path: path_str,
                    msg: std::io::Error::last_os_error().to_string(),
                });
            }
        }

        let (size, sector) = probe_size(&file, &path_str)?;
        Ok(Self {
            file,
            path: path_str,
            size,
            sector,
            direct,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read `len` bytes at `offset`. Offset and length must respect the
    /// device sector alignment when the handle is in direct mode.
    pub fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        if self.direct {
            let mut buf = AlignedBuf::zeroed(len);
            self.file.read_exact_at(buf.as_mut_slice(), offset)?;
            Ok(buf.into_vec())
        } else {
            let mut buf = vec![0u8; len];
            self.file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        }
    }

    /// Write `data` at `offset`, same alignment rules as [`Self::read_at`].
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        if self.direct {
            let mut buf = AlignedBuf::zeroed(data.len());
            buf.as_mut_slice().copy_from_slice(data);
            self.file.write_all_at(buf.as_slice(), offset)
        } else {
            self.file.write_all_at(data, offset)
        }
    }

    pub fn fsync(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

/// Probe size and logical sector of a file or block device.
fn probe_size(file: &File, path: &str) -> Result<(u64, u32)> {
    let meta = file.metadata().map_err(|e| EngineError::Device {
        path: path.to_string(),
        msg: format!("stat failed: {e}"),
    })?;
    let ftype = meta.file_type();
    if ftype.is_block_device() {
        // BLKGETSIZE64 / BLKSSZGET
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
        const BLKSSZGET: libc::c_ulong = 0x1268;
        let mut size: u64 = 0;
        let mut sect: libc::c_int = 0;
        let fd = file.as_raw_fd();
        let r1 = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };
        let r2 = unsafe { libc::ioctl(fd, BLKSSZGET, &mut sect) };
        if r1 == -1 || r2 == -1 {
            return Err(EngineError::Device {
                path: path.to_string(),
                msg: format!(
                    "failed to get block device geometry: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        Ok((size, sect as u32))
    } else if ftype.is_file() {
        Ok((meta.len(), FILE_SECTOR))
    } else {
        Err(EngineError::Device {
            path: path.to_string(),
            msg: "neither a regular file nor a block device".to_string(),
        })
    }
}

/// Heap buffer aligned for O_DIRECT transfers.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        let padded = len.max(MEM_ALIGNMENT).next_multiple_of(MEM_ALIGNMENT);
        let layout = std::alloc::Layout::from_size_align(padded, MEM_ALIGNMENT)
            .expect("bad aligned buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned buffer allocation failed");
        Self { ptr, len, layout }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn into_vec(self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn aligned_buf_alignment() {
        let buf = AlignedBuf::zeroed(100);
        assert_eq!(buf.as_slice().len(), 100);
        assert_eq!(buf.ptr as usize % MEM_ALIGNMENT, 0);
    }

    #[test]
    fn open_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let dev = Device::open(tmp.path(), false, false).unwrap();
        assert_eq!(dev.size, 8192);
        assert_eq!(dev.sector, 512);

        dev.write_at(0, b"stripestore").unwrap();
        let back = dev.read_at(0, 11).unwrap();
        assert_eq!(&back, b"stripestore");
    }

    #[test]
    fn exclusive_lock_conflicts() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        tmp.flush().unwrap();

        let _first = Device::open(tmp.path(), false, true).unwrap();
        let second = Device::open(tmp.path(), false, true);
        assert!(matches!(second, Err(EngineError::DeviceLock { .. })));
    }
}
