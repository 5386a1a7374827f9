//! Block-device abstraction: open with O_DIRECT (falling back to O_SYNC), probe
//! sector size, and do positioned reads/writes at sector granularity.

use crate::errors::{RemapError, Result};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: u64 = 512;

pub struct BlockDevice {
    pub path: PathBuf,
    fd: RawFd,
    pub sector_size: usize,
    pub supports_direct: bool,
    pub size_sectors: u64,
}

impl BlockDevice {
    /// Open a path as a block device, or as a plain file when it isn't one (used
    /// by tests, which back devices with tempfiles).
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut flags = libc::O_CLOEXEC;
        if read_only {
            flags |= libc::O_RDONLY;
        } else {
            flags |= libc::O_RDWR;
        }

        let mut supports_direct = true;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .custom_flags(flags | libc::O_DIRECT)
            .open(&path);

        let file = match file {
            Ok(f) => f,
            Err(_) => {
                supports_direct = false;
                OpenOptions::new()
                    .read(true)
                    .write(!read_only)
                    .custom_flags(flags)
                    .open(&path)
                    .map_err(|source| RemapError::DeviceOpen {
                        path: path.display().to_string(),
                        source,
                    })?
            }
        };

        let fd_raw = file.as_raw_fd();
        let sector_size = Self::probe_sector_size(fd_raw).unwrap_or(SECTOR_SIZE as usize);
        let size_sectors = Self::probe_size_sectors(fd_raw, &file)? / SECTOR_SIZE;

        std::mem::forget(file);

        Ok(BlockDevice {
            path,
            fd: fd_raw,
            sector_size,
            supports_direct,
            size_sectors,
        })
    }

    fn probe_sector_size(fd: RawFd) -> Option<usize> {
        const BLKSSZGET: libc::c_ulong = 0x1268;
        let mut blksz: libc::c_uint = 0;
        let ret = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut blksz) };
        if ret != 0 {
            None
        } else {
            Some(blksz as usize)
        }
    }

    fn probe_size_sectors(fd: RawFd, file: &std::fs::File) -> Result<u64> {
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size) };
        if ret == 0 && size > 0 {
            return Ok(size);
        }
        Ok(file.metadata()?.len())
    }

    /// Read exactly `buf.len()` bytes starting at byte offset `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = unsafe {
            libc::pread(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if (n as usize) != buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read from block device",
            )
            .into());
        }
        Ok(())
    }

    /// Write exactly `buf.len()` bytes starting at byte offset `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let n = unsafe {
            libc::pwrite(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if (n as usize) != buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to block device",
            )
            .into());
        }
        Ok(())
    }

    /// Flush data (not metadata) to stable storage.
    pub fn fdatasync(&self) -> Result<()> {
        let ret = unsafe { libc::fdatasync(self.fd) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(sector * SECTOR_SIZE, buf)
    }

    pub fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.write_at(sector * SECTOR_SIZE, buf)
    }

    pub fn align_up(value: usize, align: usize) -> usize {
        if align == 0 {
            value
        } else {
            ((value + align - 1) / align) * align
        }
    }

    pub fn is_aligned(addr: usize, align: usize) -> bool {
        align == 0 || addr % align == 0
    }

    /// Best-effort hardware serial lookup via sysfs, falling back to the
    /// device path when the device has no serial attribute (e.g. the
    /// tempfiles used in tests, or devices without a `device/serial` node).
    pub fn probe_model_serial(&self) -> String {
        if let Some(name) = self.path.file_name().and_then(|n| n.to_str()) {
            let candidates = [
                format!("/sys/block/{name}/device/serial"),
                format!("/sys/block/{name}/serial"),
            ];
            for candidate in candidates {
                if let Ok(serial) = std::fs::read_to_string(&candidate) {
                    let trimmed = serial.trim();
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }
        self.path.display().to_string()
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_backing_file(sectors: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
            .unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn open_plain_file_falls_back_without_direct() {
        let f = make_backing_file(64);
        let dev = BlockDevice::open(f.path(), false).unwrap();
        assert_eq!(dev.size_sectors, 64);
    }

    #[test]
    fn write_then_read_round_trips() {
        let f = make_backing_file(64);
        let dev = BlockDevice::open(f.path(), false).unwrap();
        let payload = vec![0xABu8; SECTOR_SIZE as usize];
        dev.write_sector(10, &payload).unwrap();
        dev.fdatasync().unwrap();
        let mut out = vec![0u8; SECTOR_SIZE as usize];
        dev.read_sector(10, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(BlockDevice::align_up(10, 8), 16);
        assert!(BlockDevice::is_aligned(16, 8));
        assert!(!BlockDevice::is_aligned(10, 8));
    }

    #[test]
    fn probe_model_serial_falls_back_to_path() {
        let f = make_backing_file(8);
        let dev = BlockDevice::open(f.path(), false).unwrap();
        // tempfiles have no /sys/block serial node, so the fallback is the path.
        assert_eq!(dev.probe_model_serial(), dev.path.display().to_string());
    }
}
