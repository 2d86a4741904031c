//! Physical devices behind the driver threads.
//!
//! A driver thread owns exactly one [`BlockDevice`] and performs every
//! transfer routed to it. [`FileDevice`] does positional I/O on a regular
//! file or a block device node; [`MemDevice`] keeps the bytes in memory.
//!
//! # Direct I/O alignment
//!
//! A [`FileDevice`] opened with [`FileDevice::open_direct`] uses `O_DIRECT`,
//! which requires buffer addresses, transfer sizes, and offsets to be
//! multiples of the logical block size (typically 512 or 4096 bytes).
//! Violating them surfaces as an `EINVAL` device error on the request.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use parking_lot::RwLock;

/// Synchronous positional block I/O.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` from the device starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` to the device starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Device size in bytes.
    fn capacity(&self) -> u64;
}

/// A file or block device node accessed with `pread`/`pwrite`.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    capacity: u64,
}

impl FileDevice {
    /// Open an existing file or device read-write through the page cache.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    /// Open an existing file or device read-write with `O_DIRECT`.
    pub fn open_direct(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already-open file. The capacity is its current end offset,
    /// which also works for block device nodes where `metadata().len()` is 0.
    pub fn from_file(mut file: File) -> io::Result<Self> {
        let capacity = file.seek(SeekFrom::End(0))?;
        Ok(FileDevice { file, capacity })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A fixed-size device backed by memory. Starts zero-filled.
#[derive(Debug)]
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
}

impl MemDevice {
    pub fn new(capacity: usize) -> Self {
        MemDevice {
            data: RwLock::new(vec![0u8; capacity]),
        }
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let cap = self.data.read().len();
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        match start.checked_add(len) {
            Some(end) if end <= cap => Ok(start..end),
            _ => Err(out_of_range()),
        }
    }
}

fn out_of_range() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "access beyond end of device")
}

impl BlockDevice for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data.read()[range]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data.write()[range].copy_from_slice(buf);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.data.read().len() as u64
    }
}
