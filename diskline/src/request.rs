//! Block I/O request type and its status.

use bytes::BytesMut;

use crate::error::{DeviceError, SubmitError};

/// Index of a physical device (and of the driver thread serving it).
pub type DeviceId = usize;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// Priority class. Each device has one sender and one driver inbound queue
/// per class, so background traffic never sits in front of foreground traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    High,
    Low,
}

impl Priority {
    /// Number of priority classes.
    pub const COUNT: usize = 2;

    /// Returns the index for per-priority arrays.
    #[inline]
    pub fn as_index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Low => 1,
        }
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    /// Not yet executed by a driver.
    #[default]
    Pending,
    /// The device transfer succeeded.
    Done,
    /// The device (or the handoff to it) failed.
    Failed(DeviceError),
}

/// Synchronous outcome of submitting one request via `access()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitStatus {
    /// The proxy took ownership of the request; it will complete exactly once.
    #[default]
    Accepted,
    /// The request was not submitted and will never be completed.
    Rejected(SubmitError),
}

impl SubmitStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitStatus::Accepted)
    }
}

/// A block-level I/O request.
///
/// `buf` holds the bytes to write, or receives the bytes read. Its length is
/// the transfer size. After routing, a request also knows which device and
/// physical offset it was sent to.
#[derive(Debug, Clone)]
pub struct IoRequest {
    id: u64,
    offset: u64,
    dir: IoDir,
    priority: Priority,
    buf: BytesMut,
    pub(crate) device: Option<DeviceId>,
    pub(crate) phys_offset: u64,
    pub(crate) status: IoStatus,
}

impl IoRequest {
    /// A read of `len` bytes at logical `offset`.
    pub fn read(id: u64, offset: u64, len: usize) -> Self {
        Self::new(id, offset, IoDir::Read, BytesMut::zeroed(len))
    }

    /// A write of `data` at logical `offset`.
    pub fn write(id: u64, offset: u64, data: &[u8]) -> Self {
        Self::new(id, offset, IoDir::Write, BytesMut::from(data))
    }

    /// A request over a caller-provided buffer.
    pub fn new(id: u64, offset: u64, dir: IoDir, buf: BytesMut) -> Self {
        IoRequest {
            id,
            offset,
            dir,
            priority: Priority::High,
            buf,
            device: None,
            phys_offset: 0,
            status: IoStatus::Pending,
        }
    }

    /// Set the priority class.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn dir(&self) -> IoDir {
        self.dir
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> IoStatus {
        self.status
    }

    /// Device the request was routed to, once accepted.
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Offset on [`device()`](Self::device), once accepted.
    pub fn physical_offset(&self) -> u64 {
        self.phys_offset
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Take the data buffer, leaving the request empty.
    pub fn take_buf(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }

    /// Split off the first `len` bytes as a separate request with the same id,
    /// direction, and priority. `self` keeps the remainder and advances its offset.
    pub(crate) fn split_to(&mut self, len: usize) -> IoRequest {
        let head = IoRequest {
            id: self.id,
            offset: self.offset,
            dir: self.dir,
            priority: self.priority,
            buf: self.buf.split_to(len),
            device: None,
            phys_offset: 0,
            status: IoStatus::Pending,
        };
        self.offset += len as u64;
        head
    }

    pub(crate) fn route(&mut self, device: DeviceId, phys_offset: u64) {
        self.device = Some(device);
        self.phys_offset = phys_offset;
    }

    pub(crate) fn complete(&mut self, result: std::io::Result<()>) {
        self.status = match result {
            Ok(()) => IoStatus::Done,
            Err(ref e) => IoStatus::Failed(DeviceError::from(e)),
        };
    }

    pub(crate) fn fail(&mut self, err: DeviceError) {
        self.status = IoStatus::Failed(err);
    }
}
