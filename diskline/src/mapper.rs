//! Logical-to-physical address translation.
//!
//! A [`FileMapper`] turns a logical byte range into one or more
//! [`Extent`]s, each naming a device and an offset on it. Mapping must be
//! deterministic: the same range always routes to the same devices, so a
//! caller that resubmits a rejected request hits the same driver.

use thiserror::Error;

use crate::request::DeviceId;

/// A contiguous physical range on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub device: DeviceId,
    pub offset: u64,
    pub len: usize,
}

/// Why a logical range could not be mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// The range extends past the end of the logical address space.
    #[error("range {offset}+{len} is beyond capacity {capacity}")]
    OutOfRange {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    /// Zero-length requests address nothing.
    #[error("empty range")]
    Empty,
    /// The mapper produced extents that do not cover the range exactly or
    /// name a device it does not have.
    #[error("mapper produced invalid extents")]
    InvalidExtents,
}

/// Resolves logical addresses to device locations.
pub trait FileMapper: Send + Sync {
    /// Number of devices the mapper routes to. Sizes the proxy's sender array
    /// and its backpressure limit.
    fn num_devices(&self) -> usize;

    /// Append the extents covering `[offset, offset + len)` to `out`, in
    /// logical order. On error nothing is appended.
    fn map(&self, offset: u64, len: usize, out: &mut Vec<Extent>) -> Result<(), MapError>;
}

/// RAID-0 striping across `n` devices.
///
/// Stripe `s` covers logical bytes `[s * stripe_size, (s + 1) * stripe_size)`
/// and lives on device `s % n` at physical offset
/// `(s / n) * stripe_size`. Ranges that cross a stripe boundary map to
/// several extents.
#[derive(Debug, Clone)]
pub struct StripedMapper {
    num_devices: usize,
    stripe_size: u64,
    capacity: Option<u64>,
}

impl StripedMapper {
    /// # Panics
    ///
    /// Panics if `num_devices` or `stripe_size` is zero.
    pub fn new(num_devices: usize, stripe_size: u64) -> Self {
        assert!(num_devices > 0, "num_devices must be > 0");
        assert!(stripe_size > 0, "stripe_size must be > 0");
        StripedMapper {
            num_devices,
            stripe_size,
            capacity: None,
        }
    }

    /// Bound the logical address space. Ranges past `capacity` fail to map.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    /// Device holding logical `offset`.
    pub fn device_of(&self, offset: u64) -> DeviceId {
        ((offset / self.stripe_size) % self.num_devices as u64) as DeviceId
    }
}

impl FileMapper for StripedMapper {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn map(&self, offset: u64, len: usize, out: &mut Vec<Extent>) -> Result<(), MapError> {
        if len == 0 {
            return Err(MapError::Empty);
        }
        let capacity = self.capacity.unwrap_or(u64::MAX);
        let end = match offset.checked_add(len as u64) {
            Some(end) if end <= capacity => end,
            _ => {
                return Err(MapError::OutOfRange {
                    offset,
                    len,
                    capacity,
                });
            }
        };

        // pos < end <= u64::MAX throughout, so the additions below cannot wrap.
        let n = self.num_devices as u64;
        let mut pos = offset;
        while pos < end {
            let stripe = pos / self.stripe_size;
            let within = pos % self.stripe_size;
            let chunk = (end - pos).min(self.stripe_size - within);
            out.push(Extent {
                device: (stripe % n) as DeviceId,
                offset: (stripe / n) * self.stripe_size + within,
                len: chunk as usize,
            });
            pos += chunk;
        }
        Ok(())
    }
}
