use std::io;

use thiserror::Error;

use crate::mapper::MapError;

/// Errors returned while setting up devices, drivers, and proxies.
#[derive(Debug, Error)]
pub enum Error {
    /// Device open or driver thread spawn failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// A driver set needs at least one device.
    #[error("no devices")]
    NoDevices,
    /// The mapper routes to a different number of devices than there are drivers.
    #[error("mapper addresses {mapper} devices but {drivers} drivers are running")]
    DeviceCountMismatch { mapper: usize, drivers: usize },
}

/// Why a request was not accepted by [`Proxy::access`](crate::Proxy::access).
///
/// Submission failures are reported synchronously and never reach the
/// completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The sender is full and the driver's inbound queue did not accept a flush.
    #[error("submission rejected: sender and driver queue full")]
    Rejected,
    /// The mapper could not resolve the logical address.
    #[error("mapping failed: {0}")]
    Mapping(#[from] MapError),
    /// `cleanup()` has started on this proxy.
    #[error("proxy is shutting down")]
    ShutdownInProgress,
}

/// A device-side failure carried by a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device error: {kind}")]
pub struct DeviceError {
    pub kind: io::ErrorKind,
    pub raw_os_error: Option<i32>,
}

impl From<&io::Error> for DeviceError {
    fn from(err: &io::Error) -> Self {
        DeviceError {
            kind: err.kind(),
            raw_os_error: err.raw_os_error(),
        }
    }
}

impl From<io::ErrorKind> for DeviceError {
    fn from(kind: io::ErrorKind) -> Self {
        DeviceError {
            kind,
            raw_os_error: None,
        }
    }
}

/// Returned by a completion queue in [`FullPolicy::Reject`](crate::FullPolicy::Reject)
/// mode. Holds the completions that did not fit.
#[derive(Debug, Error)]
#[error("completion queue full ({} completions not delivered)", .0.len())]
pub struct QueueFull(pub Vec<crate::request::IoRequest>);
