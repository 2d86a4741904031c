//! Per-thread block I/O dispatch to dedicated device threads.
//!
//! Each physical device is served by one driver thread. Worker threads never
//! talk to those threads directly: every worker owns a [`Proxy`] that maps
//! requests to devices, batches them per (device, priority), hands full
//! batches to the drivers, and collects completions in its own bounded queue.
//! Workers never contend with each other, and each device sees batched
//! handoffs instead of one cross-thread message per request.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use diskline::{
//!     BlockDevice, Config, DriverSet, FileDevice, IoRequest, Proxy, StripedMapper, ThreadContext,
//! };
//!
//! fn main() -> Result<(), diskline::Error> {
//!     let config = Config::default();
//!     let devices: Vec<Arc<dyn BlockDevice>> = vec![
//!         Arc::new(FileDevice::open("/dev/nvme0n1")?),
//!         Arc::new(FileDevice::open("/dev/nvme1n1")?),
//!     ];
//!     let drivers = DriverSet::spawn(devices, &config)?;
//!     let mapper = Arc::new(StripedMapper::new(2, 4096));
//!
//!     let mut proxy = Proxy::new(drivers, mapper, ThreadContext::new(0), &config)?;
//!     proxy.set_callback(|done: &mut [IoRequest]| {
//!         for req in done.iter() {
//!             println!("request {} finished: {:?}", req.id(), req.status());
//!         }
//!     });
//!
//!     proxy.access((0..64u64).map(|i| IoRequest::read(i, i * 4096, 4096)), None);
//!     proxy.wait4complete(64);
//!
//!     // A second worker gets its own proxy over the same drivers.
//!     let other = proxy.clone_for(ThreadContext::new(1));
//!     std::thread::spawn(move || {
//!         let mut other = other;
//!         other.access([IoRequest::write(0, 0, &[0u8; 4096])], None);
//!         other.cleanup();
//!     })
//!     .join()
//!     .unwrap();
//!
//!     proxy.cleanup();
//!     proxy.print_stat();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux. Driver threads may be pinned to cores with `sched_setaffinity`,
//! and [`FileDevice::open_direct`] uses `O_DIRECT`.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod completion;
pub(crate) mod driver;
pub(crate) mod metrics;
pub(crate) mod sender;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod device;
pub mod error;
pub mod mapper;
pub mod proxy;
pub mod request;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Producer handle for a proxy's completion queue.
pub use completion::CompletionNotifier;
/// Completion queue behavior at capacity.
pub use config::FullPolicy;
/// Runtime configuration.
pub use config::{CompletionConfig, Config, ConfigBuilder, DriverConfig, SenderConfig};
/// Device boundary and the bundled devices.
pub use device::{BlockDevice, FileDevice, MemDevice};
/// Shared driver-thread set.
pub use driver::{DriverSet, DriverStats};
/// Errors.
pub use error::{DeviceError, Error, QueueFull, SubmitError};
/// Address translation.
pub use mapper::{Extent, FileMapper, MapError, StripedMapper};
/// The per-thread proxy.
pub use proxy::{Callback, Proxy, ProxyStats, ThreadContext};
/// Requests and their outcomes.
pub use request::{DeviceId, IoDir, IoRequest, IoStatus, Priority, SubmitStatus};
