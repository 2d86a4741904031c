//! Device driver threads.
//!
//! One dedicated OS thread per physical device. Each thread owns two bounded
//! inbound queues of [`Batch`]es, one per [`Priority`]. High-priority work is
//! preferred, but after `high_prio_burst` high batches in a row a waiting
//! low-priority batch is serviced, so background traffic always progresses.
//!
//! Requests in a batch are executed in order; the finished batch is pushed to
//! the originating proxy's completion queue in one call.
//!
//! The set shuts down when its last handle is dropped: the inbound queues
//! close, each driver finishes every batch already queued, and the drop joins
//! the threads.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};

use crate::completion::CompletionNotifier;
use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::{Error, QueueFull};
use crate::metrics;
use crate::request::{DeviceId, IoDir, IoRequest, Priority};

/// Backoff before a driver retries delivering to a completion queue that
/// refused it.
const COMPLETION_RETRY_BACKOFF: Duration = Duration::from_micros(100);

/// An ordered group of requests for one device, plus the route back to the
/// proxy that sent them.
pub(crate) struct Batch {
    pub requests: Vec<IoRequest>,
    pub notifier: CompletionNotifier,
}

/// Why a batch handoff did not happen. The batch is returned intact.
pub(crate) enum HandoffError {
    /// The driver's inbound queue stayed full.
    Full(Batch),
    /// The driver thread is gone.
    Gone(Batch),
}

#[derive(Default)]
struct DriverCounters {
    batches: [AtomicU64; Priority::COUNT],
    requests: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of one driver's service counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub high_batches: u64,
    pub low_batches: u64,
    pub requests: u64,
    pub failed: u64,
}

struct DriverHandle {
    inbound: [Sender<Batch>; Priority::COUNT],
    counters: Arc<DriverCounters>,
}

/// The shared set of driver threads, one per device.
///
/// Shared by every proxy through an `Arc`; read-only after spawn.
pub struct DriverSet {
    drivers: Vec<DriverHandle>,
    threads: Vec<thread::JoinHandle<()>>,
    max_pending_per_device: usize,
}

impl DriverSet {
    /// Start one driver thread per device. Device `i` is served by the
    /// thread named `diskline-driver-{i}`.
    pub fn spawn(devices: Vec<Arc<dyn BlockDevice>>, config: &Config) -> Result<Arc<Self>, Error> {
        config.validate()?;
        if devices.is_empty() {
            return Err(Error::NoDevices);
        }

        let depth = config.driver.inbound_depth;
        let mut drivers = Vec::with_capacity(devices.len());
        let mut threads = Vec::with_capacity(devices.len());

        for (id, device) in devices.into_iter().enumerate() {
            let (high_tx, high_rx) = crossbeam_channel::bounded(depth);
            let (low_tx, low_rx) = crossbeam_channel::bounded(depth);
            let counters = Arc::new(DriverCounters::default());

            let driver = Driver {
                id,
                device,
                high: high_rx,
                low: low_rx,
                burst: config.driver.high_prio_burst,
                high_streak: 0,
                counters: Arc::clone(&counters),
            };
            let pin = config
                .driver
                .pin_to_core
                .then(|| config.driver.core_offset + id);

            let handle = thread::Builder::new()
                .name(format!("diskline-driver-{id}"))
                .spawn(move || {
                    if let Some(core) = pin
                        && let Err(e) = pin_to_core(core)
                    {
                        log::warn!("driver {id}: failed to pin to core {core}: {e}");
                    }
                    driver.run();
                })
                .map_err(Error::Io)?;

            drivers.push(DriverHandle {
                inbound: [high_tx, low_tx],
                counters,
            });
            threads.push(handle);
        }

        log::debug!("spawned {} driver threads", drivers.len());
        Ok(Arc::new(DriverSet {
            drivers,
            threads,
            max_pending_per_device: config.driver.max_pending_per_device,
        }))
    }

    pub fn num_devices(&self) -> usize {
        self.drivers.len()
    }

    /// Outstanding requests each device is expected to absorb.
    pub fn max_pending_per_device(&self) -> usize {
        self.max_pending_per_device
    }

    /// Batches waiting in a driver's inbound queue.
    pub fn queued_batches(&self, device: DeviceId, priority: Priority) -> usize {
        self.drivers[device].inbound[priority.as_index()].len()
    }

    /// Service counters for one driver.
    pub fn stats(&self, device: DeviceId) -> DriverStats {
        let c = &self.drivers[device].counters;
        DriverStats {
            high_batches: c.batches[Priority::High.as_index()].load(Ordering::Relaxed),
            low_batches: c.batches[Priority::Low.as_index()].load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Hand a batch to a driver's inbound queue.
    ///
    /// `wait` of `None` blocks until the queue has room; `Some(d)` gives up
    /// after `d` (immediately for a zero duration).
    pub(crate) fn submit(
        &self,
        device: DeviceId,
        priority: Priority,
        batch: Batch,
        wait: Option<Duration>,
    ) -> Result<(), HandoffError> {
        let tx = &self.drivers[device].inbound[priority.as_index()];
        match wait {
            None => tx.send(batch).map_err(|e| HandoffError::Gone(e.into_inner())),
            Some(d) if d.is_zero() => tx.try_send(batch).map_err(|e| match e {
                TrySendError::Full(b) => HandoffError::Full(b),
                TrySendError::Disconnected(b) => HandoffError::Gone(b),
            }),
            Some(d) => tx.send_timeout(batch, d).map_err(|e| match e {
                SendTimeoutError::Timeout(b) => HandoffError::Full(b),
                SendTimeoutError::Disconnected(b) => HandoffError::Gone(b),
            }),
        }
    }
}

impl Drop for DriverSet {
    fn drop(&mut self) {
        // Closing the inbound queues lets each driver drain and exit.
        self.drivers.clear();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("driver").to_string();
            if handle.join().is_err() {
                log::error!("{name} panicked");
            }
        }
    }
}

impl std::fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSet")
            .field("devices", &self.drivers.len())
            .field("max_pending_per_device", &self.max_pending_per_device)
            .finish()
    }
}

/// Result of a non-blocking look at both inbound queues.
enum Pick {
    Ready(Batch, Priority),
    Empty,
    Closed,
}

struct Driver {
    id: DeviceId,
    device: Arc<dyn BlockDevice>,
    high: Receiver<Batch>,
    low: Receiver<Batch>,
    burst: usize,
    high_streak: usize,
    counters: Arc<DriverCounters>,
}

impl Driver {
    fn run(mut self) {
        log::debug!("driver {} started", self.id);
        loop {
            let (batch, priority) = match self.pick() {
                Pick::Ready(batch, priority) => (batch, priority),
                Pick::Empty => match self.wait() {
                    Some(next) => next,
                    None => continue,
                },
                Pick::Closed => break,
            };

            match priority {
                Priority::High => {
                    self.high_streak += 1;
                    metrics::DRIVER_BATCHES_HIGH.increment();
                }
                Priority::Low => {
                    self.high_streak = 0;
                    metrics::DRIVER_BATCHES_LOW.increment();
                }
            }
            self.counters.batches[priority.as_index()].fetch_add(1, Ordering::Relaxed);
            self.service(batch);
        }
        log::debug!("driver {} stopped", self.id);
    }

    /// Take the next batch without blocking. Low goes first once the
    /// high-priority streak reaches the burst limit.
    fn pick(&self) -> Pick {
        let order = if self.high_streak >= self.burst {
            [Priority::Low, Priority::High]
        } else {
            [Priority::High, Priority::Low]
        };

        let mut closed = 0;
        for priority in order {
            match self.inbound(priority).try_recv() {
                Ok(batch) => return Pick::Ready(batch, priority),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => closed += 1,
            }
        }
        if closed == order.len() {
            Pick::Closed
        } else {
            Pick::Empty
        }
    }

    /// Park until either queue yields a batch. `None` means a queue closed;
    /// the caller re-checks both.
    fn wait(&self) -> Option<(Batch, Priority)> {
        crossbeam_channel::select! {
            recv(self.high) -> msg => msg.ok().map(|b| (b, Priority::High)),
            recv(self.low) -> msg => msg.ok().map(|b| (b, Priority::Low)),
        }
    }

    fn inbound(&self, priority: Priority) -> &Receiver<Batch> {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    fn service(&self, batch: Batch) {
        let Batch {
            mut requests,
            notifier,
        } = batch;

        for req in &mut requests {
            let offset = req.physical_offset();
            let result = match req.dir() {
                IoDir::Read => self.device.read_at(req.buf_mut(), offset),
                IoDir::Write => self.device.write_at(req.buf(), offset),
            };
            if let Err(ref e) = result {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "driver {}: {:?} of {} bytes at {} failed: {}",
                    self.id,
                    req.dir(),
                    req.len(),
                    offset,
                    e
                );
            }
            req.complete(result);
        }
        self.counters
            .requests
            .fetch_add(requests.len() as u64, Ordering::Relaxed);

        deliver(self.id, &notifier, requests);
    }
}

/// Push completions until the queue takes all of them. Completions are
/// never dropped; a queue in reject mode is retried after a short backoff.
fn deliver(id: DeviceId, notifier: &CompletionNotifier, mut completed: Vec<IoRequest>) {
    loop {
        match notifier.notify_completion(completed) {
            Ok(()) => return,
            Err(QueueFull(rest)) => {
                metrics::COMPLETION_RETRIES.increment();
                log::debug!(
                    "driver {id}: completion queue full, {} completions waiting",
                    rest.len()
                );
                completed = rest;
                thread::sleep(COMPLETION_RETRY_BACKOFF);
            }
        }
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
