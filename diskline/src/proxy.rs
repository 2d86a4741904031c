//! The per-thread dispatch proxy.
//!
//! A [`Proxy`] belongs to exactly one worker thread. It maps each request to
//! its device(s), buffers the pieces in per-(device, priority) senders,
//! hands full senders to the driver threads as batches, and delivers
//! completions back to its owner through a bounded completion queue.
//!
//! Only the completion queue's producer side is shared: drivers push into it
//! through a [`CompletionNotifier`]. Everything else is owned by the proxy and
//! touched only by its thread. To issue I/O from another thread, give that
//! thread its own proxy via [`Proxy::clone_for`].
//!
//! # Accounting
//!
//! `issued` counts physical requests accepted by `access()`; `completed`
//! counts requests delivered to the callback. `issued - completed` is the
//! number of requests that are buffered, queued at a driver, executing, or
//! waiting in the completion queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::completion::{CompletionNotifier, CompletionQueue};
use crate::config::Config;
use crate::driver::DriverSet;
use crate::error::{DeviceError, Error, QueueFull, SubmitError};
use crate::mapper::{Extent, FileMapper, MapError};
use crate::metrics;
use crate::request::{DeviceId, IoRequest, IoStatus, Priority, SubmitStatus};
use crate::sender::{FlushOutcome, RequestSender};

/// Slice of time a forced flush waits on a full driver queue before it
/// drains its own completion queue and tries again.
const FORCED_FLUSH_SLICE: Duration = Duration::from_millis(1);

/// Receives completed requests on the proxy's owning thread.
pub trait Callback: Send {
    /// Called from `wait4complete` with each drained batch. Completion order
    /// is only meaningful within one device's batch.
    fn on_complete(&mut self, completed: &mut [IoRequest]);
}

impl<F> Callback for F
where
    F: FnMut(&mut [IoRequest]) + Send,
{
    fn on_complete(&mut self, completed: &mut [IoRequest]) {
        self(completed)
    }
}

/// Identifies the worker thread that owns a proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    id: usize,
    name: Option<String>,
}

impl ThreadContext {
    pub fn new(id: usize) -> Self {
        ThreadContext { id, name: None }
    }

    /// Context for the calling thread, named after it.
    pub fn current(id: usize) -> Self {
        ThreadContext {
            id,
            name: std::thread::current().name().map(str::to_string),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({})", name, self.id),
            None => write!(f, "worker-{}", self.id),
        }
    }
}

/// Point-in-time counters of one proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStats {
    pub thread: ThreadContext,
    pub issued: u64,
    pub completed: u64,
    pub rejected: u64,
    pub buffered: usize,
}

impl ProxyStats {
    pub fn pending(&self) -> u64 {
        self.issued - self.completed
    }
}

impl fmt::Display for ProxyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: issued {} completed {} pending {} buffered {} rejected {}",
            self.thread,
            self.issued,
            self.completed,
            self.pending(),
            self.buffered,
            self.rejected
        )
    }
}

/// Per-thread dispatch and completion proxy. See the [module docs](self).
pub struct Proxy {
    ctx: ThreadContext,
    config: Config,
    drivers: Arc<DriverSet>,
    mapper: Arc<dyn FileMapper>,
    /// Indexed by `device * Priority::COUNT + priority`.
    senders: Vec<RequestSender>,
    queue: Arc<CompletionQueue>,
    notifier: CompletionNotifier,
    callback: Option<Box<dyn Callback>>,
    issued: AtomicU64,
    completed: AtomicU64,
    rejected: u64,
    device_pending: Vec<usize>,
    /// Completions taken off the queue (or failed locally) but not yet
    /// handed to the callback.
    ready: Vec<IoRequest>,
    extents: Vec<Extent>,
    shutting_down: bool,
}

impl Proxy {
    /// Create a proxy over a running driver set.
    ///
    /// The mapper must route to exactly as many devices as there are drivers.
    pub fn new(
        drivers: Arc<DriverSet>,
        mapper: Arc<dyn FileMapper>,
        ctx: ThreadContext,
        config: &Config,
    ) -> Result<Self, Error> {
        config.validate()?;
        if mapper.num_devices() != drivers.num_devices() {
            return Err(Error::DeviceCountMismatch {
                mapper: mapper.num_devices(),
                drivers: drivers.num_devices(),
            });
        }
        Ok(Self::build(drivers, mapper, ctx, config.clone()))
    }

    fn build(
        drivers: Arc<DriverSet>,
        mapper: Arc<dyn FileMapper>,
        ctx: ThreadContext,
        config: Config,
    ) -> Self {
        let num_devices = drivers.num_devices();
        let mut senders = Vec::with_capacity(num_devices * Priority::COUNT);
        for device in 0..num_devices {
            for priority in [Priority::High, Priority::Low] {
                debug_assert_eq!(senders.len(), device * Priority::COUNT + priority.as_index());
                senders.push(RequestSender::new(device, priority, &config.sender));
            }
        }

        let queue = Arc::new(CompletionQueue::new(
            config.completion.capacity,
            config.completion.full_policy,
        ));
        let notifier = CompletionNotifier::new(Arc::clone(&queue));
        metrics::PROXIES_ACTIVE.increment();

        Proxy {
            ctx,
            config,
            drivers,
            mapper,
            senders,
            queue,
            notifier,
            callback: None,
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            rejected: 0,
            device_pending: vec![0; num_devices],
            ready: Vec::new(),
            extents: Vec::new(),
            shutting_down: false,
        }
    }

    /// A new proxy for another thread, sharing this proxy's drivers and
    /// mapper but with its own senders, completion queue, and counters.
    /// The callback is not carried over.
    pub fn clone_for(&self, ctx: ThreadContext) -> Proxy {
        Self::build(
            Arc::clone(&self.drivers),
            Arc::clone(&self.mapper),
            ctx,
            self.config.clone(),
        )
    }

    pub fn thread_context(&self) -> &ThreadContext {
        &self.ctx
    }

    pub fn num_devices(&self) -> usize {
        self.drivers.num_devices()
    }

    /// Register the completion callback, returning the previous one.
    pub fn set_callback(&mut self, callback: impl Callback + 'static) -> Option<Box<dyn Callback>> {
        self.callback.replace(Box::new(callback))
    }

    pub fn get_callback(&mut self) -> Option<&mut (dyn Callback + 'static)> {
        self.callback.as_deref_mut()
    }

    pub fn take_callback(&mut self) -> Option<Box<dyn Callback>> {
        self.callback.take()
    }

    /// Producer handle for this proxy's completion queue, for use by
    /// drivers on other threads.
    pub fn completion_notifier(&self) -> CompletionNotifier {
        self.notifier.clone()
    }

    /// Submit requests.
    ///
    /// Each request is mapped to one or more device extents and buffered in
    /// the matching senders; a sender reaching its flush threshold is handed
    /// to its driver immediately. If `status` is given, `status[i]` receives
    /// the submission outcome of the `i`-th request. Accepted requests
    /// complete exactly once through `wait4complete`; rejected requests are
    /// dropped without reaching the completion queue.
    pub fn access<I>(&mut self, requests: I, mut status: Option<&mut [SubmitStatus]>)
    where
        I: IntoIterator<Item = IoRequest>,
    {
        for (i, req) in requests.into_iter().enumerate() {
            let id = req.id();
            let outcome = match self.submit(req) {
                Ok(()) => SubmitStatus::Accepted,
                Err(e) => {
                    self.rejected += 1;
                    metrics::REQUESTS_REJECTED.increment();
                    log::debug!("{}: request {id} not submitted: {e}", self.ctx);
                    SubmitStatus::Rejected(e)
                }
            };
            if let Some(slot) = status.as_deref_mut().and_then(|s| s.get_mut(i)) {
                *slot = outcome;
            }
        }
    }

    fn submit(&mut self, req: IoRequest) -> Result<(), SubmitError> {
        if self.shutting_down {
            return Err(SubmitError::ShutdownInProgress);
        }

        let mut extents = std::mem::take(&mut self.extents);
        extents.clear();
        let result = self.submit_extents(req, &mut extents);
        self.extents = extents;
        result
    }

    fn submit_extents(&mut self, req: IoRequest, extents: &mut Vec<Extent>) -> Result<(), SubmitError> {
        self.mapper.map(req.offset(), req.len(), extents)?;

        let num_devices = self.num_devices();
        let covered: usize = extents.iter().map(|e| e.len).sum();
        if extents.is_empty()
            || covered != req.len()
            || extents.iter().any(|e| e.len == 0 || e.device >= num_devices)
        {
            return Err(MapError::InvalidExtents.into());
        }

        // All pieces are admitted or none is. A device whose share exceeds
        // a whole sender is always admitted: `enqueue` force-flushes that
        // sender each time it fills.
        let priority = req.priority();
        for ext in extents.iter() {
            let idx = self.sender_index(ext.device, priority);
            let needed = extents.iter().filter(|e| e.device == ext.device).count();
            if needed > self.senders[idx].capacity() {
                continue;
            }
            if self.senders[idx].room() < needed {
                self.flush_sender(idx, Some(self.config.sender.flush_timeout));
                if self.senders[idx].room() < needed {
                    return Err(SubmitError::Rejected);
                }
            }
        }

        let (last, head) = extents.split_last().ok_or(MapError::InvalidExtents)?;
        let mut rest = req;
        for ext in head {
            let part = rest.split_to(ext.len);
            self.enqueue(part, ext);
        }
        self.enqueue(rest, last);
        Ok(())
    }

    fn enqueue(&mut self, mut part: IoRequest, ext: &Extent) {
        part.route(ext.device, ext.offset);
        let idx = self.sender_index(ext.device, part.priority());
        if self.senders[idx].room() == 0 {
            self.force_flush(idx);
        }
        self.senders[idx].push(part);
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.device_pending[ext.device] += 1;
        metrics::REQUESTS_ISSUED.increment();

        if self.senders[idx].should_flush() {
            // A refused auto-flush leaves the batch buffered; a later insert
            // or an explicit flush retries it.
            self.flush_sender(idx, Some(self.config.sender.flush_timeout));
        }
    }

    #[inline]
    fn sender_index(&self, device: DeviceId, priority: Priority) -> usize {
        device * Priority::COUNT + priority.as_index()
    }

    /// Try one handoff. Returns `false` only if the driver queue refused.
    fn flush_sender(&mut self, idx: usize, wait: Option<Duration>) -> bool {
        match self.senders[idx].flush(&self.drivers, &self.notifier, wait) {
            FlushOutcome::Empty => true,
            FlushOutcome::Sent(n) => {
                metrics::BATCHES_FLUSHED.increment();
                log::trace!("{}: flushed batch of {n} to sender {idx}", self.ctx);
                true
            }
            FlushOutcome::Refused => {
                metrics::BATCHES_REFUSED.increment();
                false
            }
            FlushOutcome::DriverGone(mut requests) => {
                log::error!(
                    "{}: driver for sender {idx} is gone, failing {} requests",
                    self.ctx,
                    requests.len()
                );
                let err = DeviceError::from(std::io::ErrorKind::BrokenPipe);
                for req in &mut requests {
                    req.fail(err);
                }
                self.ready.append(&mut requests);
                true
            }
        }
    }

    /// Flush a sender, waiting as long as it takes. While the driver queue
    /// is full, completions are moved off our own queue so a driver blocked
    /// delivering to us can make progress.
    fn force_flush(&mut self, idx: usize) {
        while !self.flush_sender(idx, Some(FORCED_FLUSH_SLICE)) {
            self.queue.drain(&mut self.ready, false);
        }
    }

    /// Flush every sender.
    pub fn flush_requests(&mut self) {
        for idx in 0..self.senders.len() {
            self.force_flush(idx);
        }
    }

    /// Flush only senders holding more than `max_cached` requests. Shorter
    /// buffers stay put to build larger batches.
    pub fn flush_requests_above(&mut self, max_cached: usize) {
        for idx in 0..self.senders.len() {
            if self.senders[idx].len() > max_cached {
                self.force_flush(idx);
            }
        }
    }

    /// Push completed requests into this proxy's completion queue.
    ///
    /// Driver threads use the equivalent
    /// [`CompletionNotifier::notify_completion`] from
    /// [`completion_notifier`](Self::completion_notifier).
    pub fn notify_completion(&self, completed: Vec<IoRequest>) -> Result<(), QueueFull> {
        self.notifier.notify_completion(completed)
    }

    /// Wait until at least `n` requests complete, invoking the callback for
    /// each drained batch. `n` is capped at [`num_pending_ios`](Self::num_pending_ios);
    /// `n == 0` delivers whatever is ready without blocking.
    ///
    /// Returns the number of completions delivered, which may exceed `n`.
    pub fn wait4complete(&mut self, n: usize) -> usize {
        let target = n.min(self.num_pending_ios());
        let mut done = 0;
        loop {
            if self.ready.is_empty() {
                let block = done < target;
                if block && self.senders.iter().any(|s| !s.is_empty()) {
                    // Buffered requests would never complete otherwise.
                    self.flush_requests();
                }
                if self.ready.is_empty() {
                    self.queue.drain(&mut self.ready, block);
                }
            }
            done += self.deliver();
            if done >= target {
                return done;
            }
        }
    }

    /// Hand `ready` to the callback, then advance the completed counter.
    fn deliver(&mut self) -> usize {
        let n = self.ready.len();
        if n == 0 {
            return 0;
        }

        let mut batch = std::mem::take(&mut self.ready);
        for req in &batch {
            if let Some(device) = req.device() {
                self.device_pending[device] = self.device_pending[device].saturating_sub(1);
            }
            if matches!(req.status(), IoStatus::Failed(_)) {
                metrics::REQUESTS_FAILED.increment();
            }
        }
        if let Some(callback) = self.callback.as_mut() {
            callback.on_complete(&mut batch);
        }
        self.completed.fetch_add(n as u64, Ordering::Release);
        metrics::REQUESTS_COMPLETED.add(n as u64);

        batch.clear();
        self.ready = batch;
        n
    }

    /// Requests accepted but not yet delivered to the callback.
    pub fn num_pending_ios(&self) -> usize {
        let issued = self.issued.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Acquire);
        debug_assert!(issued >= completed);
        (issued - completed) as usize
    }

    /// Backpressure limit: devices times the per-device outstanding limit.
    pub fn get_max_num_pending_ios(&self) -> usize {
        self.num_devices() * self.drivers.max_pending_per_device()
    }

    /// Whether pending requests reached [`get_max_num_pending_ios`](Self::get_max_num_pending_ios).
    pub fn is_saturated(&self) -> bool {
        self.num_pending_ios() >= self.get_max_num_pending_ios()
    }

    /// Pending requests routed to one device.
    pub fn device_pending(&self, device: DeviceId) -> usize {
        self.device_pending[device]
    }

    /// Requests sitting in the sender for `(device, priority)`.
    pub fn buffered(&self, device: DeviceId, priority: Priority) -> usize {
        self.senders[self.sender_index(device, priority)].len()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            thread: self.ctx.clone(),
            issued: self.issued(),
            completed: self.completed(),
            rejected: self.rejected,
            buffered: self.senders.iter().map(RequestSender::len).sum(),
        }
    }

    /// Log issued/completed counts at info level.
    pub fn print_stat(&self) {
        log::info!("{}", self.stats());
    }

    /// Stop accepting requests, flush every sender, and wait until every
    /// accepted request has been delivered.
    pub fn cleanup(&mut self) {
        self.shutting_down = true;
        self.flush_requests();
        while self.num_pending_ios() > 0 {
            self.wait4complete(self.num_pending_ios());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.num_pending_ios() > 0 {
            log::warn!(
                "{}: dropped with {} pending requests, cleaning up",
                self.ctx,
                self.num_pending_ios()
            );
            self.cleanup();
        }
        metrics::PROXIES_ACTIVE.decrement();
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("thread", &self.ctx)
            .field("devices", &self.num_devices())
            .field("issued", &self.issued())
            .field("completed", &self.completed())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}
