//! Integration tests: proxies over real driver threads.
//!
//! Devices are in-memory. Tests that depend on what a driver is doing at a
//! given moment use a [`GatedDevice`], whose every transfer waits for a
//! permit, so the test decides when each request may finish.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use diskline::{
    BlockDevice, Config, ConfigBuilder, DriverSet, FullPolicy, IoRequest, IoStatus, MemDevice,
    Priority, Proxy, StripedMapper, SubmitError, SubmitStatus, ThreadContext,
};

const STRIPE: u64 = 4096;

// ── Helpers ─────────────────────────────────────────────────────────

/// A memory device whose transfers each wait for one permit and are logged
/// in execution order by offset.
struct GatedDevice {
    inner: MemDevice,
    permits: Receiver<()>,
    log: Mutex<Vec<u64>>,
}

impl GatedDevice {
    fn new(capacity: usize) -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let dev = Arc::new(GatedDevice {
            inner: MemDevice::new(capacity),
            permits: rx,
            log: Mutex::new(Vec::new()),
        });
        (dev, tx)
    }

    fn gate(&self, offset: u64) -> io::Result<()> {
        self.permits
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?;
        self.log.lock().push(offset);
        Ok(())
    }
}

impl BlockDevice for GatedDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.gate(offset)?;
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.gate(offset)?;
        self.inner.write_at(buf, offset)
    }

    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }
}

fn mem_devices(n: usize) -> Vec<Arc<dyn BlockDevice>> {
    (0..n)
        .map(|_| Arc::new(MemDevice::new(1 << 24)) as Arc<dyn BlockDevice>)
        .collect()
}

fn proxy_over(devices: Vec<Arc<dyn BlockDevice>>, config: &Config) -> (Proxy, Arc<DriverSet>) {
    let n = devices.len();
    let drivers = DriverSet::spawn(devices, config).unwrap();
    let mapper = Arc::new(StripedMapper::new(n, STRIPE));
    let proxy = Proxy::new(Arc::clone(&drivers), mapper, ThreadContext::new(0), config).unwrap();
    (proxy, drivers)
}

/// Callback that records the ids of completed requests and each batch size.
#[derive(Clone, Default)]
struct Recorder {
    ids: Arc<Mutex<Vec<u64>>>,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl Recorder {
    fn install(&self, proxy: &mut Proxy) {
        let rec = self.clone();
        proxy.set_callback(move |done: &mut [IoRequest]| {
            rec.batches.lock().push(done.len());
            rec.ids.lock().extend(done.iter().map(|r| r.id()));
        });
    }

    fn total(&self) -> usize {
        self.ids.lock().len()
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[test]
fn hundred_requests_over_two_devices() {
    let (mut proxy, drivers) = proxy_over(mem_devices(2), &Config::default());
    let rec = Recorder::default();
    rec.install(&mut proxy);

    proxy.access(
        (0..100u64).map(|i| IoRequest::read(i, i * STRIPE, STRIPE as usize)),
        None,
    );
    assert_eq!(proxy.device_pending(0), 50);
    assert_eq!(proxy.device_pending(1), 50);

    assert_eq!(proxy.wait4complete(100), 100);
    assert_eq!(rec.total(), 100);
    assert_eq!(proxy.num_pending_ios(), 0);

    let stats = proxy.stats();
    assert_eq!(stats.issued, 100);
    assert_eq!(stats.completed, 100);
    proxy.print_stat();

    assert_eq!(drivers.stats(0).requests, 50);
    assert_eq!(drivers.stats(1).requests, 50);
}

#[test]
fn threshold_triggers_single_batch() {
    let (mut proxy, drivers) = proxy_over(mem_devices(2), &Config::default());

    // Odd stripes all live on device 1.
    proxy.access(
        (0..32u64).map(|k| IoRequest::read(k, (2 * k + 1) * STRIPE, 512)),
        None,
    );
    assert_eq!(proxy.buffered(1, Priority::High), 0);

    wait_until("device 1 to service the batch", || {
        drivers.stats(1).requests == 32
    });
    let stats = drivers.stats(1);
    assert_eq!(stats.high_batches, 1);
    assert_eq!(stats.low_batches, 0);
    assert_eq!(drivers.stats(0).requests, 0);

    assert_eq!(proxy.wait4complete(32), 32);
}

#[test]
fn mapping_failure_never_completes() {
    let config = Config::default();
    let drivers = DriverSet::spawn(mem_devices(2), &config).unwrap();
    let mapper = Arc::new(StripedMapper::new(2, STRIPE).with_capacity(STRIPE * 16));
    let mut proxy = Proxy::new(drivers, mapper, ThreadContext::new(0), &config).unwrap();
    let rec = Recorder::default();
    rec.install(&mut proxy);

    let mut status = [SubmitStatus::default(); 3];
    proxy.access(
        [
            IoRequest::read(1, 0, 512),
            IoRequest::read(2, STRIPE * 16, 512),
            IoRequest::read(3, STRIPE, 512),
        ],
        Some(&mut status),
    );
    assert!(status[0].is_accepted());
    assert!(matches!(
        status[1],
        SubmitStatus::Rejected(SubmitError::Mapping(_))
    ));
    assert!(status[2].is_accepted());

    proxy.cleanup();
    let mut ids = rec.ids.lock().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn notify_wakes_blocked_waiter() {
    let (dev, permits) = GatedDevice::new(1 << 20);
    let (mut proxy, _drivers) = proxy_over(vec![dev as Arc<dyn BlockDevice>], &Config::default());

    let (observed_tx, observed_rx) = crossbeam_channel::bounded::<usize>(4);
    let batches = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&batches);
    proxy.set_callback(move |done: &mut [IoRequest]| {
        seen.lock().push(done.len());
        let _ = observed_tx.try_send(done.len());
    });

    // Two batches of 3 and 2.
    proxy.access((0..3u64).map(|i| IoRequest::read(i, i * STRIPE, 512)), None);
    proxy.flush_requests();
    proxy.access((3..5u64).map(|i| IoRequest::read(i, i * STRIPE, 512)), None);
    proxy.flush_requests();

    for _ in 0..3 {
        permits.send(()).unwrap();
    }
    // Released only after the owner has seen the first three.
    let releaser = thread::spawn(move || {
        assert_eq!(observed_rx.recv().unwrap(), 3);
        thread::sleep(Duration::from_millis(20));
        permits.send(()).unwrap();
        permits.send(()).unwrap();
    });

    assert_eq!(proxy.wait4complete(5), 5);
    releaser.join().unwrap();
    assert_eq!(*batches.lock(), vec![3, 2]);
    assert_eq!(proxy.num_pending_ios(), 0);
}

#[test]
fn low_priority_not_starved() {
    const BURST: usize = 2;
    let (dev, permits) = GatedDevice::new(1 << 22);
    let config = ConfigBuilder::new()
        .flush_threshold(1)
        .sender_capacity(4)
        .high_prio_burst(BURST)
        .build()
        .unwrap();
    let (mut proxy, drivers) =
        proxy_over(vec![Arc::clone(&dev) as Arc<dyn BlockDevice>], &config);

    // Every request is its own batch. The driver blocks on the first one
    // while the rest queue up behind it.
    for i in 0..7u64 {
        proxy.access([IoRequest::read(i, i * STRIPE, 512)], None);
    }
    let low_offset = 100 * STRIPE;
    proxy.access(
        [IoRequest::read(100, low_offset, 512).with_priority(Priority::Low)],
        None,
    );
    assert_eq!(drivers.queued_batches(0, Priority::Low), 1);

    for _ in 0..8 {
        permits.send(()).unwrap();
    }
    assert_eq!(proxy.wait4complete(8), 8);

    let order = dev.log.lock().clone();
    let pos = order.iter().position(|&off| off == low_offset).unwrap();
    assert!(pos <= BURST, "low batch ran at position {pos}: {order:?}");
    assert_eq!(drivers.stats(0).low_batches, 1);
    assert_eq!(drivers.stats(0).high_batches, 7);
}

#[test]
fn clones_have_independent_completion_streams() {
    let (mut proxy, drivers) = proxy_over(mem_devices(2), &Config::default());
    let rec = Recorder::default();
    rec.install(&mut proxy);

    let mut other = proxy.clone_for(ThreadContext::new(1).with_name("second"));
    assert!(
        !proxy
            .completion_notifier()
            .same_target(&other.completion_notifier())
    );

    let other_rec = Recorder::default();
    let handle = {
        let other_rec = other_rec.clone();
        thread::spawn(move || {
            other_rec.install(&mut other);
            other.access(
                (1000..1050u64).map(|i| IoRequest::read(i, i * STRIPE, 512)),
                None,
            );
            other.cleanup();
            other.stats()
        })
    };

    proxy.access((0..50u64).map(|i| IoRequest::read(i, i * STRIPE, 512)), None);
    proxy.cleanup();
    let other_stats = handle.join().unwrap();

    assert_eq!(rec.total(), 50);
    assert!(rec.ids.lock().iter().all(|&id| id < 1000));
    assert_eq!(other_rec.total(), 50);
    assert!(other_rec.ids.lock().iter().all(|&id| id >= 1000));
    assert_eq!(other_stats.completed, 50);
    assert_eq!(other_stats.thread.name(), Some("second"));

    assert_eq!(drivers.stats(0).requests + drivers.stats(1).requests, 100);
    assert_eq!(drivers.stats(0).requests, 50);
}

// ── Backpressure and failure paths ──────────────────────────────────

#[test]
fn full_sender_and_driver_queue_rejects() {
    let (dev, permits) = GatedDevice::new(1 << 20);
    let config = ConfigBuilder::new()
        .flush_threshold(1)
        .sender_capacity(1)
        .inbound_depth(1)
        .flush_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let (mut proxy, drivers) = proxy_over(vec![dev as Arc<dyn BlockDevice>], &config);
    let rec = Recorder::default();
    rec.install(&mut proxy);

    let mut status = [SubmitStatus::default(); 1];
    proxy.access([IoRequest::read(0, 0, 512)], Some(&mut status));
    assert!(status[0].is_accepted());
    // The driver picks up request 0 and blocks on it.
    wait_until("driver to take the first batch", || {
        drivers.queued_batches(0, Priority::High) == 0
    });

    let mut status = [SubmitStatus::default(); 3];
    proxy.access(
        [
            IoRequest::read(1, 0, 512), // fills the driver queue
            IoRequest::read(2, 0, 512), // stays in the sender
            IoRequest::read(3, 0, 512), // nowhere to go
        ],
        Some(&mut status),
    );
    assert!(status[0].is_accepted());
    assert!(status[1].is_accepted());
    assert_eq!(status[2], SubmitStatus::Rejected(SubmitError::Rejected));
    assert_eq!(proxy.num_pending_ios(), 3);
    assert_eq!(proxy.buffered(0, Priority::High), 1);

    for _ in 0..3 {
        permits.send(()).unwrap();
    }
    proxy.cleanup();
    let mut ids = rec.ids.lock().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(proxy.stats().rejected, 1);
}

#[test]
fn device_failure_arrives_as_completion() {
    let devices: Vec<Arc<dyn BlockDevice>> = vec![Arc::new(MemDevice::new(STRIPE as usize))];
    let (mut proxy, _drivers) = proxy_over(devices, &Config::default());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&statuses);
    proxy.set_callback(move |done: &mut [IoRequest]| {
        seen.lock().extend(done.iter().map(|r| (r.id(), r.status())));
    });

    let mut status = [SubmitStatus::default(); 2];
    proxy.access(
        [
            IoRequest::read(1, 0, 512),
            IoRequest::read(2, STRIPE * 4, 512),
        ],
        Some(&mut status),
    );
    assert!(status.iter().all(SubmitStatus::is_accepted));
    proxy.cleanup();

    let mut statuses = statuses.lock().clone();
    statuses.sort_by_key(|(id, _)| *id);
    assert_eq!(statuses[0], (1, IoStatus::Done));
    assert!(matches!(
        statuses[1],
        (2, IoStatus::Failed(e)) if e.kind == io::ErrorKind::UnexpectedEof
    ));
}

#[test]
fn reject_policy_loses_nothing() {
    let config = ConfigBuilder::new()
        .flush_threshold(4)
        .completion_capacity(3)
        .full_policy(FullPolicy::Reject)
        .build()
        .unwrap();
    let (mut proxy, _drivers) = proxy_over(mem_devices(2), &config);
    let rec = Recorder::default();
    rec.install(&mut proxy);

    proxy.access((0..40u64).map(|i| IoRequest::read(i, i * STRIPE, 512)), None);
    proxy.cleanup();

    let ids: HashSet<u64> = rec.ids.lock().iter().copied().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(rec.total(), 40);
}

#[test]
fn drop_delivers_outstanding_requests() {
    let (mut proxy, _drivers) = proxy_over(mem_devices(2), &Config::default());
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    proxy.set_callback(move |done: &mut [IoRequest]| {
        seen.fetch_add(done.len(), Ordering::Relaxed);
    });

    proxy.access((0..10u64).map(|i| IoRequest::read(i, i * STRIPE, 512)), None);
    drop(proxy);
    assert_eq!(count.load(Ordering::Relaxed), 10);
}

#[test]
fn flush_above_threshold_bounds_buffers() {
    let config = ConfigBuilder::new()
        .flush_threshold(64)
        .sender_capacity(64)
        .build()
        .unwrap();
    let (mut proxy, _drivers) = proxy_over(mem_devices(3), &config);

    for (i, n) in [(0u64, 10), (1, 3), (2, 7)] {
        proxy.access(
            (0..n).map(|k| IoRequest::read(k, (k * 3 + i) * STRIPE, 512)),
            None,
        );
        proxy.access(
            (0..n).map(|k| {
                IoRequest::read(k, (k * 3 + i) * STRIPE, 512).with_priority(Priority::Low)
            }),
            None,
        );
    }

    proxy.flush_requests_above(5);
    for device in 0..3 {
        for priority in [Priority::High, Priority::Low] {
            assert!(proxy.buffered(device, priority) <= 5);
        }
    }
    assert_eq!(proxy.buffered(1, Priority::High), 3);
    assert_eq!(proxy.buffered(1, Priority::Low), 3);

    proxy.cleanup();
    assert_eq!(proxy.completed(), 40);
}
