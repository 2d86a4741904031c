//! Per-proxy completion queue.
//!
//! Driver threads push finished requests; the proxy's owning thread drains
//! them. The queue is bounded and multi-producer, single-consumer. Producers
//! signal `not_empty` after every push so a consumer parked in
//! [`CompletionQueue::drain`] wakes up; the consumer signals `not_full`
//! after taking items so a producer parked on a full queue can continue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::FullPolicy;
use crate::error::QueueFull;
use crate::request::IoRequest;

pub(crate) struct CompletionQueue {
    queue: Mutex<VecDeque<IoRequest>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: FullPolicy,
}

impl CompletionQueue {
    pub fn new(capacity: usize, policy: FullPolicy) -> Self {
        CompletionQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Append a batch in order. Under [`FullPolicy::Block`] this waits for
    /// room; under [`FullPolicy::Reject`] whatever does not fit is returned.
    pub fn push(&self, batch: Vec<IoRequest>) -> Result<(), QueueFull> {
        let mut pending = batch.into_iter().peekable();
        let mut queue = self.queue.lock();
        while pending.peek().is_some() {
            let room = self.capacity.saturating_sub(queue.len());
            if room == 0 {
                // Whatever is already queued must be visible to the consumer
                // before we park or give up.
                self.not_empty.notify_one();
                match self.policy {
                    FullPolicy::Block => {
                        self.not_full.wait(&mut queue);
                        continue;
                    }
                    FullPolicy::Reject => return Err(QueueFull(pending.collect())),
                }
            }
            queue.extend(pending.by_ref().take(room));
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Move every queued completion into `out`. With `block` set, waits until
    /// at least one is available. Returns the number moved.
    pub fn drain(&self, out: &mut Vec<IoRequest>, block: bool) -> usize {
        let mut queue = self.queue.lock();
        if block {
            while queue.is_empty() {
                self.not_empty.wait(&mut queue);
            }
        }
        let n = queue.len();
        if n > 0 {
            out.extend(queue.drain(..));
            self.not_full.notify_all();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Producer handle for a proxy's completion queue.
///
/// Cheap to clone and safe to use from any number of threads at once. Driver
/// threads receive one with every batch; tests and custom drivers obtain one
/// from [`Proxy::completion_notifier`](crate::Proxy::completion_notifier).
#[derive(Clone)]
pub struct CompletionNotifier {
    queue: Arc<CompletionQueue>,
}

impl CompletionNotifier {
    pub(crate) fn new(queue: Arc<CompletionQueue>) -> Self {
        CompletionNotifier { queue }
    }

    /// Deliver completed requests to the owning proxy and wake its thread if
    /// it is blocked in `wait4complete`.
    pub fn notify_completion(&self, completed: Vec<IoRequest>) -> Result<(), QueueFull> {
        if completed.is_empty() {
            return Ok(());
        }
        self.queue.push(completed)
    }

    /// Number of completions waiting to be drained.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether both handles deliver into the same proxy.
    pub fn same_target(&self, other: &CompletionNotifier) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

impl std::fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}
