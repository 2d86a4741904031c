//! Per-(device, priority) request buffering.
//!
//! A sender collects requests for one driver queue and hands them over as a
//! single ordered [`Batch`], so the cross-thread handoff cost is paid once per
//! batch instead of once per request.

use std::time::Duration;

use crate::completion::CompletionNotifier;
use crate::config::SenderConfig;
use crate::driver::{Batch, DriverSet, HandoffError};
use crate::request::{DeviceId, IoRequest, Priority};

/// What happened to a sender's buffer on flush.
pub(crate) enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// The whole buffer went to the driver as one batch.
    Sent(usize),
    /// The driver queue stayed full; the buffer is unchanged.
    Refused,
    /// The driver thread is gone; the requests come back to the caller.
    DriverGone(Vec<IoRequest>),
}

pub(crate) struct RequestSender {
    device: DeviceId,
    priority: Priority,
    buf: Vec<IoRequest>,
    flush_threshold: usize,
    capacity: usize,
}

impl RequestSender {
    pub fn new(device: DeviceId, priority: Priority, config: &SenderConfig) -> Self {
        RequestSender {
            device,
            priority,
            buf: Vec::with_capacity(config.capacity),
            flush_threshold: config.flush_threshold,
            capacity: config.capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots before the sender is at capacity.
    pub fn room(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Whether the buffer reached the auto-flush threshold.
    pub fn should_flush(&self) -> bool {
        self.buf.len() >= self.flush_threshold
    }

    /// Buffer a request. The caller has checked [`room`](Self::room).
    pub fn push(&mut self, req: IoRequest) {
        debug_assert!(self.buf.len() < self.capacity, "sender over capacity");
        debug_assert_eq!(req.device(), Some(self.device));
        debug_assert_eq!(req.priority(), self.priority);
        self.buf.push(req);
    }

    /// Remove the buffered requests without handing them to a driver.
    #[cfg(test)]
    pub fn take_buffered(&mut self) -> Vec<IoRequest> {
        std::mem::take(&mut self.buf)
    }

    /// Hand the whole buffer to the driver as one batch.
    pub fn flush(
        &mut self,
        drivers: &DriverSet,
        notifier: &CompletionNotifier,
        wait: Option<Duration>,
    ) -> FlushOutcome {
        if self.buf.is_empty() {
            return FlushOutcome::Empty;
        }
        let requests = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
        let n = requests.len();
        let batch = Batch {
            requests,
            notifier: notifier.clone(),
        };
        match drivers.submit(self.device, self.priority, batch, wait) {
            Ok(()) => FlushOutcome::Sent(n),
            Err(HandoffError::Full(batch)) => {
                self.buf = batch.requests;
                FlushOutcome::Refused
            }
            Err(HandoffError::Gone(batch)) => FlushOutcome::DriverGone(batch.requests),
        }
    }
}
