//! diskline runtime metrics.
//!
//! Process-wide diagnostic counters across every proxy and driver thread.
//! The functional issued/completed accounting lives on each proxy; these
//! only feed Prometheus exposition when registered with an admin server.

use metriken::{Counter, Gauge, metric};

// ── Proxy submission ─────────────────────────────────────────────

#[metric(
    name = "diskline/requests/issued",
    description = "Physical requests handed to senders"
)]
pub static REQUESTS_ISSUED: Counter = Counter::new();

#[metric(
    name = "diskline/requests/completed",
    description = "Physical requests delivered to callbacks"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "diskline/requests/rejected",
    description = "Requests rejected at submission"
)]
pub static REQUESTS_REJECTED: Counter = Counter::new();

#[metric(
    name = "diskline/requests/failed",
    description = "Requests completed with a device error"
)]
pub static REQUESTS_FAILED: Counter = Counter::new();

#[metric(
    name = "diskline/proxies/active",
    description = "Currently live proxies"
)]
pub static PROXIES_ACTIVE: Gauge = Gauge::new();

// ── Batching ─────────────────────────────────────────────────────

#[metric(
    name = "diskline/batches/flushed",
    description = "Sender batches handed to driver queues"
)]
pub static BATCHES_FLUSHED: Counter = Counter::new();

#[metric(
    name = "diskline/batches/refused",
    description = "Flushes refused by a full driver queue"
)]
pub static BATCHES_REFUSED: Counter = Counter::new();

// ── Driver service ───────────────────────────────────────────────

#[metric(
    name = "diskline/driver/batches_high",
    description = "High-priority batches serviced by drivers"
)]
pub static DRIVER_BATCHES_HIGH: Counter = Counter::new();

#[metric(
    name = "diskline/driver/batches_low",
    description = "Low-priority batches serviced by drivers"
)]
pub static DRIVER_BATCHES_LOW: Counter = Counter::new();

#[metric(
    name = "diskline/driver/completion_retries",
    description = "Completion pushes retried on a full queue"
)]
pub static COMPLETION_RETRIES: Counter = Counter::new();
