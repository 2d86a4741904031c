use std::time::Duration;

use crate::error::Error;

/// What a completion queue does when a driver pushes into it at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullPolicy {
    /// Block the pushing driver thread until the owner drains.
    #[default]
    Block,
    /// Hand the overflow back to the pusher as [`QueueFull`](crate::QueueFull).
    Reject,
}

/// Configuration for proxies and the driver threads they talk to.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Per-(device, priority) request buffering.
    pub sender: SenderConfig,
    /// Driver thread configuration.
    pub driver: DriverConfig,
    /// Per-proxy completion queue.
    pub completion: CompletionConfig,
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sender.flush_threshold == 0 {
            return Err(Error::InvalidConfig(
                "sender.flush_threshold must be > 0".into(),
            ));
        }
        if self.sender.capacity < self.sender.flush_threshold {
            return Err(Error::InvalidConfig(
                "sender.capacity must be >= sender.flush_threshold".into(),
            ));
        }
        if self.driver.inbound_depth == 0 {
            return Err(Error::InvalidConfig(
                "driver.inbound_depth must be > 0".into(),
            ));
        }
        if self.driver.high_prio_burst == 0 {
            return Err(Error::InvalidConfig(
                "driver.high_prio_burst must be > 0".into(),
            ));
        }
        if self.driver.max_pending_per_device == 0 {
            return Err(Error::InvalidConfig(
                "driver.max_pending_per_device must be > 0".into(),
            ));
        }
        if self.completion.capacity == 0 {
            return Err(Error::InvalidConfig(
                "completion.capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the per-(device, priority) request senders.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Buffered requests that trigger an automatic batch handoff.
    /// This is the per-device cached-request threshold.
    /// Default: 32.
    pub flush_threshold: usize,
    /// Hard bound on buffered requests. Inserting into a full sender whose
    /// flush is refused by the driver is rejected.
    /// Default: 64.
    pub capacity: usize,
    /// How long an automatic flush waits on a full driver queue before
    /// leaving the batch buffered.
    /// Default: 1ms.
    pub flush_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 32,
            capacity: 64,
            flush_timeout: Duration::from_millis(1),
        }
    }
}

/// Configuration for the per-device driver threads.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Batches each inbound queue (one per priority) holds before refusing handoffs.
    /// Default: 16.
    pub inbound_depth: usize,
    /// High-priority batches serviced in a row before a waiting low-priority
    /// batch gets a turn.
    /// Default: 8.
    pub high_prio_burst: usize,
    /// Outstanding requests each device is expected to absorb. Only used to
    /// report [`Proxy::get_max_num_pending_ios`](crate::Proxy::get_max_num_pending_ios).
    /// Default: 64.
    pub max_pending_per_device: usize,
    /// Whether to pin each driver thread to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            inbound_depth: 16,
            high_prio_burst: 8,
            max_pending_per_device: 64,
            pin_to_core: false,
            core_offset: 0,
        }
    }
}

/// Configuration for a proxy's completion queue.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Completed requests the queue holds.
    /// Default: 10240.
    pub capacity: usize,
    /// Behavior when a driver pushes into a full queue.
    pub full_policy: FullPolicy,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            capacity: 10240,
            full_policy: FullPolicy::Block,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use diskline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .flush_threshold(16)
///     .sender_capacity(48)
///     .high_prio_burst(4)
///     .completion_capacity(4096)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sender settings ──────────────────────────────────────────────

    /// Set the buffered count that triggers an automatic flush.
    pub fn flush_threshold(mut self, n: usize) -> Self {
        self.config.sender.flush_threshold = n;
        self
    }

    /// Set the hard bound on buffered requests per sender.
    pub fn sender_capacity(mut self, n: usize) -> Self {
        self.config.sender.capacity = n;
        self
    }

    /// Set how long an automatic flush waits on a full driver queue.
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.sender.flush_timeout = timeout;
        self
    }

    // ── Driver settings ──────────────────────────────────────────────

    /// Set the inbound queue depth (in batches) per driver and priority.
    pub fn inbound_depth(mut self, n: usize) -> Self {
        self.config.driver.inbound_depth = n;
        self
    }

    /// Set how many high-priority batches run before a low-priority one.
    pub fn high_prio_burst(mut self, n: usize) -> Self {
        self.config.driver.high_prio_burst = n;
        self
    }

    /// Set the per-device outstanding request limit.
    pub fn max_pending_per_device(mut self, n: usize) -> Self {
        self.config.driver.max_pending_per_device = n;
        self
    }

    /// Enable or disable CPU core pinning for driver threads.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.driver.pin_to_core = enable;
        self
    }

    /// Set the starting CPU core index for pinning.
    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.driver.core_offset = offset;
        self
    }

    // ── Completion settings ──────────────────────────────────────────

    /// Set the completion queue capacity.
    pub fn completion_capacity(mut self, n: usize) -> Self {
        self.config.completion.capacity = n;
        self
    }

    /// Set the completion queue full policy.
    pub fn full_policy(mut self, policy: FullPolicy) -> Self {
        self.config.completion.full_policy = policy;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
