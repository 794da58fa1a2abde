//! Coordinator configuration.

use std::time::Duration;

use domain::OutOfOrderPolicy;
use domain::aggregate::DEFAULT_SNAPSHOT_INTERVAL;

use crate::compensation::RetryPolicy;

/// Configuration shared by every saga worker.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bounded mailbox size per saga; senders wait when it is full.
    pub mailbox_capacity: usize,
    pub out_of_order: OutOfOrderPolicy,
    /// How long a strict-policy out-of-order event waits for its start.
    pub out_of_order_window: Duration,
    pub retry: RetryPolicy,
    /// Abort branches STARTED longer than this. `None` disables the check.
    pub branch_timeout: Option<Duration>,
    /// Events between snapshots; 0 disables snapshots.
    pub snapshot_interval: u64,
    /// How often a worker checks buffered events and branch deadlines.
    pub tick_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            out_of_order: OutOfOrderPolicy::Strict,
            out_of_order_window: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            branch_timeout: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn with_out_of_order(mut self, policy: OutOfOrderPolicy, window: Duration) -> Self {
        self.out_of_order = policy;
        self.out_of_order_window = window;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.branch_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }
}
