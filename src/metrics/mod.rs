//! Metrics for monitoring an ownership shard.
//!
//! Prometheus-style counters and gauges, updated by the commit coordinator, the
//! shard loop and the listener delivery tasks:
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    ShardMetrics                    │
//! │  ┌──────────────────────┐  ┌────────────────────┐  │
//! │  │  Counters            │  │  Gauges            │  │
//! │  │ - batches/failures   │  │ - pending mods     │  │
//! │  │ - retries/rebuilds   │  │ - down peers       │  │
//! │  │ - owner writes       │  │ - is_leader        │  │
//! │  │ - notifications      │  │                    │  │
//! │  └──────────────────────┘  └────────────────────┘  │
//! └────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one ownership shard replica.
#[derive(Debug)]
pub struct ShardMetrics {
    // Commit coordinator
    /// Batches handed to the consensus primitive.
    pub batches_submitted: Counter,
    /// Batches that failed to commit.
    pub commit_failures: Counter,
    /// Retry timer firings that resubmitted a batch.
    pub commit_retries: Counter,
    /// Batches given a fresh transaction id after an ambiguous failure or role change.
    pub transactions_rebuilt: Counter,
    /// Owner writes dropped on losing leadership.
    pub modifications_pruned: Counter,
    /// Queued modifications not yet in flight.
    pub pending_modifications: Gauge,

    // Shard
    /// Owner writes queued by the leader.
    pub owner_writes: Counter,
    /// Members currently believed down.
    pub down_peers: Gauge,
    /// Whether this replica leads the shard.
    pub is_leader: AtomicBool,

    // Listener delivery
    /// Notifications delivered to listeners.
    pub listener_notifications: Counter,
    /// Notifications whose listener panicked.
    pub listener_failures: Counter,
}

impl ShardMetrics {
    pub fn new() -> Self {
        Self {
            batches_submitted: Counter::new(
                "ownership_batches_submitted_total",
                "Modification batches submitted for replication",
            ),
            commit_failures: Counter::new(
                "ownership_commit_failures_total",
                "Modification batches that failed to commit",
            ),
            commit_retries: Counter::new(
                "ownership_commit_retries_total",
                "Modification batches resubmitted by the retry timer",
            ),
            transactions_rebuilt: Counter::new(
                "ownership_transactions_rebuilt_total",
                "In-flight batches rebuilt under a new transaction id",
            ),
            modifications_pruned: Counter::new(
                "ownership_modifications_pruned_total",
                "Owner writes discarded after losing leadership",
            ),
            pending_modifications: Gauge::new(
                "ownership_pending_modifications",
                "Modifications queued behind the in-flight batch",
            ),
            owner_writes: Counter::new(
                "ownership_owner_writes_total",
                "Owner writes queued by the shard leader",
            ),
            down_peers: Gauge::new("ownership_down_peers", "Members currently believed down"),
            is_leader: AtomicBool::new(false),
            listener_notifications: Counter::new(
                "ownership_listener_notifications_total",
                "Ownership changes delivered to listeners",
            ),
            listener_failures: Counter::new(
                "ownership_listener_failures_total",
                "Ownership change deliveries whose listener panicked",
            ),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Relaxed);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> ShardMetricsSnapshot {
        ShardMetricsSnapshot {
            batches_submitted: self.batches_submitted.get(),
            commit_failures: self.commit_failures.get(),
            commit_retries: self.commit_retries.get(),
            transactions_rebuilt: self.transactions_rebuilt.get(),
            modifications_pruned: self.modifications_pruned.get(),
            pending_modifications: self.pending_modifications.get(),
            owner_writes: self.owner_writes.get(),
            down_peers: self.down_peers.get(),
            is_leader: self.is_leader(),
            listener_notifications: self.listener_notifications.get(),
            listener_failures: self.listener_failures.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.batches_submitted);
        add_metric!("counter", self.commit_failures);
        add_metric!("counter", self.commit_retries);
        add_metric!("counter", self.transactions_rebuilt);
        add_metric!("counter", self.modifications_pruned);
        add_metric!("counter", self.owner_writes);
        add_metric!("counter", self.listener_notifications);
        add_metric!("counter", self.listener_failures);

        add_metric!("gauge", self.pending_modifications);
        add_metric!("gauge", self.down_peers);

        output.push_str(&format!(
            "# HELP ownership_is_leader Whether this replica leads the shard\n\
             # TYPE ownership_is_leader gauge\n\
             ownership_is_leader {}\n",
            if self.is_leader() { 1 } else { 0 }
        ));

        output
    }
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of shard metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMetricsSnapshot {
    pub batches_submitted: u64,
    pub commit_failures: u64,
    pub commit_retries: u64,
    pub transactions_rebuilt: u64,
    pub modifications_pruned: u64,
    pub pending_modifications: i64,
    pub owner_writes: u64,
    pub down_peers: i64,
    pub is_leader: bool,
    pub listener_notifications: u64,
    pub listener_failures: u64,
}
