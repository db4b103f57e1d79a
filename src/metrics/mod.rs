//! Ownership metrics.
//!
//! Every coordinator carries a [`CoordinatorMetrics`] that records the
//! outcome of each bid, renewal and health probe. The values are plain
//! atomics; [`CoordinatorMetrics::to_prometheus`] renders them in the text
//! exposition format for whatever endpoint the host process exposes.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   CoordinatorMetrics                    │
//! │  ┌──────────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │ Counters         │  │ Gauges     │  │ Labeled    │  │
//! │  │ - bids           │  │ - owned    │  │ - skipped  │  │
//! │  │ - renewals       │  │            │  │   ticks    │  │
//! │  │ - leases lost    │  │            │  │            │  │
//! │  └──────────────────┘  └────────────┘  └────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Counters and gauges for one coordinator.
#[derive(Debug)]
pub struct CoordinatorMetrics {
    // Discovery
    pub bids_total: Counter,
    pub bids_granted: Counter,
    pub bids_denied: Counter,
    /// Acquire calls that errored or timed out.
    pub bid_errors: Counter,

    // Lease hold
    pub renewals_total: Counter,
    pub renewals_failed: Counter,
    /// Partitions evicted after a failed renewal.
    pub leases_lost: Counter,

    // Workers
    pub workers_started: Counter,
    pub worker_start_failures: Counter,
    /// Workers closed after exhausting local recovery.
    pub workers_retired: Counter,
    pub health_failures: Counter,
    pub owned_partitions: Gauge,

    /// Ticks dropped by the single-flight guard, by activity.
    pub ticks_skipped: LabeledCounter<1>,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            bids_total: Counter::new("tenure_bids_total", "Acquire calls placed"),
            bids_granted: Counter::new("tenure_bids_granted_total", "Acquire calls granted"),
            bids_denied: Counter::new("tenure_bids_denied_total", "Acquire calls denied"),
            bid_errors: Counter::new("tenure_bid_errors_total", "Acquire calls failed or timed out"),

            renewals_total: Counter::new("tenure_renewals_total", "Renew calls placed"),
            renewals_failed: Counter::new("tenure_renewals_failed_total", "Renew calls not confirmed"),
            leases_lost: Counter::new("tenure_leases_lost_total", "Partitions evicted on lease loss"),

            workers_started: Counter::new("tenure_workers_started_total", "Workers started"),
            worker_start_failures: Counter::new(
                "tenure_worker_start_failures_total",
                "Workers that failed to subscribe",
            ),
            workers_retired: Counter::new(
                "tenure_workers_retired_total",
                "Workers closed after failed recovery",
            ),
            health_failures: Counter::new(
                "tenure_health_failures_total",
                "Health probes reporting an unhealthy worker",
            ),
            owned_partitions: Gauge::new("tenure_owned_partitions", "Partitions currently owned"),

            ticks_skipped: LabeledCounter::new(
                "tenure_ticks_skipped_total",
                "Ticks skipped because the previous one was still running",
                ["activity"],
            ),
        }
    }

    /// Record the answer to one acquire call. `None` means error or timeout.
    pub fn record_bid(&self, granted: Option<bool>) {
        self.bids_total.inc();
        match granted {
            Some(true) => self.bids_granted.inc(),
            Some(false) => self.bids_denied.inc(),
            None => self.bid_errors.inc(),
        }
    }

    pub fn record_renewal(&self, confirmed: bool) {
        self.renewals_total.inc();
        if !confirmed {
            self.renewals_failed.inc();
        }
    }

    pub fn record_skipped(&self, activity: &str) {
        self.ticks_skipped.inc([activity]);
    }

    pub fn set_owned(&self, owned: usize) {
        self.owned_partitions.set(owned as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bids_total: self.bids_total.get(),
            bids_granted: self.bids_granted.get(),
            bids_denied: self.bids_denied.get(),
            bid_errors: self.bid_errors.get(),
            renewals_total: self.renewals_total.get(),
            renewals_failed: self.renewals_failed.get(),
            leases_lost: self.leases_lost.get(),
            workers_started: self.workers_started.get(),
            worker_start_failures: self.worker_start_failures.get(),
            workers_retired: self.workers_retired.get(),
            health_failures: self.health_failures.get(),
            owned_partitions: self.owned_partitions.get(),
            ticks_skipped: self
                .ticks_skipped
                .get_all()
                .into_iter()
                .map(|([activity], n)| (activity, n))
                .collect(),
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.bids_total,
            &self.bids_granted,
            &self.bids_denied,
            &self.bid_errors,
            &self.renewals_total,
            &self.renewals_failed,
            &self.leases_lost,
            &self.workers_started,
            &self.worker_start_failures,
            &self.workers_retired,
            &self.health_failures,
        ] {
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            ));
        }

        output.push_str(&format!(
            "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
            self.owned_partitions.help(),
            self.owned_partitions.get(),
            name = self.owned_partitions.name(),
        ));

        let skipped = &self.ticks_skipped;
        output.push_str(&format!(
            "# HELP {name} {}\n# TYPE {name} counter\n",
            skipped.help(),
            name = skipped.name(),
        ));
        for ([activity], n) in skipped.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                skipped.name(),
                skipped.label_names()[0],
                activity,
                n
            ));
        }

        output
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the metric values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bids_total: u64,
    pub bids_granted: u64,
    pub bids_denied: u64,
    pub bid_errors: u64,
    pub renewals_total: u64,
    pub renewals_failed: u64,
    pub leases_lost: u64,
    pub workers_started: u64,
    pub worker_start_failures: u64,
    pub workers_retired: u64,
    pub health_failures: u64,
    pub owned_partitions: i64,
    /// `(activity, skipped)` pairs.
    pub ticks_skipped: Vec<(String, u64)>,
}

impl MetricsSnapshot {
    /// Skipped ticks for one activity.
    pub fn skipped(&self, activity: &str) -> u64 {
        self.ticks_skipped
            .iter()
            .find(|(name, _)| name == activity)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}
