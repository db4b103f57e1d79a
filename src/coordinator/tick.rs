//! Tick bookkeeping: activities, single-flight guards and per-tick reports.

use crate::types::PartitionKey;
use std::sync::atomic::{AtomicBool, Ordering};

/// The timer-driven coordinator activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    /// Bid for partitions nobody here owns.
    Discovery,
    /// Renew every held lease.
    Renew,
    /// Probe every worker.
    Health,
    /// Bid again for partitions whose retry hint has come due.
    Rebid,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Discovery => "discovery",
            Activity::Renew => "renew",
            Activity::Health => "health",
            Activity::Rebid => "rebid",
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one tick did, partition by partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub activity: Activity,
    /// Partitions the tick looked at.
    pub examined: usize,
    /// Newly owned partitions (discovery, rebid).
    pub acquired: Vec<PartitionKey>,
    /// Partitions evicted after losing their lease (renew).
    pub lost: Vec<PartitionKey>,
    /// Workers restarted by their health probe (health).
    pub recovered: Vec<PartitionKey>,
    /// Workers given up on and released (health).
    pub retired: Vec<PartitionKey>,
    /// Per-partition failures; none of them aborted the tick.
    pub failures: Vec<(PartitionKey, String)>,
}

impl TickReport {
    pub fn new(activity: Activity) -> Self {
        Self {
            activity,
            examined: 0,
            acquired: Vec::new(),
            lost: Vec::new(),
            recovered: Vec::new(),
            retired: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Whether anything changed or failed.
    pub fn is_eventful(&self) -> bool {
        !(self.acquired.is_empty()
            && self.lost.is_empty()
            && self.recovered.is_empty()
            && self.retired.is_empty()
            && self.failures.is_empty())
    }
}

/// Result of invoking a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick of the same activity was still running.
    Skipped,
    Completed(TickReport),
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }

    pub fn report(&self) -> Option<&TickReport> {
        match self {
            TickOutcome::Skipped => None,
            TickOutcome::Completed(report) => Some(report),
        }
    }
}

/// Lets at most one tick of an activity run at a time.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    /// Enter the flight, or `None` if another tick holds it.
    pub(crate) fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: &self.running,
            })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the flight on drop, including during unwinding.
pub(crate) struct FlightGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_rejects_overlap() {
        let flight = SingleFlight::default();

        let guard = flight.try_enter();
        assert!(guard.is_some());
        assert!(flight.try_enter().is_none());
        assert!(flight.is_running());

        drop(guard);
        assert!(!flight.is_running());
        assert!(flight.try_enter().is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let flight = SingleFlight::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = flight.try_enter();
            panic!("tick failed");
        }));

        assert!(result.is_err());
        assert!(!flight.is_running());
    }

    #[test]
    fn test_report_eventful() {
        let mut report = TickReport::new(Activity::Renew);
        report.examined = 3;
        assert!(!report.is_eventful());

        report.lost.push(PartitionKey::new("orders_1"));
        assert!(report.is_eventful());
        assert_eq!(TickOutcome::Completed(report.clone()).report(), Some(&report));
        assert!(TickOutcome::Skipped.is_skipped());
    }
}
