//! Adaptive flow credit (prefetch window) for partition consumers.
//!
//! A freshly acquired partition starts at the destination's minimum credit
//! so a slow consumer is not flooded. Each full window of consecutive
//! successful deliveries grows the credit by one increment, up to the
//! maximum. Any handler failure drops it back to the minimum.

use crate::registry::Destination;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use tracing::debug;

/// Flow credit tracker for one worker.
///
/// Only the worker's consume loop mutates it; readers see a relaxed snapshot.
pub struct FlowCredit {
    min: u16,
    increment: u16,
    max: u16,
    current: AtomicU16,
    /// Consecutive successes since the last adjustment.
    streak: AtomicU32,
}

impl FlowCredit {
    /// Create a tracker with explicit bounds.
    pub fn new(min: u16, increment: u16, max: u16) -> Self {
        let max = max.max(min);
        Self {
            min,
            increment,
            max,
            current: AtomicU16::new(min),
            streak: AtomicU32::new(0),
        }
    }

    /// Create a tracker from a destination's bounds.
    pub fn for_destination(destination: &Destination) -> Self {
        Self::new(
            destination.min_flow_credit,
            destination.flow_credit_increment,
            destination.max_flow_credit,
        )
    }

    /// Current credit.
    pub fn current(&self) -> u16 {
        self.current.load(Ordering::Relaxed)
    }

    /// Lower bound.
    pub fn min(&self) -> u16 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Record a successful delivery. Returns the new credit if it grew.
    pub fn record_success(&self) -> Option<u16> {
        let current = self.current();
        let streak = self.streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak < u32::from(current) || current >= self.max {
            return None;
        }

        let grown = current.saturating_add(self.increment).min(self.max);
        self.current.store(grown, Ordering::Relaxed);
        self.streak.store(0, Ordering::Relaxed);
        debug!(from = current, to = grown, "Flow credit increased");
        Some(grown)
    }

    /// Record a failed delivery. Returns the new credit if it shrank.
    pub fn record_failure(&self) -> Option<u16> {
        self.streak.store(0, Ordering::Relaxed);
        let current = self.current();
        if current == self.min {
            return None;
        }
        self.current.store(self.min, Ordering::Relaxed);
        debug!(from = current, to = self.min, "Flow credit reset after failure");
        Some(self.min)
    }

    /// Return to the initial window.
    pub fn reset(&self) {
        self.current.store(self.min, Ordering::Relaxed);
        self.streak.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FlowCredit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowCredit")
            .field("min", &self.min)
            .field("increment", &self.increment)
            .field("max", &self.max)
            .field("current", &self.current())
            .finish()
    }
}
