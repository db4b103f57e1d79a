//! Weighted, TTL-based lease locks keyed by partition.
//!
//! A lease is the only thing that makes a process the owner of a partition.
//! The store is assumed linearizable; every operation below is atomic with
//! respect to a single partition key.
//!
//! # Protocol
//!
//! ```text
//!   bidder A (weight 99_998)         store            bidder B (weight 100_000)
//!        │ acquire(p0) ─────────────▶ │ live lease held by C
//!        │ ◀──────────── Denied(ttl)  │ A pending @ 99_998
//!        │                            │ ◀───────────── acquire(p0)
//!        │                            │ ─────────────▶ Denied(ttl), B pending
//!        │                      (C's lease expires)
//!        │ acquire(p0) ─────────────▶ │ B outranks A
//!        │ ◀──────── Denied(backoff)  │
//!        │                            │ ◀───────────── acquire(p0)
//!        │                            │ ─────────────▶ Granted(lease)
//!
//!   holder B (weight 99_990)         store            bidder D (weight 99_999)
//!        │                            │ ◀───────────── acquire(p0)
//!        │                            │ ─────────────▶ Denied(retry soon)
//!        │ renew(p0) ───────────────▶ │ lease handed to D
//!        │ ◀────────────────── false  │
//!        │                            │ ◀───────────── acquire(p0)
//!        │                            │ ─────────────▶ Granted(D's lease)
//! ```
//!
//! - Higher weight wins; equal weights go to the earliest pending bid. A bid
//!   counts at the weight its bidder reported most recently, on any call.
//! - `renew` succeeds only while the presented lease id is the live one. A
//!   `false` return is the holder's sole signal that ownership is gone.
//! - When a pending bid outweighs the holder by the configured margin, the
//!   holder's next renewal is refused and the lease is handed to that bidder
//!   in the same step. A holder gives up at most one lease per cooldown, so
//!   rebalancing moves one partition at a time. Only bidders heard from
//!   within the cooldown qualify, so a crashed bidder is never handed one.
//! - `Denied.retry_after` is a hint: the remaining TTL of a live lease, a
//!   short delay when a handover is due to the bidder, or a backoff after
//!   losing a free partition to a stronger bid. Bidders that come back at the
//!   hint pick up handovers and expiries without waiting for discovery.
//! - Any error is equivalent to "not granted" for the caller.

mod clock;
mod memory;

pub use clock::{Clock, ManualClock, TokioClock};
pub use memory::MemoryLeaseStore;

use crate::error::Result;
use crate::types::{AcquireOutcome, Bid, LeaseId, LeaseInfo, PartitionKey, Weight};
use std::time::Duration;

/// A linearizable lease store.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Try to acquire the lease for `partition`.
    async fn acquire(&self, partition: &PartitionKey, bid: Bid, ttl: Duration)
        -> Result<AcquireOutcome>;

    /// Extend a held lease. Returns `false` if `lease_id` is no longer the
    /// live lease for `partition`.
    async fn renew(
        &self,
        partition: &PartitionKey,
        lease_id: LeaseId,
        weight: Weight,
        ttl: Duration,
    ) -> Result<bool>;

    /// Release a held lease immediately. Returns `false` if it was not live.
    async fn release(&self, partition: &PartitionKey, lease_id: LeaseId) -> Result<bool>;

    /// Inspect the live lease for `partition`, if any.
    async fn holder(&self, partition: &PartitionKey) -> Result<Option<LeaseInfo>>;
}
