//! In-process linearizable lease store.

use super::clock::{Clock, TokioClock};
use super::LeaseStore;
use crate::config::LeaseStoreConfig;
use crate::error::Result;
use crate::types::{AcquireOutcome, Bid, LeaseId, LeaseInfo, PartitionKey, ProcessId, Weight};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Holder {
    lease_id: LeaseId,
    owner: ProcessId,
    weight: Weight,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingBid {
    weight: Weight,
    /// Arrival order of the bidder's first pending bid on this key.
    seq: u64,
    expires_at: Instant,
}

/// A pending bid valued at its bidder's latest reported weight.
#[derive(Debug, Clone, Copy)]
struct Rival {
    bidder: ProcessId,
    weight: Weight,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Report {
    weight: Weight,
    at: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    holder: Option<Holder>,
    bids: HashMap<ProcessId, PendingBid>,
}

impl Slot {
    fn prune(&mut self, now: Instant) {
        if self.holder.as_ref().is_some_and(|h| h.expires_at <= now) {
            self.holder = None;
        }
        self.bids.retain(|_, bid| bid.expires_at > now);
    }

    /// Strongest pending bid not placed by `exclude`, optionally only from
    /// bidders heard from since `active_since`.
    ///
    /// A bid placed before its bidder won other partitions still carries the
    /// old weight, so bids are ranked by what the bidder reported last.
    fn best_rival(
        &self,
        exclude: ProcessId,
        reports: &HashMap<ProcessId, Report>,
        active_since: Option<Instant>,
    ) -> Option<Rival> {
        self.bids
            .iter()
            .filter(|(bidder, _)| **bidder != exclude)
            .filter(|(bidder, _)| {
                active_since.map_or(true, |since| reports.get(*bidder).is_some_and(|r| r.at >= since))
            })
            .map(|(bidder, bid)| Rival {
                bidder: *bidder,
                weight: reports.get(bidder).map_or(bid.weight, |r| r.weight),
                seq: bid.seq,
            })
            .max_by(|a, b| a.weight.cmp(&b.weight).then(b.seq.cmp(&a.seq)))
    }

    fn is_empty(&self) -> bool {
        self.holder.is_none() && self.bids.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<PartitionKey, Slot>,
    next_seq: u64,
    /// Latest weight each process sent with any call.
    reports: HashMap<ProcessId, Report>,
    /// When each holder last had a lease handed to someone else.
    revoked_at: HashMap<ProcessId, Instant>,
}

impl State {
    /// Record or refresh a pending bid; returns its arrival sequence.
    fn record_bid(&mut self, partition: &PartitionKey, bid: Bid, expires_at: Instant) -> u64 {
        let seq = self.next_seq;
        let slot = self.slots.entry(partition.clone()).or_default();
        let entry = slot.bids.entry(bid.bidder).or_insert(PendingBid {
            weight: bid.weight,
            seq,
            expires_at,
        });
        if entry.seq == seq {
            self.next_seq += 1;
        }
        entry.weight = bid.weight;
        entry.expires_at = expires_at;
        entry.seq
    }

    fn report(&mut self, process: ProcessId, weight: Weight, now: Instant) {
        self.reports.insert(process, Report { weight, at: now });
    }

    fn prune_reports(&mut self, now: Instant, config: &LeaseStoreConfig) {
        self.reports.retain(|_, r| r.at + config.bid_ttl > now);
        self.revoked_at
            .retain(|_, at| *at + config.preemption_cooldown > now);
    }
}

/// Lease store backed by a single mutex-guarded map.
///
/// Every operation takes the lock once, so the store is linearizable. It is
/// the reference implementation of [`LeaseStore`] and the backend used by the
/// multi-process simulations in the test suite.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    config: LeaseStoreConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryLeaseStore {
    /// Create a store on the runtime clock.
    pub fn new(config: LeaseStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a store with an explicit clock.
    pub fn with_clock(config: LeaseStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// Create a store with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(LeaseStoreConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &LeaseStoreConfig {
        &self.config
    }

    /// Snapshot of every live lease, sorted by partition.
    pub fn live_leases(&self) -> Vec<LeaseInfo> {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut leases: Vec<_> = state
            .slots
            .iter()
            .filter_map(|(partition, slot)| {
                slot.holder
                    .as_ref()
                    .filter(|h| h.expires_at > now)
                    .map(|h| lease_info(partition, h))
            })
            .collect();
        leases.sort_by(|a, b| a.partition.cmp(&b.partition));
        leases
    }

    /// Number of live leases held by `process`.
    pub fn held_by(&self, process: ProcessId) -> usize {
        self.live_leases()
            .iter()
            .filter(|l| l.holder == process)
            .count()
    }

    fn acquire_locked(&self, partition: &PartitionKey, bid: Bid, ttl: Duration) -> AcquireOutcome {
        let now = self.clock.now();
        let bid_expiry = now + self.config.bid_ttl;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.prune_reports(now, &self.config);
        state.report(bid.bidder, bid.weight, now);

        let slot = state.slots.entry(partition.clone()).or_default();
        slot.prune(now);

        if let Some(holder) = slot.holder.as_mut() {
            if holder.owner == bid.bidder {
                holder.weight = bid.weight;
                holder.expires_at = now + ttl;
                return AcquireOutcome::Granted {
                    lease_id: holder.lease_id,
                    expires_at: holder.expires_at,
                };
            }
            let remaining = holder.expires_at.saturating_duration_since(now);
            let owner = holder.owner;
            let holder_weight = state.reports.get(&owner).map_or(holder.weight, |r| r.weight);
            state.record_bid(partition, bid, bid_expiry);

            // Strong enough to be handed the lease at the holder's next
            // renewal: come back soon to pick it up.
            let retry_after = match self.config.preemption_margin {
                Some(margin) if bid.weight >= holder_weight.saturating_add(margin) => {
                    remaining.min(self.config.preemption_retry)
                }
                _ => remaining,
            };
            return AcquireOutcome::Denied { retry_after };
        }

        let seq = state.record_bid(partition, bid, bid_expiry);
        let State { slots, reports, .. } = state;
        let slot = slots.entry(partition.clone()).or_default();

        if let Some(rival) = slot.best_rival(bid.bidder, reports, None) {
            if rival.weight > bid.weight || (rival.weight == bid.weight && rival.seq < seq) {
                debug!(
                    partition = %partition,
                    weight = bid.weight,
                    rival_weight = rival.weight,
                    "Bid lost to a stronger pending bid"
                );
                return AcquireOutcome::Denied {
                    retry_after: self.config.contention_backoff,
                };
            }
        }

        slot.bids.remove(&bid.bidder);
        let holder = Holder {
            lease_id: LeaseId::new(),
            owner: bid.bidder,
            weight: bid.weight,
            expires_at: now + ttl,
        };
        let outcome = AcquireOutcome::Granted {
            lease_id: holder.lease_id,
            expires_at: holder.expires_at,
        };
        slot.holder = Some(holder);
        outcome
    }

    fn renew_locked(
        &self,
        partition: &PartitionKey,
        lease_id: LeaseId,
        weight: Weight,
        ttl: Duration,
    ) -> bool {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.prune_reports(now, &self.config);
        let State {
            slots,
            reports,
            revoked_at,
            ..
        } = state;
        let Some(slot) = slots.get_mut(partition) else {
            return false;
        };
        slot.prune(now);

        let owner = match slot.holder.as_ref() {
            Some(holder) if holder.lease_id == lease_id => holder.owner,
            _ => return false,
        };
        reports.insert(owner, Report { weight, at: now });

        // At most one lease leaves a holder per cooldown, and it goes
        // straight to the rival so the partition is never without a lease.
        // A rival silent for a whole cooldown may be gone and is passed over.
        if let Some(margin) = self.config.preemption_margin {
            if !revoked_at.contains_key(&owner) {
                let active_since = now.checked_sub(self.config.preemption_cooldown);
                if let Some(rival) = slot.best_rival(owner, reports, active_since) {
                    if rival.weight >= weight.saturating_add(margin) {
                        debug!(
                            partition = %partition,
                            holder_weight = weight,
                            rival_weight = rival.weight,
                            "Handing lease over to a less-loaded bidder"
                        );
                        slot.bids.remove(&rival.bidder);
                        slot.holder = Some(Holder {
                            lease_id: LeaseId::new(),
                            owner: rival.bidder,
                            weight: rival.weight,
                            expires_at: now + ttl,
                        });
                        revoked_at.insert(owner, now);
                        return false;
                    }
                }
            }
        }

        if let Some(holder) = slot.holder.as_mut() {
            holder.weight = weight;
            holder.expires_at = now + ttl;
        }
        true
    }

    fn release_locked(&self, partition: &PartitionKey, lease_id: LeaseId) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(partition) else {
            return false;
        };
        slot.prune(now);

        let released = match slot.holder.as_ref() {
            Some(holder) if holder.lease_id == lease_id => {
                slot.holder = None;
                true
            }
            _ => false,
        };
        if slot.is_empty() {
            state.slots.remove(partition);
        }
        released
    }

    fn holder_locked(&self, partition: &PartitionKey) -> Option<LeaseInfo> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .slots
            .get(partition)
            .and_then(|slot| slot.holder.as_ref())
            .filter(|h| h.expires_at > now)
            .map(|h| lease_info(partition, h))
    }
}

fn lease_info(partition: &PartitionKey, holder: &Holder) -> LeaseInfo {
    LeaseInfo {
        partition: partition.clone(),
        lease_id: holder.lease_id,
        holder: holder.owner,
        weight: holder.weight,
        expires_at: holder.expires_at,
    }
}

#[async_trait::async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(
        &self,
        partition: &PartitionKey,
        bid: Bid,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        Ok(self.acquire_locked(partition, bid, ttl))
    }

    async fn renew(
        &self,
        partition: &PartitionKey,
        lease_id: LeaseId,
        weight: Weight,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.renew_locked(partition, lease_id, weight, ttl))
    }

    async fn release(&self, partition: &PartitionKey, lease_id: LeaseId) -> Result<bool> {
        Ok(self.release_locked(partition, lease_id))
    }

    async fn holder(&self, partition: &PartitionKey) -> Result<Option<LeaseInfo>> {
        Ok(self.holder_locked(partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::ManualClock;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> (MemoryLeaseStore, ManualClock) {
        let clock = ManualClock::new();
        let store = MemoryLeaseStore::with_clock(LeaseStoreConfig::default(), Arc::new(clock.clone()));
        (store, clock)
    }

    fn key(s: &str) -> PartitionKey {
        PartitionKey::new(s)
    }

    #[tokio::test]
    async fn test_acquire_free_partition() {
        let (store, _clock) = store();
        let a = ProcessId::new();

        let outcome = store.acquire(&key("p0"), Bid::new(a, 10), TTL).await.unwrap();
        assert!(outcome.is_granted());

        let holder = store.holder(&key("p0")).await.unwrap().unwrap();
        assert_eq!(holder.holder, a);
        assert_eq!(Some(holder.lease_id), outcome.lease_id());
    }

    #[tokio::test]
    async fn test_live_lease_denies_with_remaining_ttl() {
        let (store, clock) = store();
        let (a, b) = (ProcessId::new(), ProcessId::new());

        store.acquire(&key("p0"), Bid::new(a, 10), TTL).await.unwrap();
        clock.advance(Duration::from_secs(15));

        let outcome = store.acquire(&key("p0"), Bid::new(b, 11), TTL).await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Denied {
                retry_after: Duration::from_secs(45)
            }
        );
    }

    #[tokio::test]
    async fn test_bidder_owed_a_handover_is_told_to_come_back_soon() {
        let (store, clock) = store();
        let (busy, idle) = (ProcessId::new(), ProcessId::new());

        store.acquire(&key("p0"), Bid::new(busy, 10), TTL).await.unwrap();
        clock.advance(Duration::from_secs(15));

        let outcome = store.acquire(&key("p0"), Bid::new(idle, 12), TTL).await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Denied {
                retry_after: store.config().preemption_retry
            }
        );
    }

    #[tokio::test]
    async fn test_holder_rebid_is_idempotent() {
        let (store, _clock) = store();
        let a = ProcessId::new();

        let first = store.acquire(&key("p0"), Bid::new(a, 10), TTL).await.unwrap();
        let second = store.acquire(&key("p0"), Bid::new(a, 9), TTL).await.unwrap();
        assert_eq!(first.lease_id(), second.lease_id());
    }

    #[tokio::test]
    async fn test_expired_lease_goes_to_higher_weight_waiter() {
        let (store, clock) = store();
        let (holder, low, high) = (ProcessId::new(), ProcessId::new(), ProcessId::new());

        store.acquire(&key("p0"), Bid::new(holder, 5), TTL).await.unwrap();
        // Both wait while the lease is live; the low bidder arrives first.
        store.acquire(&key("p0"), Bid::new(low, 7), TTL).await.unwrap();
        store.acquire(&key("p0"), Bid::new(high, 9), TTL).await.unwrap();

        clock.advance(TTL);

        let denied = store.acquire(&key("p0"), Bid::new(low, 7), TTL).await.unwrap();
        assert_eq!(
            denied,
            AcquireOutcome::Denied {
                retry_after: store.config().contention_backoff
            }
        );

        let granted = store.acquire(&key("p0"), Bid::new(high, 9), TTL).await.unwrap();
        assert!(granted.is_granted());
    }

    #[tokio::test]
    async fn test_equal_weight_goes_to_first_arrival() {
        let (store, clock) = store();
        let (holder, first, second) = (ProcessId::new(), ProcessId::new(), ProcessId::new());

        store.acquire(&key("p0"), Bid::new(holder, 1), TTL).await.unwrap();
        store.acquire(&key("p0"), Bid::new(first, 8), TTL).await.unwrap();
        store.acquire(&key("p0"), Bid::new(second, 8), TTL).await.unwrap();
        clock.advance(TTL);

        assert!(!store
            .acquire(&key("p0"), Bid::new(second, 8), TTL)
            .await
            .unwrap()
            .is_granted());
        assert!(store
            .acquire(&key("p0"), Bid::new(first, 8), TTL)
            .await
            .unwrap()
            .is_granted());
    }

    #[tokio::test]
    async fn test_stale_pending_bid_stops_blocking() {
        let (store, clock) = store();
        let (holder, ghost, live) = (ProcessId::new(), ProcessId::new(), ProcessId::new());

        store.acquire(&key("p0"), Bid::new(holder, 1), TTL).await.unwrap();
        store.acquire(&key("p0"), Bid::new(ghost, 100), TTL).await.unwrap();

        clock.advance(store.config().bid_ttl + Duration::from_secs(1));

        assert!(store
            .acquire(&key("p0"), Bid::new(live, 2), TTL)
            .await
            .unwrap()
            .is_granted());
    }

    #[tokio::test]
    async fn test_renew_extends_and_detects_loss() {
        let (store, clock) = store();
        let (a, b) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(a, 10), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();

        clock.advance(Duration::from_secs(50));
        assert!(store.renew(&key("p0"), lease, 10, TTL).await.unwrap());
        clock.advance(Duration::from_secs(50));
        assert!(store.holder(&key("p0")).await.unwrap().is_some());

        // Let it lapse; someone else takes over; the stale id must fail.
        clock.advance(TTL);
        assert!(store
            .acquire(&key("p0"), Bid::new(b, 10), TTL)
            .await
            .unwrap()
            .is_granted());
        assert!(!store.renew(&key("p0"), lease, 10, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_hands_lease_to_less_loaded_bidder() {
        let (store, _clock) = store();
        let (busy, idle) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(busy, 100), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();
        store.acquire(&key("p0"), Bid::new(idle, 101), TTL).await.unwrap();

        // One step apart: no handover.
        assert!(store.renew(&key("p0"), lease, 100, TTL).await.unwrap());

        // The holder has since taken on more partitions.
        assert!(!store.renew(&key("p0"), lease, 99, TTL).await.unwrap());

        // The lease moved to the rival without ever being free.
        let handed = store.holder(&key("p0")).await.unwrap().unwrap();
        assert_eq!(handed.holder, idle);
        assert_ne!(handed.lease_id, lease);

        let claimed = store.acquire(&key("p0"), Bid::new(idle, 101), TTL).await.unwrap();
        assert_eq!(claimed.lease_id(), Some(handed.lease_id));
    }

    #[tokio::test]
    async fn test_one_handover_per_holder_per_cooldown() {
        let (store, clock) = store();
        let (busy, idle) = (ProcessId::new(), ProcessId::new());

        let mut leases = Vec::new();
        for (i, weight) in [100, 99, 98].into_iter().enumerate() {
            let partition = key(&format!("p{}", i));
            let outcome = store.acquire(&partition, Bid::new(busy, weight), TTL).await.unwrap();
            leases.push((partition, outcome.lease_id().unwrap()));
        }
        for (partition, _) in &leases {
            store.acquire(partition, Bid::new(idle, 100), TTL).await.unwrap();
        }

        // A whole renew round gives up one lease, not every contested one.
        let mut kept = 0;
        for (partition, lease) in &leases {
            if store.renew(partition, *lease, 97, TTL).await.unwrap() {
                kept += 1;
            }
        }
        assert_eq!(kept, 2);
        assert_eq!(store.held_by(idle), 1);
        assert_eq!(store.held_by(busy), 2);

        // The rival keeps coming back for more.
        clock.advance(store.config().preemption_cooldown);
        for (partition, _) in &leases {
            store.acquire(partition, Bid::new(idle, 100), TTL).await.unwrap();
        }
        let mut handed = 0;
        for (partition, lease) in &leases {
            if let Some(info) = store.holder(partition).await.unwrap() {
                if info.lease_id == *lease && !store.renew(partition, *lease, 98, TTL).await.unwrap() {
                    handed += 1;
                }
            }
        }
        assert_eq!(handed, 1);
        assert_eq!(store.held_by(idle), 2);
        assert_eq!(store.live_leases().len(), 3);
    }

    #[tokio::test]
    async fn test_handover_uses_the_rivals_latest_weight() {
        let (store, _clock) = store();
        let (busy, rival) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(busy, 95), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();
        store.acquire(&key("p0"), Bid::new(rival, 100), TTL).await.unwrap();

        // The rival has since filled up elsewhere; its old bid no longer
        // outweighs the holder.
        assert!(store
            .acquire(&key("p1"), Bid::new(rival, 96), TTL)
            .await
            .unwrap()
            .is_granted());

        assert!(store.renew(&key("p0"), lease, 95, TTL).await.unwrap());
        assert_eq!(store.holder(&key("p0")).await.unwrap().unwrap().holder, busy);
    }

    #[tokio::test]
    async fn test_no_handover_to_a_silent_bidder() {
        let (store, clock) = store();
        let (busy, ghost) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(busy, 90), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();
        store.acquire(&key("p0"), Bid::new(ghost, 100), TTL).await.unwrap();

        // The bidder crashed right after bidding and never called again.
        clock.advance(store.config().preemption_cooldown + Duration::from_secs(1));
        assert!(store.renew(&key("p0"), lease, 90, TTL).await.unwrap());
        assert_eq!(store.holder(&key("p0")).await.unwrap().unwrap().holder, busy);
    }

    #[tokio::test]
    async fn test_preemption_can_be_disabled() {
        let clock = ManualClock::new();
        let store = MemoryLeaseStore::with_clock(
            LeaseStoreConfig::default().with_preemption_margin(None),
            Arc::new(clock),
        );
        let (busy, idle) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(busy, 1), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();
        let denied = store.acquire(&key("p0"), Bid::new(idle, 1_000), TTL).await.unwrap();
        assert_eq!(denied, AcquireOutcome::Denied { retry_after: TTL });

        assert!(store.renew(&key("p0"), lease, 1, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_immediately() {
        let (store, _clock) = store();
        let (a, b) = (ProcessId::new(), ProcessId::new());

        let lease = store
            .acquire(&key("p0"), Bid::new(a, 10), TTL)
            .await
            .unwrap()
            .lease_id()
            .unwrap();

        assert!(!store.release(&key("p0"), LeaseId::new()).await.unwrap());
        assert!(store.release(&key("p0"), lease).await.unwrap());
        assert!(!store.release(&key("p0"), lease).await.unwrap());

        assert!(store
            .acquire(&key("p0"), Bid::new(b, 1), TTL)
            .await
            .unwrap()
            .is_granted());
        assert_eq!(store.held_by(b), 1);
        assert_eq!(store.held_by(a), 0);
    }
}
