//! Per-process ownership loop.
//!
//! Each process runs one [`Coordinator`]. It owns no partition by
//! configuration; everything it consumes it has won from the shared
//! [`LeaseStore`] and keeps only while it can renew.
//!
//! # Activities
//!
//! ```text
//!            ┌──────────── Coordinator ─────────────┐
//!            │                                       │
//!  discovery │  for each unowned partition:          │   LeaseStore
//!  (120s)    │    acquire(weight = max - owned) ─────┼──▶ Granted / Denied
//!            │    Granted → start PartitionWorker    │
//!            │    Denied  → schedule re-bid          │
//!            │                                       │
//!  rebid     │  re-bid partitions whose retry hint   │
//!  (1s)      │  has come due ────────────────────────┼──▶ Granted / Denied
//!            │                                       │
//!  renew     │  renew every owned lease concurrently │
//!  (20s)     │    renew(lease, weight) ──────────────┼──▶ true / false
//!            │    false/error → evict + close worker │
//!            │                                       │
//!  health    │  probe every worker concurrently      │
//!  (10s)     │    repeated failure → retire+release  │
//!            └───────────────────────────────────────┘
//! ```
//!
//! Every activity runs behind a single-flight guard: a tick that finds the
//! previous one still running is skipped and counted, never queued. Ticks
//! may also be driven by hand through [`Coordinator::discovery_tick`],
//! [`Coordinator::rebid_tick`], [`Coordinator::renew_tick`] and
//! [`Coordinator::health_tick`], before or instead of [`Coordinator::start`].
//!
//! # Ownership table
//!
//! Owned partitions live in a `DashMap` keyed by partition. Evictions only
//! remove an entry that still carries the lease id they observed, so a stale
//! renewal can never evict a newer ownership of the same partition.
//!
//! Every entry carries a local deadline: the instant its last successful
//! acquire or renew was sent, plus the TTL, minus `expiry_margin`. The store
//! cannot expire the lease before then. A watchdog per entry gives the
//! partition up once the deadline passes, whether or not a renewal reply
//! ever arrives.

mod tick;

pub use tick::{Activity, TickOutcome, TickReport};

use crate::config::CoordinatorConfig;
use crate::error::{Error, LeaseError, Result};
use crate::lease::LeaseStore;
use crate::metrics::CoordinatorMetrics;
use crate::registry::{Partition, PartitionRegistry};
use crate::transport::{BrokerTransport, MessageHandler};
use crate::types::{AcquireOutcome, Bid, LeaseId, PartitionKey, PartitionState, ProcessId, Weight};
use crate::worker::{PartitionWorker, WorkerHealth, WorkerSnapshot};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tick::SingleFlight;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoordinatorState {
    /// Constructed; ticks may be driven manually.
    Created = 0,
    /// Timers running.
    Running = 1,
    /// `stop` in progress; no new ownership is taken.
    ShuttingDown = 2,
    Stopped = 3,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoordinatorState::Created,
            1 => CoordinatorState::Running,
            2 => CoordinatorState::ShuttingDown,
            _ => CoordinatorState::Stopped,
        }
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Created => write!(f, "created"),
            CoordinatorState::Running => write!(f, "running"),
            CoordinatorState::ShuttingDown => write!(f, "shutting down"),
            CoordinatorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One running consumer, as reported by [`Coordinator::consumers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub partition: PartitionKey,
    pub destination: String,
    pub routing_key: String,
    pub lease_id: LeaseId,
    /// Time since the lease was won.
    pub owned_for: Duration,
    /// Time left before the partition is given up unless renewed.
    pub expires_in: Duration,
    pub worker: WorkerSnapshot,
}

#[derive(Clone)]
struct OwnedPartition {
    lease_id: LeaseId,
    worker: Arc<PartitionWorker>,
    acquired_at: Instant,
    deadline: Arc<Mutex<Instant>>,
    /// Cancelled when the entry leaves the table.
    watchdog: CancellationToken,
}

impl OwnedPartition {
    fn new(
        lease_id: LeaseId,
        worker: Arc<PartitionWorker>,
        deadline: Instant,
        watchdog: CancellationToken,
    ) -> Self {
        Self {
            lease_id,
            worker,
            acquired_at: Instant::now(),
            deadline: Arc::new(Mutex::new(deadline)),
            watchdog,
        }
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    fn extend(&self, deadline: Instant) {
        let mut current = self.deadline.lock();
        if deadline > *current {
            *current = deadline;
        }
    }
}

type OwnershipTable = DashMap<PartitionKey, OwnedPartition>;

/// Remove `key` if it still carries `lease_id`. The worker is barred from
/// restarting and left for the caller to close.
fn disown(table: &OwnershipTable, key: &PartitionKey, lease_id: LeaseId) -> Option<OwnedPartition> {
    let (_, owned) = table.remove_if(key, |_, owned| owned.lease_id == lease_id)?;
    owned.worker.mark_no_restart();
    owned.watchdog.cancel();
    Some(owned)
}

async fn close_workers(workers: Vec<Arc<PartitionWorker>>) {
    let mut closing = JoinSet::new();
    for worker in workers {
        closing.spawn(async move { worker.close().await });
    }
    while let Some(joined) = closing.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker close task failed");
        }
    }
}

async fn with_timeout<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LeaseError::Timeout(timeout).into()),
    }
}

/// A denied partition and when to bid for it again.
#[derive(Debug, Clone)]
struct Rebid {
    due: Instant,
    partition: Partition,
}

/// Marks a partition as Bidding for the duration of one acquire call.
struct BiddingMark<'a> {
    bidding: &'a DashSet<PartitionKey>,
    key: PartitionKey,
}

impl<'a> BiddingMark<'a> {
    /// `None` if another activity is already bidding for `key`.
    fn try_new(bidding: &'a DashSet<PartitionKey>, key: PartitionKey) -> Option<Self> {
        if bidding.insert(key.clone()) {
            Some(Self { bidding, key })
        } else {
            None
        }
    }
}

impl Drop for BiddingMark<'_> {
    fn drop(&mut self) {
        self.bidding.remove(&self.key);
    }
}

/// Acquires, holds and health-checks partitions for one process.
pub struct Coordinator {
    process_id: ProcessId,
    config: CoordinatorConfig,
    registry: Arc<PartitionRegistry>,
    store: Arc<dyn LeaseStore>,
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<dyn MessageHandler>,

    table: Arc<OwnershipTable>,
    bidding: DashSet<PartitionKey>,
    rebids: DashMap<PartitionKey, Rebid>,
    state: AtomicU8,

    discovery_flight: SingleFlight,
    renew_flight: SingleFlight,
    health_flight: SingleFlight,
    rebid_flight: SingleFlight,

    shutdown: CancellationToken,
    /// Cancelled once the coordinator has fully stopped.
    stopped: CancellationToken,
    tracker: TaskTracker,
    metrics: Arc<CoordinatorMetrics>,
}

impl Coordinator {
    /// Create a coordinator with a fresh process id.
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<PartitionRegistry>,
        store: Arc<dyn LeaseStore>,
        transport: Arc<dyn BrokerTransport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            process_id: ProcessId::new(),
            config,
            registry,
            store,
            transport,
            handler,
            table: Arc::new(DashMap::new()),
            bidding: DashSet::new(),
            rebids: DashMap::new(),
            state: AtomicU8::new(CoordinatorState::Created as u8),
            discovery_flight: SingleFlight::default(),
            renew_flight: SingleFlight::default(),
            health_flight: SingleFlight::default(),
            rebid_flight: SingleFlight::default(),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            tracker: TaskTracker::new(),
            metrics: Arc::new(CoordinatorMetrics::new()),
        })
    }

    /// Use a specific process id instead of a random one.
    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// Bid weight right now: fewer owned partitions bid higher.
    pub fn current_weight(&self) -> Weight {
        self.config
            .max_competitors
            .saturating_sub(self.table.len() as u64)
    }

    pub fn owned_count(&self) -> usize {
        self.table.len()
    }

    /// Owned partition keys, sorted.
    pub fn owned_partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.table.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// The lease this process holds for `key`, if any.
    pub fn lease_of(&self, key: &PartitionKey) -> Option<LeaseId> {
        self.table.get(key).map(|owned| owned.lease_id)
    }

    /// When a denied bid for `key` is due to be placed again, if scheduled.
    pub fn next_rebid(&self, key: &PartitionKey) -> Option<Instant> {
        self.rebids.get(key).map(|rebid| rebid.due)
    }

    pub fn partition_state(&self, key: &PartitionKey) -> PartitionState {
        if self.table.contains_key(key) {
            PartitionState::Owned
        } else if self.bidding.contains(key) {
            PartitionState::Bidding
        } else {
            PartitionState::Unowned
        }
    }

    /// Every running consumer, sorted by partition.
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        let now = Instant::now();
        let mut consumers: Vec<_> = self
            .table
            .iter()
            .map(|entry| {
                let owned = entry.value();
                let partition = owned.worker.partition();
                ConsumerInfo {
                    partition: entry.key().clone(),
                    destination: partition.destination.name.clone(),
                    routing_key: partition.routing_key.clone(),
                    lease_id: owned.lease_id,
                    owned_for: now.saturating_duration_since(owned.acquired_at),
                    expires_in: owned.deadline().saturating_duration_since(now),
                    worker: owned.worker.snapshot(),
                }
            })
            .collect();
        consumers.sort_by(|a, b| a.partition.cmp(&b.partition));
        consumers
    }

    /// Declare destinations on the broker and start the timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            CoordinatorState::Created as u8,
            CoordinatorState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::Internal(format!(
                "coordinator cannot start while {}",
                CoordinatorState::from_u8(actual)
            )));
        }

        let worker = &self.config.worker;
        if let Err(e) = self
            .registry
            .declare_destinations(self.transport.as_ref(), &worker.exchange_kind, worker.durable)
            .await
        {
            error!(process_id = %self.process_id, error = %e, "Failed to declare destinations");
            self.mark_stopped();
            return Err(e);
        }

        let jitter = self.start_jitter();
        self.spawn_timer(
            Activity::Discovery,
            self.config.discovery_initial_delay + jitter,
            self.config.discovery_interval,
        );
        self.spawn_timer(
            Activity::Rebid,
            self.config.rebid_interval + jitter,
            self.config.rebid_interval,
        );
        self.spawn_timer(
            Activity::Renew,
            self.config.renew_interval + jitter,
            self.config.renew_interval,
        );
        self.spawn_timer(
            Activity::Health,
            self.config.health_check_initial_delay + jitter,
            self.config.health_check_interval,
        );

        info!(
            process_id = %self.process_id,
            partitions = self.registry.enumerate_partitions().len(),
            jitter = ?jitter,
            "Coordinator started"
        );
        Ok(())
    }

    /// Stop every timer and worker. Idempotent; every caller returns only
    /// once shutdown has finished.
    ///
    /// Leases are left to expire unless `release_on_stop` is set.
    pub async fn stop(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match CoordinatorState::from_u8(current) {
                CoordinatorState::Created | CoordinatorState::Running => {}
                CoordinatorState::ShuttingDown | CoordinatorState::Stopped => {
                    self.stopped.cancelled().await;
                    return;
                }
            }
            match self.state.compare_exchange(
                current,
                CoordinatorState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        info!(process_id = %self.process_id, owned = self.table.len(), "Coordinator stopping");

        for entry in self.table.iter() {
            entry.worker.mark_no_restart();
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.rebids.clear();

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(process_id = %self.process_id, grace = ?grace, "Ticks still running after grace period");
        }

        let keys: Vec<PartitionKey> = self.table.iter().map(|e| e.key().clone()).collect();
        let mut closing = JoinSet::new();
        for key in keys {
            if let Some((key, owned)) = self.table.remove(&key) {
                owned.worker.mark_no_restart();
                closing.spawn(async move {
                    owned.worker.close().await;
                    (key, owned.lease_id)
                });
            }
        }

        let closed = tokio::time::timeout(grace, async {
            let mut closed = Vec::new();
            while let Some(joined) = closing.join_next().await {
                match joined {
                    Ok(done) => closed.push(done),
                    Err(e) => error!(error = %e, "Worker close task failed"),
                }
            }
            closed
        })
        .await;

        match closed {
            Ok(closed) if self.config.release_on_stop => {
                for (key, lease_id) in &closed {
                    self.release_lease(key, *lease_id).await;
                }
            }
            Ok(_) => {}
            Err(_) => {
                warn!(process_id = %self.process_id, grace = ?grace, "Workers still closing after grace period")
            }
        }

        self.metrics.set_owned(0);
        self.mark_stopped();
        info!(process_id = %self.process_id, "Coordinator stopped");
    }

    /// Bid for every enumerated partition this process does not own.
    pub async fn discovery_tick(&self) -> TickOutcome {
        let Some(_flight) = self.discovery_flight.try_enter() else {
            return self.skipped(Activity::Discovery);
        };

        let mut report = TickReport::new(Activity::Discovery);
        for partition in self.registry.enumerate_partitions() {
            if !self.accepting() {
                break;
            }
            if self.table.contains_key(&partition.key) {
                continue;
            }
            report.examined += 1;
            let key = partition.key.clone();
            match self.bid(partition).await {
                Ok(true) => report.acquired.push(key),
                Ok(false) => {}
                Err(e) => report.failures.push((key, e.to_string())),
            }
        }

        self.metrics.set_owned(self.table.len());
        self.log_report(&report);
        TickOutcome::Completed(report)
    }

    /// Bid again for every partition whose retry hint has come due.
    pub async fn rebid_tick(&self) -> TickOutcome {
        let Some(_flight) = self.rebid_flight.try_enter() else {
            return self.skipped(Activity::Rebid);
        };

        let mut report = TickReport::new(Activity::Rebid);
        let now = Instant::now();
        let mut due: Vec<Partition> = self
            .rebids
            .iter()
            .filter(|rebid| rebid.due <= now)
            .map(|rebid| rebid.partition.clone())
            .collect();
        due.sort_by(|a, b| a.key.cmp(&b.key));

        for partition in due {
            if !self.accepting() {
                break;
            }
            let key = partition.key.clone();
            // Discovery may have rescheduled it since.
            if self.rebids.remove_if(&key, |_, rebid| rebid.due <= now).is_none() {
                continue;
            }
            if self.table.contains_key(&key) {
                continue;
            }
            report.examined += 1;
            match self.bid(partition).await {
                Ok(true) => report.acquired.push(key),
                Ok(false) => {}
                Err(e) => report.failures.push((key, e.to_string())),
            }
        }

        if report.examined > 0 {
            self.metrics.set_owned(self.table.len());
            self.log_report(&report);
        }
        TickOutcome::Completed(report)
    }

    /// Renew every held lease concurrently; evict whatever could not be renewed.
    pub async fn renew_tick(&self) -> TickOutcome {
        let Some(_flight) = self.renew_flight.try_enter() else {
            return self.skipped(Activity::Renew);
        };

        let mut report = TickReport::new(Activity::Renew);
        let held: Vec<(PartitionKey, OwnedPartition)> = self
            .table
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let weight = self.current_weight();
        let ttl = self.config.lease_ttl;
        let call_timeout = self.config.lease_call_timeout;
        let keep_for = self.keep_for();
        let mut renewals = JoinSet::new();
        for (key, owned) in held {
            if self.shutdown.is_cancelled() {
                break;
            }
            let store = self.store.clone();
            let table = self.table.clone();
            renewals.spawn(async move {
                let sent_at = Instant::now();
                let renewed =
                    with_timeout(call_timeout, store.renew(&key, owned.lease_id, weight, ttl)).await;
                // Evicted in the same step that saw the refusal, so the entry
                // never outlives the lease.
                let evicted = match renewed {
                    Ok(true) => {
                        owned.extend(sent_at + keep_for);
                        None
                    }
                    _ => disown(&table, &key, owned.lease_id),
                };
                (key, owned.lease_id, renewed, evicted)
            });
        }

        let mut closing = Vec::new();
        while let Some(joined) = renewals.join_next().await {
            let (key, lease_id, renewed, evicted) = match joined {
                Ok(renewal) => renewal,
                Err(e) => {
                    error!(error = %e, "Renewal task failed");
                    continue;
                }
            };
            report.examined += 1;
            self.metrics.record_renewal(matches!(renewed, Ok(true)));

            match renewed {
                Ok(true) => continue,
                Ok(false) => {
                    info!(process_id = %self.process_id, partition = %key, lease_id = %lease_id, "Lease lost");
                }
                Err(e) => {
                    self.log_failure(&key, &e, "Renewal failed, giving up partition");
                    report.failures.push((key.clone(), e.to_string()));
                }
            }

            if let Some(owned) = evicted {
                self.metrics.leases_lost.inc();
                report.lost.push(key);
                closing.push(owned.worker);
            }
        }
        close_workers(closing).await;

        report.lost.sort();
        report.failures.sort();
        self.metrics.set_owned(self.table.len());
        self.log_report(&report);
        TickOutcome::Completed(report)
    }

    /// Probe every worker concurrently; retire the ones that keep failing.
    pub async fn health_tick(&self) -> TickOutcome {
        let Some(_flight) = self.health_flight.try_enter() else {
            return self.skipped(Activity::Health);
        };

        let mut report = TickReport::new(Activity::Health);
        let timeout = self.config.health_check_timeout;
        let mut probes = JoinSet::new();
        for entry in self.table.iter() {
            let key = entry.key().clone();
            let owned = entry.value().clone();
            probes.spawn(async move {
                let health = match tokio::time::timeout(timeout, owned.worker.health_check()).await {
                    Ok(health) => health,
                    Err(_) => {
                        owned.worker.record_failed_probe();
                        WorkerHealth::unhealthy(format!("health check timed out after {:?}", timeout))
                    }
                };
                (key, owned, health)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (key, owned, health) = match joined {
                Ok(probe) => probe,
                Err(e) => {
                    error!(error = %e, "Health probe task failed");
                    continue;
                }
            };
            report.examined += 1;

            match health {
                WorkerHealth::Healthy | WorkerHealth::Stopped => {}
                WorkerHealth::Recovered => report.recovered.push(key),
                WorkerHealth::Unhealthy { reason } => {
                    self.metrics.health_failures.inc();
                    let streak = owned.worker.failed_probes();
                    warn!(
                        process_id = %self.process_id,
                        partition = %key,
                        streak,
                        reason = %reason,
                        "Worker unhealthy"
                    );
                    report.failures.push((key.clone(), reason));

                    if streak >= self.config.max_recovery_attempts
                        && self.accepting()
                        && self.evict(&key, owned.lease_id).await.is_some()
                    {
                        self.release_lease(&key, owned.lease_id).await;
                        self.metrics.workers_retired.inc();
                        warn!(process_id = %self.process_id, partition = %key, "Worker retired, partition released");
                        report.retired.push(key);
                    }
                }
            }
        }

        report.recovered.sort();
        report.retired.sort();
        self.log_report(&report);
        TickOutcome::Completed(report)
    }

    fn accepting(&self) -> bool {
        matches!(
            self.state(),
            CoordinatorState::Created | CoordinatorState::Running
        )
    }

    fn mark_stopped(&self) {
        self.state
            .store(CoordinatorState::Stopped as u8, Ordering::Release);
        self.stopped.cancel();
    }

    /// How long past the send time of a successful call a lease is trusted.
    fn keep_for(&self) -> Duration {
        self.config.lease_ttl.saturating_sub(self.config.expiry_margin)
    }

    fn start_jitter(&self) -> Duration {
        let max = self.config.start_jitter;
        if max.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..=max)
        }
    }

    fn spawn_timer(self: &Arc<Self>, activity: Activity, delay: Duration, period: Duration) {
        let coordinator = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(activity = activity.as_str(), "Timer stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        // Each tick is its own task so a panic stays at its
                        // JoinHandle; the single-flight guard is released
                        // during unwinding.
                        tracker.spawn(async move {
                            let tick = tokio::spawn(async move {
                                coordinator.run_tick(activity).await;
                            });
                            if let Err(e) = tick.await {
                                error!(activity = activity.as_str(), error = %e, "Tick task failed");
                            }
                        });
                    }
                }
            }
        });
    }

    /// Give the partition up once its local deadline passes without renewal.
    fn watch_deadline(&self, key: PartitionKey, owned: OwnedPartition) {
        let table = self.table.clone();
        let metrics = self.metrics.clone();
        let process_id = self.process_id;

        self.tracker.spawn(async move {
            loop {
                let deadline = owned.deadline();
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = owned.watchdog.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            if let Some(expired) = disown(&table, &key, owned.lease_id) {
                metrics.leases_lost.inc();
                metrics.set_owned(table.len());
                warn!(
                    process_id = %process_id,
                    partition = %key,
                    lease_id = %owned.lease_id,
                    "Lease deadline passed without renewal, giving up partition"
                );
                expired.worker.close().await;
            }
        });
    }

    async fn run_tick(&self, activity: Activity) -> TickOutcome {
        match activity {
            Activity::Discovery => self.discovery_tick().await,
            Activity::Rebid => self.rebid_tick().await,
            Activity::Renew => self.renew_tick().await,
            Activity::Health => self.health_tick().await,
        }
    }

    fn skipped(&self, activity: Activity) -> TickOutcome {
        self.metrics.record_skipped(activity.as_str());
        debug!(
            process_id = %self.process_id,
            activity = activity.as_str(),
            "Tick skipped, previous one still running"
        );
        TickOutcome::Skipped
    }

    /// Place one bid. `Ok(true)` means the partition is now owned.
    async fn bid(&self, partition: Partition) -> Result<bool> {
        let key = partition.key.clone();
        let Some(_bidding) = BiddingMark::try_new(&self.bidding, key.clone()) else {
            return Ok(false);
        };
        let weight = self.current_weight();
        let sent_at = Instant::now();

        let outcome = self
            .lease_call(self.store.acquire(
                &key,
                Bid::new(self.process_id, weight),
                self.config.lease_ttl,
            ))
            .await;

        match outcome {
            Ok(AcquireOutcome::Granted { lease_id, .. }) => {
                self.rebids.remove(&key);
                self.metrics.record_bid(Some(true));
                self.take_ownership(partition, lease_id, weight, sent_at).await
            }
            Ok(AcquireOutcome::Denied { retry_after }) => {
                self.metrics.record_bid(Some(false));
                debug!(partition = %key, weight, retry_after = ?retry_after, "Bid denied");
                if self.accepting() {
                    self.rebids.insert(
                        key,
                        Rebid {
                            due: Instant::now() + retry_after,
                            partition,
                        },
                    );
                }
                Ok(false)
            }
            Err(e) => {
                self.metrics.record_bid(None);
                self.log_failure(&key, &e, "Bid failed");
                Err(e)
            }
        }
    }

    async fn take_ownership(
        &self,
        partition: Partition,
        lease_id: LeaseId,
        weight: Weight,
        sent_at: Instant,
    ) -> Result<bool> {
        let key = partition.key.clone();
        if !self.accepting() {
            info!(partition = %key, lease_id = %lease_id, "Lease granted during shutdown, releasing");
            self.release_lease(&key, lease_id).await;
            return Ok(false);
        }

        let worker = Arc::new(PartitionWorker::new(
            partition,
            self.transport.clone(),
            self.handler.clone(),
            self.config.worker.clone(),
        ));
        if let Err(e) = worker.start().await {
            self.metrics.worker_start_failures.inc();
            warn!(partition = %key, error = %e, "Worker failed to start, releasing lease");
            self.release_lease(&key, lease_id).await;
            return Err(e);
        }

        let owned = OwnedPartition::new(
            lease_id,
            worker.clone(),
            sent_at + self.keep_for(),
            self.shutdown.child_token(),
        );
        self.table.insert(key.clone(), owned.clone());

        // stop() may have drained the table while the worker was starting.
        if !self.accepting() {
            if disown(&self.table, &key, lease_id).is_some() {
                worker.close().await;
                self.release_lease(&key, lease_id).await;
            }
            return Ok(false);
        }
        self.watch_deadline(key.clone(), owned);

        self.metrics.workers_started.inc();
        info!(
            process_id = %self.process_id,
            partition = %key,
            lease_id = %lease_id,
            weight,
            owned = self.table.len(),
            "Partition acquired"
        );
        Ok(true)
    }

    /// Remove `key` if it still carries `lease_id`, then close its worker.
    async fn evict(&self, key: &PartitionKey, lease_id: LeaseId) -> Option<OwnedPartition> {
        let owned = disown(&self.table, key, lease_id)?;
        owned.worker.close().await;
        self.metrics.set_owned(self.table.len());
        Some(owned)
    }

    async fn release_lease(&self, key: &PartitionKey, lease_id: LeaseId) {
        match self.lease_call(self.store.release(key, lease_id)).await {
            Ok(released) => debug!(partition = %key, released, "Lease released"),
            Err(e) => warn!(partition = %key, error = %e, "Lease release failed, leaving it to expire"),
        }
    }

    async fn lease_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.config.lease_call_timeout, call).await
    }

    /// Transient failures are retried by a later tick; anything else points
    /// at a bug or misconfiguration.
    fn log_failure(&self, key: &PartitionKey, error: &Error, message: &str) {
        if error.is_transient() {
            warn!(process_id = %self.process_id, partition = %key, error = %error, "{}", message);
        } else {
            error!(process_id = %self.process_id, partition = %key, error = %error, "{}", message);
        }
    }

    fn log_report(&self, report: &TickReport) {
        if report.is_eventful() {
            info!(
                process_id = %self.process_id,
                activity = report.activity.as_str(),
                examined = report.examined,
                acquired = report.acquired.len(),
                lost = report.lost.len(),
                recovered = report.recovered.len(),
                retired = report.retired.len(),
                failures = report.failures.len(),
                owned = self.table.len(),
                "Tick completed"
            );
        } else {
            debug!(
                process_id = %self.process_id,
                activity = report.activity.as_str(),
                examined = report.examined,
                owned = self.table.len(),
                "Tick completed"
            );
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .field("owned", &self.table.len())
            .field("weight", &self.current_weight())
            .finish()
    }
}

#[cfg(test)]
mod tests;
