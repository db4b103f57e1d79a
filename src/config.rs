//! Configuration types for the coordinator, workers and lease store.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default weight ceiling; an upper bound on the expected competitor count.
pub const DEFAULT_MAX_COMPETITORS: u64 = 100_000;

/// Configuration for a per-process [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between discovery/bid ticks.
    pub discovery_interval: Duration,

    /// Delay before the first discovery tick.
    pub discovery_initial_delay: Duration,

    /// Interval between lease renewal ticks.
    pub renew_interval: Duration,

    /// Lease time-to-live requested on acquire and renew.
    pub lease_ttl: Duration,

    /// Interval between worker health check ticks.
    pub health_check_interval: Duration,

    /// Delay before the first health check tick.
    pub health_check_initial_delay: Duration,

    /// Interval between checks for denied bids whose retry hint has come due.
    pub rebid_interval: Duration,

    /// Subtracted from the lease TTL to get the local deadline. A lease not
    /// renewed by its deadline is given up without waiting for the store.
    pub expiry_margin: Duration,

    /// Weight ceiling; bids use `max_competitors - owned_count`.
    pub max_competitors: u64,

    /// Upper bound for a single acquire/renew/release call.
    pub lease_call_timeout: Duration,

    /// Upper bound for a single worker health probe.
    pub health_check_timeout: Duration,

    /// Consecutive failed recoveries before a worker is retired.
    pub max_recovery_attempts: u32,

    /// Upper bound for shutdown (in-flight ticks plus worker close).
    pub shutdown_grace: Duration,

    /// Explicitly release leases on stop instead of letting them expire.
    pub release_on_stop: bool,

    /// Maximum random jitter added to the initial delays.
    pub start_jitter: Duration,

    /// Worker configuration applied to every partition consumer.
    pub worker: WorkerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(120),
            discovery_initial_delay: Duration::from_secs(1),
            renew_interval: Duration::from_secs(20),
            lease_ttl: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            health_check_initial_delay: Duration::from_secs(5),
            rebid_interval: Duration::from_secs(1),
            expiry_margin: Duration::from_secs(5),
            max_competitors: DEFAULT_MAX_COMPETITORS,
            lease_call_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(5),
            max_recovery_attempts: 3,
            shutdown_grace: Duration::from_secs(10),
            release_on_stop: false,
            start_jitter: Duration::ZERO,
            worker: WorkerConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the discovery interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set the delay before the first discovery tick.
    pub fn with_discovery_initial_delay(mut self, delay: Duration) -> Self {
        self.discovery_initial_delay = delay;
        self
    }

    /// Set the renew interval.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Set the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the re-bid check interval.
    pub fn with_rebid_interval(mut self, interval: Duration) -> Self {
        self.rebid_interval = interval;
        self
    }

    /// Set the local expiry margin.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Set the weight ceiling.
    pub fn with_max_competitors(mut self, max: u64) -> Self {
        self.max_competitors = max;
        self
    }

    /// Set the lease call timeout.
    pub fn with_lease_call_timeout(mut self, timeout: Duration) -> Self {
        self.lease_call_timeout = timeout;
        self
    }

    /// Set the health probe timeout.
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set how many failed recoveries retire a worker.
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Release leases explicitly on stop.
    pub fn with_release_on_stop(mut self, enabled: bool) -> Self {
        self.release_on_stop = enabled;
        self
    }

    /// Set the initial-delay jitter.
    pub fn with_start_jitter(mut self, jitter: Duration) -> Self {
        self.start_jitter = jitter;
        self
    }

    /// Set the worker configuration.
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Check the timing relationships the protocol depends on.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(Error::Config("lease_ttl must be non-zero".to_string()));
        }
        if self.renew_interval >= self.lease_ttl {
            return Err(Error::Config(format!(
                "renew_interval ({:?}) must be shorter than lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.renew_interval + self.expiry_margin >= self.lease_ttl {
            return Err(Error::Config(format!(
                "renew_interval ({:?}) plus expiry_margin ({:?}) must be shorter than lease_ttl ({:?})",
                self.renew_interval, self.expiry_margin, self.lease_ttl
            )));
        }
        if self.discovery_interval.is_zero()
            || self.health_check_interval.is_zero()
            || self.rebid_interval.is_zero()
        {
            return Err(Error::Config("tick intervals must be non-zero".to_string()));
        }
        if self.lease_call_timeout >= self.lease_ttl {
            return Err(Error::Config(
                "lease_call_timeout must be shorter than lease_ttl".to_string(),
            ));
        }
        if self.max_competitors == 0 {
            return Err(Error::Config("max_competitors must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration for partition workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound for draining the in-flight delivery on close.
    pub close_timeout: Duration,

    /// Exchange kind used when declaring destinations.
    pub exchange_kind: String,

    /// Whether declared destinations are durable.
    pub durable: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(5),
            exchange_kind: "direct".to_string(),
            durable: true,
        }
    }
}

impl WorkerConfig {
    /// Set the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Configuration for the in-memory lease store.
#[derive(Debug, Clone)]
pub struct LeaseStoreConfig {
    /// How long a denied bid stays pending.
    pub bid_ttl: Duration,

    /// Suggested retry delay after losing a contested free partition.
    pub contention_backoff: Duration,

    /// Weight advantage a pending bid needs over the holder to take the
    /// lease on the holder's next renewal. `None` disables handover.
    pub preemption_margin: Option<u64>,

    /// Minimum time between two leases taken from the same holder. Also how
    /// recently a bidder must have called to be handed a lease.
    pub preemption_cooldown: Duration,

    /// Retry hint given to a bidder that is strong enough to take a live
    /// lease at the holder's next renewal.
    pub preemption_retry: Duration,
}

impl Default for LeaseStoreConfig {
    fn default() -> Self {
        Self {
            bid_ttl: Duration::from_secs(180),
            contention_backoff: Duration::from_secs(1),
            preemption_margin: Some(2),
            preemption_cooldown: Duration::from_secs(15),
            preemption_retry: Duration::from_secs(5),
        }
    }
}

impl LeaseStoreConfig {
    /// Set the pending bid lifetime.
    pub fn with_bid_ttl(mut self, ttl: Duration) -> Self {
        self.bid_ttl = ttl;
        self
    }

    /// Set the contention backoff.
    pub fn with_contention_backoff(mut self, backoff: Duration) -> Self {
        self.contention_backoff = backoff;
        self
    }

    /// Set or disable the preemption margin.
    pub fn with_preemption_margin(mut self, margin: Option<u64>) -> Self {
        self.preemption_margin = margin;
        self
    }

    /// Set the per-holder preemption cooldown.
    pub fn with_preemption_cooldown(mut self, cooldown: Duration) -> Self {
        self.preemption_cooldown = cooldown;
        self
    }

    /// Set the retry hint for bidders waiting on a handover.
    pub fn with_preemption_retry(mut self, retry: Duration) -> Self {
        self.preemption_retry = retry;
        self
    }
}
