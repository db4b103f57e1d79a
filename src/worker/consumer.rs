//! The per-partition consumer.

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::registry::Partition;
use crate::transport::{BrokerChannel, BrokerTransport, Delivery, MessageHandler};
use crate::types::PartitionKey;
use crate::worker::flow_credit::FlowCredit;
use crate::worker::health::WorkerHealth;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`PartitionWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Constructed, not yet subscribed.
    Created = 0,
    /// Consume loop running.
    Running = 1,
    /// Consume loop died; waiting for the next health probe.
    Unhealthy = 2,
    /// `close` in progress.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Unhealthy,
            3 => WorkerState::Closing,
            _ => WorkerState::Closed,
        }
    }

    /// Whether the worker is shutting down or gone.
    pub fn is_terminating(&self) -> bool {
        matches!(self, WorkerState::Closing | WorkerState::Closed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Created => write!(f, "created"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Unhealthy => write!(f, "unhealthy"),
            WorkerState::Closing => write!(f, "closing"),
            WorkerState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub flow_credit: u16,
    pub processed: u64,
    pub failed: u64,
    pub restarts: u64,
    pub no_restart: bool,
}

#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
}

#[derive(Debug)]
enum ExitReason {
    Cancelled,
    Ended,
    Failed(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Cancelled => write!(f, "cancelled"),
            ExitReason::Ended => write!(f, "subscription ended"),
            ExitReason::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// What a finished consume loop hands back: the channel it owned.
struct ConsumeExit {
    channel: Box<dyn BrokerChannel>,
    reason: ExitReason,
}

/// State shared with the spawned consume loop.
struct ConsumeContext {
    partition: Partition,
    handler: Arc<dyn MessageHandler>,
    credit: Arc<FlowCredit>,
    stats: Arc<WorkerStats>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl ConsumeContext {
    async fn run(self, mut channel: Box<dyn BrokerChannel>) -> ConsumeExit {
        loop {
            // Cancellation is only observed between deliveries, so an
            // in-flight delivery always reaches ack/nack.
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = channel.next_delivery() => Some(next),
            };

            let reason = match next {
                None => ExitReason::Cancelled,
                Some(Ok(Some(delivery))) => match self.process(channel.as_mut(), delivery).await {
                    Ok(()) => continue,
                    Err(e) => ExitReason::Failed(e.to_string()),
                },
                Some(Ok(None)) => ExitReason::Ended,
                Some(Err(e)) => ExitReason::Failed(e.to_string()),
            };

            if !matches!(reason, ExitReason::Cancelled) {
                let _ = self.state.compare_exchange(
                    WorkerState::Running as u8,
                    WorkerState::Unhealthy as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                warn!(
                    partition = %self.partition.key,
                    reason = %reason,
                    "Consume loop stopped"
                );
            }
            return ConsumeExit { channel, reason };
        }
    }

    async fn process(&self, channel: &mut dyn BrokerChannel, delivery: Delivery) -> Result<()> {
        let destination = &self.partition.destination;
        let tag = delivery.delivery_tag;

        match self.handler.handle(&self.partition, &delivery).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if !destination.auto_acknowledge {
                    channel.ack(tag).await?;
                }
                if let Some(credit) = self.credit.record_success() {
                    channel.set_prefetch(credit).await?;
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = %self.partition.key,
                    delivery_tag = tag,
                    requeue = destination.requeue_on_failure,
                    error = %e,
                    "Handler failed"
                );
                if !destination.auto_acknowledge {
                    channel.nack(tag, destination.requeue_on_failure).await?;
                }
                if let Some(credit) = self.credit.record_failure() {
                    channel.set_prefetch(credit).await?;
                }
            }
        }
        Ok(())
    }
}

/// Consumes one owned partition.
///
/// The owning coordinator creates a worker after winning the partition's
/// lease and closes it when the lease is lost or the process stops. The
/// worker never touches the lease itself.
///
/// ```text
///   Created ──start──► Running ◄──health_check (recover)──┐
///                         │                                │
///                         └──channel error──► Unhealthy ───┘
///                                                │
///   any ────────────────close──► Closing ──► Closed
/// ```
pub struct PartitionWorker {
    partition: Partition,
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<dyn MessageHandler>,
    config: WorkerConfig,
    state: Arc<AtomicU8>,
    no_restart: AtomicBool,
    credit: Arc<FlowCredit>,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
    /// Running consume loop. The lock also serializes start, recovery and close.
    consumer: tokio::sync::Mutex<Option<JoinHandle<ConsumeExit>>>,
    /// Consecutive probes that left the worker unable to consume.
    failed_probes: AtomicU32,
}

impl PartitionWorker {
    /// Create a worker for `partition`. Nothing happens until [`start`](Self::start).
    pub fn new(
        partition: Partition,
        transport: Arc<dyn BrokerTransport>,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
    ) -> Self {
        let credit = Arc::new(FlowCredit::for_destination(&partition.destination));
        Self {
            partition,
            transport,
            handler,
            config,
            state: Arc::new(AtomicU8::new(WorkerState::Created as u8)),
            no_restart: AtomicBool::new(false),
            credit,
            stats: Arc::new(WorkerStats::default()),
            cancel: CancellationToken::new(),
            consumer: tokio::sync::Mutex::new(None),
            failed_probes: AtomicU32::new(0),
        }
    }

    /// The partition this worker consumes.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// The partition key.
    pub fn key(&self) -> &PartitionKey {
        &self.partition.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current flow credit.
    pub fn flow_credit(&self) -> u16 {
        self.credit.current()
    }

    /// Consecutive unhealthy probes, reset by any healthy one.
    pub fn failed_probes(&self) -> u32 {
        self.failed_probes.load(Ordering::Relaxed)
    }

    /// Count a probe that never returned. Returns the new streak.
    pub fn record_failed_probe(&self) -> u32 {
        self.failed_probes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Forbid any further local restart. One-shot.
    pub fn mark_no_restart(&self) {
        self.no_restart.store(true, Ordering::Release);
    }

    pub fn is_no_restart(&self) -> bool {
        self.no_restart.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            state: self.state(),
            flow_credit: self.credit.current(),
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            restarts: self.stats.restarts.load(Ordering::Relaxed),
            no_restart: self.is_no_restart(),
        }
    }

    /// Subscribe to the partition and spawn the consume loop.
    pub async fn start(&self) -> Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            WorkerState::Created as u8,
            WorkerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            let key = self.partition.key.to_string();
            return Err(if WorkerState::from_u8(actual).is_terminating() {
                WorkerError::Closed(key).into()
            } else {
                WorkerError::AlreadyStarted(key).into()
            });
        }

        let mut consumer = self.consumer.lock().await;
        match self.subscribe().await {
            Ok(handle) => {
                *consumer = Some(handle);
                info!(
                    partition = %self.partition.key,
                    routing_key = %self.partition.routing_key,
                    prefetch = self.credit.current(),
                    "Worker started"
                );
                Ok(())
            }
            Err(e) => {
                self.state.store(WorkerState::Closed as u8, Ordering::Release);
                warn!(partition = %self.partition.key, error = %e, "Worker failed to start");
                Err(WorkerError::StartFailed {
                    partition: self.partition.key.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Probe the consume loop, recovering it locally if it died.
    pub async fn health_check(&self) -> WorkerHealth {
        if self.state().is_terminating() {
            return WorkerHealth::Stopped;
        }

        let mut consumer = self.consumer.lock().await;
        match self.state() {
            WorkerState::Created => return WorkerHealth::unhealthy("not started"),
            WorkerState::Closing | WorkerState::Closed => return WorkerHealth::Stopped,
            WorkerState::Running | WorkerState::Unhealthy => {}
        }

        if consumer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            self.failed_probes.store(0, Ordering::Relaxed);
            return WorkerHealth::Healthy;
        }

        let reason = match consumer.take() {
            Some(handle) => match handle.await {
                Ok(mut exit) => {
                    exit.channel.close().await;
                    exit.reason.to_string()
                }
                Err(e) => format!("consume task failed: {}", e),
            },
            None => "consumer not running".to_string(),
        };
        let _ = self.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Unhealthy as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if self.is_no_restart() {
            debug!(partition = %self.partition.key, reason = %reason, "Restart suppressed");
            return WorkerHealth::Stopped;
        }

        match self.subscribe().await {
            Ok(handle) => {
                *consumer = Some(handle);
                let _ = self.state.compare_exchange(
                    WorkerState::Unhealthy as u8,
                    WorkerState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                self.failed_probes.store(0, Ordering::Relaxed);
                info!(partition = %self.partition.key, reason = %reason, "Worker recovered");
                WorkerHealth::Recovered
            }
            Err(e) => {
                let failures = self.record_failed_probe();
                warn!(
                    partition = %self.partition.key,
                    failures,
                    error = %e,
                    "Worker recovery failed"
                );
                WorkerHealth::unhealthy(format!("{}; recovery failed: {}", reason, e))
            }
        }
    }

    /// Stop consuming and close the channel. Idempotent.
    pub async fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if WorkerState::from_u8(current).is_terminating() {
                return;
            }
            match self.state.compare_exchange(
                current,
                WorkerState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.mark_no_restart();
        self.cancel.cancel();

        let handle = self.consumer.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.config.close_timeout, &mut handle).await {
                Ok(Ok(mut exit)) => exit.channel.close().await,
                Ok(Err(e)) => warn!(partition = %self.partition.key, error = %e, "Consume task failed"),
                Err(_) => {
                    warn!(
                        partition = %self.partition.key,
                        timeout = ?self.config.close_timeout,
                        "Consume loop did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        self.state.store(WorkerState::Closed as u8, Ordering::Release);
        info!(partition = %self.partition.key, "Worker closed");
    }

    async fn subscribe(&self) -> Result<JoinHandle<ConsumeExit>> {
        let mut channel = self.transport.open_channel().await?;
        self.credit.reset();
        if let Err(e) = self.prepare(channel.as_mut()).await {
            channel.close().await;
            return Err(e);
        }

        let context = ConsumeContext {
            partition: self.partition.clone(),
            handler: self.handler.clone(),
            credit: self.credit.clone(),
            stats: self.stats.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        };
        Ok(tokio::spawn(context.run(channel)))
    }

    async fn prepare(&self, channel: &mut dyn BrokerChannel) -> Result<()> {
        let destination = &self.partition.destination;
        channel.set_prefetch(self.credit.current()).await?;
        channel
            .consume(
                &destination.name,
                &self.partition.routing_key,
                destination.auto_acknowledge,
            )
            .await
    }
}

impl Drop for PartitionWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PartitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWorker")
            .field("partition", &self.partition.key)
            .field("state", &self.state())
            .field("flow_credit", &self.credit.current())
            .field("no_restart", &self.is_no_restart())
            .finish()
    }
}
