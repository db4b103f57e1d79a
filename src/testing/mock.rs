//! In-memory collaborators for tests: a broker, a handler and a lease store
//! with injectable faults.

use crate::error::{LeaseError, Result, TransportError};
use crate::lease::LeaseStore;
use crate::registry::Partition;
use crate::transport::{BrokerChannel, BrokerTransport, Delivery, HandlerError, MessageHandler};
use crate::types::{AcquireOutcome, Bid, LeaseId, LeaseInfo, PartitionKey, Weight};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Queue {
    messages: Mutex<VecDeque<Delivery>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, delivery: Delivery) {
        self.messages.lock().push_back(delivery);
        self.notify.notify_waiters();
    }

    async fn pop(&self) -> Delivery {
        loop {
            let notified = self.notify.notified();
            let next = self.messages.lock().pop_front();
            if let Some(delivery) = next {
                return delivery;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: DashMap<String, Arc<Queue>>,
    unavailable: AtomicBool,
    open_delay: Mutex<Duration>,
    next_tag: AtomicU64,
    next_channel: AtomicU64,
    opened: AtomicUsize,
    close_calls: AtomicUsize,
    /// Kill switches of channels that have not been closed.
    live: DashMap<u64, CancellationToken>,
    subscriptions: DashMap<String, usize>,
    acked: Mutex<Vec<(String, u64)>>,
    nacked: Mutex<Vec<(String, u64, bool)>>,
    prefetches: Mutex<Vec<u16>>,
    declared: Mutex<Vec<(String, String, bool)>>,
}

impl BrokerState {
    fn queue(&self, routing_key: &str) -> Arc<Queue> {
        self.queues
            .entry(routing_key.to_string())
            .or_default()
            .clone()
    }
}

/// In-memory broker. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<BrokerState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message on `routing_key`. Returns its delivery tag.
    pub fn push(&self, routing_key: &str, payload: impl Into<Bytes>) -> u64 {
        let tag = self.state.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.state
            .queue(routing_key)
            .push(Delivery::new(tag, routing_key, payload));
        tag
    }

    /// Make `open_channel` fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Latency added before every `open_channel`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = delay;
    }

    /// Break every open channel, as if the connection dropped.
    pub fn kill_channels(&self) {
        self.state.live.retain(|_, kill| {
            kill.cancel();
            false
        });
    }

    pub fn opened_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Total `close` calls across all channels.
    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Channels currently subscribed to `routing_key` and not yet closed.
    pub fn consumers_on(&self, routing_key: &str) -> usize {
        self.state
            .subscriptions
            .get(routing_key)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Messages waiting on `routing_key`.
    pub fn pending(&self, routing_key: &str) -> usize {
        self.state.queue(routing_key).len()
    }

    pub fn acked(&self) -> Vec<(String, u64)> {
        self.state.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(String, u64, bool)> {
        self.state.nacked.lock().clone()
    }

    /// Every prefetch value applied, in order.
    pub fn prefetch_history(&self) -> Vec<u16> {
        self.state.prefetches.lock().clone()
    }

    /// Declared destinations as `(name, kind, durable)`.
    pub fn declared(&self) -> Vec<(String, String, bool)> {
        self.state.declared.lock().clone()
    }
}

#[async_trait::async_trait]
impl BrokerTransport for MockTransport {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let delay = *self.state.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("mock broker unavailable".to_string()).into());
        }
        let id = self.state.next_channel.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        self.state.live.insert(id, kill.clone());
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            id,
            state: self.state.clone(),
            kill,
            open: true,
            subscription: None,
            auto_ack: false,
            unacked: HashMap::new(),
        }))
    }
}

/// Channel handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockChannel {
    id: u64,
    state: Arc<BrokerState>,
    kill: CancellationToken,
    open: bool,
    subscription: Option<(String, Arc<Queue>)>,
    auto_ack: bool,
    /// Delivered but not yet settled; requeued when the channel closes.
    unacked: HashMap<u64, Delivery>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed.into())
        }
    }

    fn routing_key(&self) -> String {
        self.subscription
            .as_ref()
            .map(|(rk, _)| rk.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_destination(&mut self, name: &str, kind: &str, durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.state
            .declared
            .lock()
            .push((name.to_string(), kind.to_string(), durable));
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.state.prefetches.lock().push(count);
        Ok(())
    }

    async fn consume(&mut self, _destination: &str, routing_key: &str, auto_ack: bool) -> Result<()> {
        self.ensure_open()?;
        if self.subscription.is_some() {
            return Err(TransportError::Protocol("channel already consuming".to_string()).into());
        }
        *self
            .state
            .subscriptions
            .entry(routing_key.to_string())
            .or_insert(0) += 1;
        self.subscription = Some((routing_key.to_string(), self.state.queue(routing_key)));
        self.auto_ack = auto_ack;
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        let Some((_, queue)) = self.subscription.clone() else {
            return Err(TransportError::Protocol("channel is not consuming".to_string()).into());
        };
        let delivery = tokio::select! {
            _ = self.kill.cancelled() => None,
            delivery = queue.pop() => Some(delivery),
        };
        let Some(delivery) = delivery else {
            return Err(TransportError::ChannelClosed.into());
        };
        if !self.auto_ack {
            self.unacked.insert(delivery.delivery_tag, delivery.clone());
        }
        Ok(Some(delivery))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.unacked.remove(&delivery_tag);
        let routing_key = self.routing_key();
        self.state.acked.lock().push((routing_key, delivery_tag));
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let routing_key = self.routing_key();
        self.state
            .nacked
            .lock()
            .push((routing_key, delivery_tag, requeue));
        if let Some(mut delivery) = self.unacked.remove(&delivery_tag) {
            if requeue {
                delivery.redelivered = true;
                if let Some((_, queue)) = &self.subscription {
                    queue.push(delivery);
                }
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && !self.kill.is_cancelled()
    }

    async fn close(&mut self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            return;
        }
        self.open = false;
        self.state.live.remove(&self.id);
        if let Some((routing_key, queue)) = self.subscription.take() {
            if let Some(mut count) = self.state.subscriptions.get_mut(&routing_key) {
                *count = count.saturating_sub(1);
            }
            for (_, mut delivery) in self.unacked.drain() {
                delivery.redelivered = true;
                queue.push(delivery);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HandlerState {
    started: AtomicUsize,
    handled: Mutex<Vec<(PartitionKey, u64)>>,
    failures: AtomicUsize,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    delay: Mutex<Duration>,
}

/// Handler whose outcome is scripted by the test. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHandler {
    state: Arc<HandlerState>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.state.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Time each delivery takes.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Deliveries the handler has begun.
    pub fn started_count(&self) -> usize {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Deliveries the handler has finished, successfully or not.
    pub fn handled_count(&self) -> usize {
        self.state.handled.lock().len()
    }

    pub fn failure_count(&self) -> usize {
        self.state.failures.load(Ordering::SeqCst)
    }

    /// `(partition, delivery_tag)` in completion order.
    pub fn handled(&self) -> Vec<(PartitionKey, u64)> {
        self.state.handled.lock().clone()
    }

    fn should_fail(&self) -> bool {
        if self.state.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(
        &self,
        partition: &Partition,
        delivery: &Delivery,
    ) -> std::result::Result<(), HandlerError> {
        self.state.started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail = self.should_fail();
        self.state
            .handled
            .lock()
            .push((partition.key.clone(), delivery.delivery_tag));
        if fail {
            self.state.failures.fetch_add(1, Ordering::SeqCst);
            return Err(HandlerError::new(format!(
                "scripted failure for tag {}",
                delivery.delivery_tag
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// Wraps a [`LeaseStore`] with latency and failure injection.
#[derive(Debug)]
pub struct FaultyLeaseStore {
    inner: Arc<dyn LeaseStore>,
    delay: Mutex<Duration>,
    unavailable: AtomicBool,
    failing_renewals: DashSet<PartitionKey>,
    acquire_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Tracks one in-flight call, even if the caller drops it on timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FaultyLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            delay: Mutex::new(Duration::ZERO),
            unavailable: AtomicBool::new(false),
            failing_renewals: DashSet::new(),
            acquire_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Latency added before every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Fail every call with `LeaseError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make renewals of `partition` error until restored.
    pub fn fail_renewals_for(&self, partition: &PartitionKey) {
        self.failing_renewals.insert(partition.clone());
    }

    pub fn restore_renewals_for(&self, partition: &PartitionKey) {
        self.failing_renewals.remove(partition);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<InFlight<'_>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable("injected outage".to_string()).into());
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl LeaseStore for FaultyLeaseStore {
    async fn acquire(&self, partition: &PartitionKey, bid: Bid, ttl: Duration) -> Result<AcquireOutcome> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await?;
        self.inner.acquire(partition, bid, ttl).await
    }

    async fn renew(
        &self,
        partition: &PartitionKey,
        lease_id: LeaseId,
        weight: Weight,
        ttl: Duration,
    ) -> Result<bool> {
        let _guard = self.enter().await?;
        if self.failing_renewals.contains(partition) {
            return Err(LeaseError::Unavailable(format!("injected renewal failure for {}", partition)).into());
        }
        self.inner.renew(partition, lease_id, weight, ttl).await
    }

    async fn release(&self, partition: &PartitionKey, lease_id: LeaseId) -> Result<bool> {
        let _guard = self.enter().await?;
        self.inner.release(partition, lease_id).await
    }

    async fn holder(&self, partition: &PartitionKey) -> Result<Option<LeaseInfo>> {
        self.inner.holder(partition).await
    }
}
