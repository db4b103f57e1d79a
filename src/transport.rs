//! Contracts for the broker transport and the message handler.
//!
//! The crate never talks to a broker directly. A deployment plugs in a
//! [`BrokerTransport`] (connection and channel management) and a
//! [`MessageHandler`] (what to do with each delivery); workers drive both.

use crate::error::Result;
use crate::registry::Partition;
use bytes::Bytes;
use thiserror::Error;

/// A message pulled from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used for ack/nack.
    pub delivery_tag: u64,
    /// Routing key the message arrived on.
    pub routing_key: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Message body.
    pub payload: Bytes,
}

impl Delivery {
    /// Create a first-time delivery.
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered: false,
            payload: payload.into(),
        }
    }
}

/// Opens channels to the broker.
#[async_trait::async_trait]
pub trait BrokerTransport: Send + Sync + std::fmt::Debug {
    /// Open a fresh channel.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;
}

/// A single broker channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + std::fmt::Debug {
    /// Declare a destination (exchange).
    async fn declare_destination(&mut self, name: &str, kind: &str, durable: bool) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&mut self, count: u16) -> Result<()>;

    /// Subscribe to the queue bound to `routing_key` on `destination`.
    async fn consume(&mut self, destination: &str, routing_key: &str, auto_ack: bool) -> Result<()>;

    /// Wait for the next delivery. `Ok(None)` means the subscription ended.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery.
    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery, optionally putting it back on the queue.
    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Close the channel.
    async fn close(&mut self);
}

/// Failure reported by a [`MessageHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Consumes deliveries for owned partitions.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + std::fmt::Debug {
    /// Process one delivery from `partition`.
    async fn handle(
        &self,
        partition: &Partition,
        delivery: &Delivery,
    ) -> std::result::Result<(), HandlerError>;
}
