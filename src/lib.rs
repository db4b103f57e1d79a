//! Leased, load-balanced partition ownership for message-queue consumers.
//!
//! A fleet of identical processes shares the consumption of a set of
//! partitioned destinations. No process is configured with "its" partitions:
//! each one bids for them against a shared lease store, consumes only what it
//! holds a live lease for, and gives a partition up the moment it can no
//! longer renew. Bids are weighted by how little a process already owns, so
//! ownership drifts toward an even split as processes come and go.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenure::testing::{MockTransport, ScriptedHandler};
//! use tenure::{Coordinator, CoordinatorConfig, Destination, MemoryLeaseStore, PartitionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Six partitions: orders_0 .. orders_5, consumed on order_0 .. order_5.
//!     let registry = PartitionRegistry::new();
//!     registry.register(
//!         Destination::new("orders", "order").with_fan_out(6),
//!         ["OrderPlaced", "OrderCancelled"],
//!     )?;
//!
//!     let coordinator = Arc::new(Coordinator::new(
//!         CoordinatorConfig::default(),
//!         Arc::new(registry),
//!         Arc::new(MemoryLeaseStore::with_defaults()),
//!         Arc::new(MockTransport::new()),
//!         Arc::new(ScriptedHandler::new()),
//!     )?);
//!
//!     // Declares destinations and starts the discovery, rebid, renew and health timers.
//!     coordinator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Coordinator                       │
//! │ discovery (bid) · rebid · renew (keep) · health       │
//! └──────────────────────────────────────────────────────┘
//!        │                    │                    │
//!        ▼                    ▼                    ▼
//! ┌─────────────┐    ┌────────────────┐    ┌────────────────┐
//! │ LeaseStore  │    │PartitionRegistry│   │PartitionWorker │ × owned
//! │ weighted    │    │ destinations →  │   │ channel, flow  │
//! │ TTL leases  │    │ partitions      │   │ credit, handler│
//! └─────────────┘    └────────────────┘    └────────────────┘
//!                                                  │
//!                                                  ▼
//!                                          BrokerTransport
//! ```
//!
//! # Guarantees
//!
//! - A partition is consumed by at most one process at a time, provided the
//!   lease store is linearizable. A process stops consuming as soon as a
//!   renewal is refused, and in any case before its lease could lapse.
//! - Every partition is eventually owned while at least one process runs.
//! - Delivery is at-least-once: unacknowledged messages are redelivered to
//!   whoever owns the partition next.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod registry;
pub mod testing;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::{CoordinatorConfig, LeaseStoreConfig, WorkerConfig, DEFAULT_MAX_COMPETITORS};
pub use coordinator::{Activity, ConsumerInfo, Coordinator, CoordinatorState, TickOutcome, TickReport};
pub use error::{Error, LeaseError, RegistryError, Result, TransportError, WorkerError};
pub use lease::{Clock, LeaseStore, ManualClock, MemoryLeaseStore, TokioClock};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use registry::{Destination, DestinationBinding, Partition, PartitionRegistry};
pub use transport::{BrokerChannel, BrokerTransport, Delivery, HandlerError, MessageHandler};
pub use types::{AcquireOutcome, Bid, LeaseId, LeaseInfo, PartitionKey, PartitionState, ProcessId, Weight};
pub use worker::{FlowCredit, PartitionWorker, WorkerHealth, WorkerSnapshot, WorkerState};
