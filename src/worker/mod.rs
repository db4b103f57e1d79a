//! Partition workers.
//!
//! A [`PartitionWorker`] is the runtime unit that consumes one owned
//! partition: it opens a broker channel, subscribes to the partition's
//! routing key and feeds every delivery to the [`MessageHandler`].
//!
//! ```text
//!   BrokerChannel ──next_delivery──▶ consume loop ──handle──▶ MessageHandler
//!        ▲                               │
//!        └──── ack / nack / prefetch ────┘ (FlowCredit)
//! ```
//!
//! [`MessageHandler`]: crate::transport::MessageHandler

mod consumer;
mod flow_credit;
mod health;

pub use consumer::{PartitionWorker, WorkerSnapshot, WorkerState};
pub use flow_credit::FlowCredit;
pub use health::WorkerHealth;
