//! Test support: in-memory collaborators and a multi-process harness.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── TestCluster ────────────────────────────┐
//! │                                                                     │
//! │   Coordinator 0     Coordinator 1     ...     Coordinator N-1        │
//! │        │                 │                          │               │
//! │        └────────┬────────┴──────────────┬───────────┘               │
//! │                 ▼                       ▼                           │
//! │        shared LeaseStore        shared MockTransport                │
//! │   (MemoryLeaseStore, or wrapped  + ScriptedHandler                  │
//! │    in FaultyLeaseStore)                                             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every node is a separate [`Coordinator`] with its own process id, so the
//! harness stands in for N independent processes. Stopping a node without
//! `release_on_stop` behaves like a crash: its leases simply expire.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = PartitionRegistry::new();
//! registry.register(Destination::new("orders", "order").with_fan_out(6), ["Order"])?;
//! let cluster = TestCluster::new(3, registry, CoordinatorConfig::default())?;
//!
//! cluster.start_all().await?;
//! tokio::time::sleep(Duration::from_secs(600)).await;
//! assert_eq!(cluster.owned_counts(), vec![2, 2, 2]);
//! ```

pub mod mock;
pub mod utils;


pub use mock::{FaultyLeaseStore, MockChannel, MockTransport, ScriptedHandler};

use crate::config::CoordinatorConfig;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::Result;
use crate::lease::{LeaseStore, MemoryLeaseStore};
use crate::registry::PartitionRegistry;
use crate::types::PartitionKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Several coordinators sharing one lease store and one broker.
#[derive(Debug)]
pub struct TestCluster {
    pub store: Arc<dyn LeaseStore>,
    pub transport: MockTransport,
    pub handler: ScriptedHandler,
    pub registry: Arc<PartitionRegistry>,
    config: CoordinatorConfig,
    nodes: Vec<Arc<Coordinator>>,
    started_at: Instant,
}

impl TestCluster {
    /// Create `node_count` coordinators over a fresh in-memory store.
    pub fn new(node_count: usize, registry: PartitionRegistry, config: CoordinatorConfig) -> Result<Self> {
        Self::with_store(
            node_count,
            registry,
            config,
            Arc::new(MemoryLeaseStore::with_defaults()),
        )
    }

    /// Create `node_count` coordinators over `store`.
    pub fn with_store(
        node_count: usize,
        registry: PartitionRegistry,
        config: CoordinatorConfig,
        store: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        let mut cluster = Self {
            store,
            transport: MockTransport::new(),
            handler: ScriptedHandler::new(),
            registry: Arc::new(registry),
            config,
            nodes: Vec::with_capacity(node_count),
            started_at: Instant::now(),
        };
        for _ in 0..node_count {
            cluster.add_node()?;
        }
        Ok(cluster)
    }

    /// Add a coordinator (not started). Returns its index.
    pub fn add_node(&mut self) -> Result<usize> {
        let node = Coordinator::new(
            self.config.clone(),
            self.registry.clone(),
            self.store.clone(),
            Arc::new(self.transport.clone()),
            Arc::new(self.handler.clone()),
        )?;
        self.nodes.push(Arc::new(node));
        Ok(self.nodes.len() - 1)
    }

    pub fn node(&self, index: usize) -> &Arc<Coordinator> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<Coordinator>] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub async fn start_all(&self) -> Result<()> {
        for node in &self.nodes {
            node.start().await?;
        }
        Ok(())
    }

    pub async fn start_node(&self, index: usize) -> Result<()> {
        self.nodes[index].start().await
    }

    /// Stop one node. Without `release_on_stop` this is a crash as far as
    /// the other nodes can tell.
    pub async fn stop_node(&self, index: usize) {
        self.nodes[index].stop().await;
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }

    /// Indices of nodes that have not been stopped.
    pub fn alive(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                matches!(
                    node.state(),
                    CoordinatorState::Created | CoordinatorState::Running
                )
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Owned partitions per node, in node order.
    pub fn owned_counts(&self) -> Vec<usize> {
        self.nodes.iter().map(|node| node.owned_count()).collect()
    }

    pub fn total_owned(&self) -> usize {
        self.owned_counts().iter().sum()
    }

    /// Nodes whose ownership table holds `key`.
    pub fn claimants(&self, key: &PartitionKey) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.lease_of(key).is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Partitions claimed by more than one node.
    pub fn contested(&self) -> Vec<PartitionKey> {
        self.registry
            .enumerate_partitions()
            .into_iter()
            .map(|p| p.key)
            .filter(|key| self.claimants(key).len() > 1)
            .collect()
    }

    /// Table entries the store does not back with the same live lease.
    pub async fn stale_claims(&self) -> Vec<(usize, PartitionKey)> {
        let mut stale = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            for key in node.owned_partitions() {
                let Some(lease_id) = node.lease_of(&key) else {
                    continue;
                };
                let backed = match self.store.holder(&key).await {
                    Ok(Some(info)) => info.holder == node.process_id() && info.lease_id == lease_id,
                    _ => false,
                };
                if !backed {
                    stale.push((index, key));
                }
            }
        }
        stale
    }

    /// Enumerated partitions with no live lease in the store.
    pub async fn unheld(&self) -> Vec<PartitionKey> {
        let mut unheld = Vec::new();
        for partition in self.registry.enumerate_partitions() {
            if !matches!(self.store.holder(&partition.key).await, Ok(Some(_))) {
                unheld.push(partition.key);
            }
        }
        unheld
    }

    /// Run one discovery tick on every live node, in node order.
    pub async fn discovery_round(&self) {
        for index in self.alive() {
            self.nodes[index].discovery_tick().await;
        }
    }

    /// Run one renew tick on every live node, in node order.
    pub async fn renew_round(&self) {
        for index in self.alive() {
            self.nodes[index].renew_tick().await;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
