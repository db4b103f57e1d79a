//! Partition registry: message types → destinations → partitions.
//!
//! Destinations are declared once at startup from [`DestinationBinding`]s and
//! never change afterwards. Each destination fans out into `fan_out`
//! partitions whose keys are derived only from the destination name and the
//! partition index, so partition identity survives restarts.

use crate::error::{RegistryError, Result};
use crate::transport::BrokerTransport;
use crate::types::PartitionKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, info};
use twox_hash::XxHash64;

/// Default initial flow credit.
pub const DEFAULT_MIN_FLOW_CREDIT: u16 = 100;
/// Default flow credit growth step.
pub const DEFAULT_FLOW_CREDIT_INCREMENT: u16 = 100;
/// Default flow credit ceiling.
pub const DEFAULT_MAX_FLOW_CREDIT: u16 = 300;

/// A logical message destination, split into `fan_out` partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination (exchange) name.
    pub name: String,
    /// Prefix of the routing keys of this destination's partitions.
    pub route_prefix: String,
    /// Number of partitions.
    pub fan_out: u32,
    /// Initial flow credit for a newly started worker.
    pub min_flow_credit: u16,
    /// Flow credit growth step.
    pub flow_credit_increment: u16,
    /// Flow credit ceiling.
    pub max_flow_credit: u16,
    /// Deliveries are acknowledged by the broker on dispatch.
    pub auto_acknowledge: bool,
    /// Failed deliveries go back to the queue.
    pub requeue_on_failure: bool,
}

impl Destination {
    /// Create a destination with default flow bounds and a single partition.
    pub fn new(name: impl Into<String>, route_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            route_prefix: route_prefix.into(),
            fan_out: 1,
            min_flow_credit: DEFAULT_MIN_FLOW_CREDIT,
            flow_credit_increment: DEFAULT_FLOW_CREDIT_INCREMENT,
            max_flow_credit: DEFAULT_MAX_FLOW_CREDIT,
            auto_acknowledge: false,
            requeue_on_failure: false,
        }
    }

    /// Set the partition count.
    pub fn with_fan_out(mut self, fan_out: u32) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// Set the flow credit bounds.
    pub fn with_flow_credit(mut self, min: u16, increment: u16, max: u16) -> Self {
        self.min_flow_credit = min;
        self.flow_credit_increment = increment;
        self.max_flow_credit = max;
        self
    }

    /// Set the acknowledgement mode.
    pub fn with_auto_acknowledge(mut self, enabled: bool) -> Self {
        self.auto_acknowledge = enabled;
        self
    }

    /// Set whether failed deliveries are requeued.
    pub fn with_requeue_on_failure(mut self, enabled: bool) -> Self {
        self.requeue_on_failure = enabled;
        self
    }

    /// Check the destination's bounds.
    pub fn validate(&self) -> std::result::Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidDestination {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.fan_out == 0 {
            return Err(invalid("fan_out must be at least 1"));
        }
        if self.min_flow_credit == 0 {
            return Err(invalid("min_flow_credit must be positive"));
        }
        if self.flow_credit_increment == 0 {
            return Err(invalid("flow_credit_increment must be positive"));
        }
        if self.min_flow_credit > self.max_flow_credit {
            return Err(invalid("min_flow_credit exceeds max_flow_credit"));
        }
        Ok(())
    }

    /// Routing key of partition `index`.
    pub fn routing_key(&self, index: u32) -> String {
        format!("{}_{}", self.route_prefix, index)
    }

    /// Producer-side route for a message key.
    ///
    /// The key's xxHash64 picks the partition, so one key always lands on
    /// the same consumer.
    pub fn route_for(&self, key: &[u8]) -> String {
        if self.fan_out <= 1 {
            return self.routing_key(0);
        }
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        let index = (hasher.finish() % u64::from(self.fan_out)) as u32;
        self.routing_key(index)
    }
}

/// One partition of a destination.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Stable partition identity.
    pub key: PartitionKey,
    /// Index within the destination.
    pub index: u32,
    /// Routing key consumed by this partition.
    pub routing_key: String,
    /// Owning destination.
    pub destination: Arc<Destination>,
}

impl Partition {
    /// Build partition `index` of `destination`.
    pub fn new(destination: Arc<Destination>, index: u32) -> Self {
        Self {
            key: PartitionKey::for_destination(&destination.name, index),
            index,
            routing_key: destination.routing_key(index),
            destination,
        }
    }
}

/// Declarative binding of a message type to a destination.
///
/// Omitted fields take the same defaults as [`Destination::new`]; the
/// destination name and route prefix default to the bound type's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBinding {
    /// Name of the bound message/producer type.
    pub bound_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default = "default_fan_out")]
    pub fan_out: u32,
    #[serde(default = "default_min_flow_credit")]
    pub min_flow_credit: u16,
    #[serde(default = "default_flow_credit_increment")]
    pub flow_credit_increment: u16,
    #[serde(default = "default_max_flow_credit")]
    pub max_flow_credit: u16,
    #[serde(default)]
    pub auto_acknowledge: bool,
    #[serde(default)]
    pub requeue_on_failure: bool,
}

fn default_fan_out() -> u32 {
    1
}

fn default_min_flow_credit() -> u16 {
    DEFAULT_MIN_FLOW_CREDIT
}

fn default_flow_credit_increment() -> u16 {
    DEFAULT_FLOW_CREDIT_INCREMENT
}

fn default_max_flow_credit() -> u16 {
    DEFAULT_MAX_FLOW_CREDIT
}

impl DestinationBinding {
    /// Bind `bound_type` with all defaults.
    pub fn new(bound_type: impl Into<String>) -> Self {
        Self {
            bound_type: bound_type.into(),
            name: None,
            route_prefix: None,
            fan_out: default_fan_out(),
            min_flow_credit: DEFAULT_MIN_FLOW_CREDIT,
            flow_credit_increment: DEFAULT_FLOW_CREDIT_INCREMENT,
            max_flow_credit: DEFAULT_MAX_FLOW_CREDIT,
            auto_acknowledge: false,
            requeue_on_failure: false,
        }
    }

    /// Set the destination name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the route prefix.
    pub fn with_route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefix = Some(prefix.into());
        self
    }

    /// Set the partition count.
    pub fn with_fan_out(mut self, fan_out: u32) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// The destination this binding describes.
    pub fn destination(&self) -> Destination {
        let name = self.name.clone().unwrap_or_else(|| self.bound_type.clone());
        let route_prefix = self
            .route_prefix
            .clone()
            .unwrap_or_else(|| self.bound_type.clone());
        Destination {
            name,
            route_prefix,
            fan_out: self.fan_out,
            min_flow_credit: self.min_flow_credit,
            flow_credit_increment: self.flow_credit_increment,
            max_flow_credit: self.max_flow_credit,
            auto_acknowledge: self.auto_acknowledge,
            requeue_on_failure: self.requeue_on_failure,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Destinations in registration order.
    destinations: Vec<Arc<Destination>>,
    /// Bound type → index into `destinations`.
    bindings: HashMap<String, usize>,
}

/// Registry of destinations and their bound message types.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    inner: RwLock<RegistryInner>,
}

impl PartitionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from declarative bindings.
    ///
    /// Bindings naming the same destination are grouped; they must agree on
    /// every destination setting.
    pub fn from_bindings(
        bindings: impl IntoIterator<Item = DestinationBinding>,
    ) -> std::result::Result<Self, RegistryError> {
        let mut grouped: Vec<(Destination, Vec<String>)> = Vec::new();
        for binding in bindings {
            let destination = binding.destination();
            match grouped.iter_mut().find(|(d, _)| d.name == destination.name) {
                Some((existing, types)) => {
                    if *existing != destination {
                        return Err(RegistryError::ConflictingBinding(destination.name));
                    }
                    types.push(binding.bound_type);
                }
                None => grouped.push((destination, vec![binding.bound_type])),
            }
        }

        let registry = Self::new();
        for (destination, types) in grouped {
            registry.register(destination, types)?;
        }
        Ok(registry)
    }

    /// Register a destination and the message types routed to it.
    pub fn register<I, S>(
        &self,
        destination: Destination,
        bound_types: I,
    ) -> std::result::Result<Arc<Destination>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        destination.validate()?;
        let bound_types: Vec<String> = bound_types.into_iter().map(Into::into).collect();

        let mut inner = self.inner.write();
        if inner.destinations.iter().any(|d| d.name == destination.name) {
            return Err(RegistryError::DuplicateDestination(destination.name));
        }
        for (i, bound_type) in bound_types.iter().enumerate() {
            if let Some(&existing) = inner.bindings.get(bound_type) {
                return Err(RegistryError::DuplicateBinding {
                    bound_type: bound_type.clone(),
                    existing: inner.destinations[existing].name.clone(),
                });
            }
            if bound_types[..i].contains(bound_type) {
                return Err(RegistryError::DuplicateBinding {
                    bound_type: bound_type.clone(),
                    existing: destination.name.clone(),
                });
            }
        }

        let destination = Arc::new(destination);
        let index = inner.destinations.len();
        inner.destinations.push(Arc::clone(&destination));
        for bound_type in bound_types {
            inner.bindings.insert(bound_type, index);
        }

        info!(
            destination = %destination.name,
            fan_out = destination.fan_out,
            "Registered destination"
        );
        Ok(destination)
    }

    /// Every partition of every destination, in registration order.
    pub fn enumerate_partitions(&self) -> Vec<Partition> {
        let inner = self.inner.read();
        inner
            .destinations
            .iter()
            .flat_map(|d| (0..d.fan_out).map(move |i| Partition::new(Arc::clone(d), i)))
            .collect()
    }

    /// Destination bound to `bound_type`.
    pub fn resolve_destination(
        &self,
        bound_type: &str,
    ) -> std::result::Result<Arc<Destination>, RegistryError> {
        let inner = self.inner.read();
        inner
            .bindings
            .get(bound_type)
            .map(|&i| Arc::clone(&inner.destinations[i]))
            .ok_or_else(|| RegistryError::Unresolvable(bound_type.to_string()))
    }

    /// All registered destinations.
    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.inner.read().destinations.clone()
    }

    /// Number of registered destinations.
    pub fn len(&self) -> usize {
        self.inner.read().destinations.len()
    }

    /// Whether no destination is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().destinations.is_empty()
    }

    /// Declare every destination on the broker.
    pub async fn declare_destinations(
        &self,
        transport: &dyn BrokerTransport,
        kind: &str,
        durable: bool,
    ) -> Result<()> {
        let destinations = self.destinations();
        if destinations.is_empty() {
            return Ok(());
        }
        let mut channel = transport.open_channel().await?;
        for destination in &destinations {
            channel
                .declare_destination(&destination.name, kind, durable)
                .await?;
            debug!(destination = %destination.name, kind, durable, "Declared destination");
        }
        channel.close().await;
        Ok(())
    }
}
