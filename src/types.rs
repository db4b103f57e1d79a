//! Core types used throughout the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Bid weight. Higher weights win contested partitions.
pub type Weight = u64;

/// Identity of a competing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Generate a fresh random process id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(Uuid);

impl LeaseId {
    /// Generate a fresh lease id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a partition, `"{destination}_{index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(Arc<str>);

impl PartitionKey {
    /// Create a key from any string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Derive the key for partition `index` of `destination`.
    pub fn for_destination(destination: &str, index: u32) -> Self {
        Self::new(format!("{}_{}", destination, index))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A bid for a partition lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bid {
    /// The bidding process.
    pub bidder: ProcessId,
    /// Desirability of this bidder; higher wins.
    pub weight: Weight,
}

impl Bid {
    /// Create a bid.
    pub fn new(bidder: ProcessId, weight: Weight) -> Self {
        Self { bidder, weight }
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was granted.
    Granted {
        lease_id: LeaseId,
        expires_at: Instant,
    },
    /// The lease was not granted; retry no sooner than `retry_after`.
    Denied { retry_after: Duration },
}

impl AcquireOutcome {
    /// Whether the lease was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }

    /// The granted lease id, if any.
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            AcquireOutcome::Granted { lease_id, .. } => Some(*lease_id),
            AcquireOutcome::Denied { .. } => None,
        }
    }
}

/// Snapshot of a live lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// The leased partition.
    pub partition: PartitionKey,
    /// Lease identifier.
    pub lease_id: LeaseId,
    /// Owning process.
    pub holder: ProcessId,
    /// Weight the holder last reported.
    pub weight: Weight,
    /// When the lease lapses unless renewed.
    pub expires_at: Instant,
}

/// Process-local view of a partition's ownership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Not owned by this process.
    Unowned,
    /// A bid is in flight during the current discovery tick.
    Bidding,
    /// Owned and being renewed.
    Owned,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Unowned => write!(f, "unowned"),
            PartitionState::Bidding => write!(f, "bidding"),
            PartitionState::Owned => write!(f, "owned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_derivation() {
        let key = PartitionKey::for_destination("accounts", 3);
        assert_eq!(key.as_str(), "accounts_3");
        assert_eq!(key, PartitionKey::from("accounts_3"));
    }

    #[test]
    fn test_acquire_outcome_accessors() {
        let id = LeaseId::new();
        let granted = AcquireOutcome::Granted {
            lease_id: id,
            expires_at: Instant::now(),
        };
        assert!(granted.is_granted());
        assert_eq!(granted.lease_id(), Some(id));

        let denied = AcquireOutcome::Denied {
            retry_after: Duration::from_secs(1),
        };
        assert!(!denied.is_granted());
        assert_eq!(denied.lease_id(), None);
    }
}
