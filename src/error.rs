//! Error types for partition ownership coordination.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Lease store errors. Always transient from the bidder's point of view.
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Partition registry errors. Fatal at startup.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Broker transport errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Worker lifecycle errors.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error belongs to the transient class that is retried on
    /// the next scheduled tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Lease(_) | Error::Transport(_) | Error::Worker(WorkerError::StartFailed { .. })
        )
    }
}

/// Lease store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The store could not be reached.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the call timeout.
    #[error("lease call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Partition registry (configuration) errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A message type was bound to more than one destination.
    #[error("type {bound_type} already bound to destination {existing}")]
    DuplicateBinding { bound_type: String, existing: String },

    /// A destination name was registered twice.
    #[error("destination already registered: {0}")]
    DuplicateDestination(String),

    /// Destination bounds are unusable.
    #[error("invalid destination {name}: {reason}")]
    InvalidDestination { name: String, reason: String },

    /// Two bindings name the same destination with different settings.
    #[error("conflicting bindings for destination {0}")]
    ConflictingBinding(String),

    /// No destination is bound for the message type.
    #[error("no destination bound for type {0}")]
    Unresolvable(String),
}

/// Broker transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was closed underneath the consumer.
    #[error("channel closed")]
    ChannelClosed,

    /// Opening a connection or channel failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected an operation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Worker lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// `start` was called on a worker that is already running.
    #[error("worker for {0} already started")]
    AlreadyStarted(String),

    /// The worker has been closed.
    #[error("worker for {0} is closed")]
    Closed(String),

    /// The worker could not subscribe to its partition.
    #[error("worker for {partition} failed to start: {reason}")]
    StartFailed { partition: String, reason: String },
}
