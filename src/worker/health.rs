//! Worker health probing results.

/// Result of a single worker health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHealth {
    /// Consume loop alive and subscribed.
    Healthy,
    /// The consume loop had died and was re-established by this probe.
    Recovered,
    /// The worker cannot consume and local recovery did not help.
    Unhealthy { reason: String },
    /// The worker is closing, closed or barred from restarting.
    Stopped,
}

impl WorkerHealth {
    /// Build an unhealthy result.
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        WorkerHealth::Unhealthy {
            reason: reason.into(),
        }
    }

    /// Whether the worker is consuming after the probe.
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerHealth::Healthy | WorkerHealth::Recovered)
    }

    /// Get the reason string, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            WorkerHealth::Unhealthy { reason } => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Recovered => write!(f, "recovered"),
            WorkerHealth::Unhealthy { reason } => write!(f, "unhealthy: {}", reason),
            WorkerHealth::Stopped => write!(f, "stopped"),
        }
    }
}
