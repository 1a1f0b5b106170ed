//! Error types for the tunnel agent
//!
//! Every fallible path in the agent funnels into [`Error`]. The reconcile
//! pass returns it to the work queue, which decides between a rate-limited
//! requeue and dropping the item.

use std::time::Duration;

use thiserror::Error;

use crate::nat::stun::StunError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The stored Gateway changed since it was read
    #[error("Conflict updating gateway {name}: the object has been modified")]
    Conflict { name: String },

    /// The Gateway no longer exists
    #[error("Gateway {name} not found")]
    NotFound { name: String },

    /// Every configured probe endpoint failed
    #[error("Failed to probe {what} via any of {servers:?}: {}", .causes.join("; "))]
    Probe {
        what: &'static str,
        servers: Vec<String>,
        causes: Vec<String>,
    },

    /// A single STUN transaction failed
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    #[error("Failed to initialize {kind} driver {driver}: {reason}")]
    DriverInit {
        kind: &'static str,
        driver: String,
        reason: String,
    },

    #[error("Failed to clean up {kind} driver {driver}: {reason}")]
    DriverCleanup {
        kind: &'static str,
        driver: String,
        reason: String,
    },

    /// No factory registered for the configured driver name
    #[error("Unknown {kind} driver: {name}")]
    UnknownDriver { kind: &'static str, name: String },

    /// Topology convergence was requested before both drivers came up
    #[error("Tunnel drivers are not initialized")]
    DriversNotReady,

    /// Drivers were cleaned up and cannot be used again
    #[error("Tunnel drivers have been shut down")]
    DriversShutDown,

    /// A driver failed to apply the desired network
    #[error("Tunnel apply failed: {0}")]
    Tunnel(String),

    /// NAT info refresh failed for a specific gateway
    #[error("Error syncing NAT info of gateway {gateway}: {source}")]
    NatSync {
        gateway: String,
        #[source]
        source: Box<Error>,
    },

    /// The reconcile pass exceeded its deadline
    #[error("Reconcile pass timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when the error reports a write against a stale resource version
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether a later pass can reasonably be expected to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ConfigError(_) | Error::UnknownDriver { .. } | Error::DriversShutDown => false,
            Error::NatSync { source, .. } => source.is_retriable(),
            _ => true,
        }
    }

    /// Short category used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Conflict { .. } => "conflict",
            Error::NotFound { .. } => "not_found",
            Error::Probe { .. } | Error::Stun(_) => "probe",
            Error::DriverInit { .. }
            | Error::DriverCleanup { .. }
            | Error::UnknownDriver { .. }
            | Error::DriversNotReady
            | Error::DriversShutDown => "driver",
            Error::Tunnel(_) => "tunnel",
            Error::NatSync { source, .. } => source.kind(),
            Error::Timeout(_) => "timeout",
            Error::ConfigError(_) => "config",
        }
    }
}
