//! Controller module for the tunnel agent
//! This module contains the work queue, the reconciliation engine, driver
//! lifecycle management and the host loop that feeds the engine from a
//! Gateway watch.

mod drivers;
mod engine;
#[cfg(test)]
mod engine_test;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
mod reconciler;
pub mod retry;
mod store;
#[cfg(test)]
mod testing;
mod tunnel;

pub use drivers::{DriverManager, DriverReadiness};
pub use engine::TunnelEngine;
pub use queue::{ExponentialRateLimiter, WorkQueue};
pub use reconciler::{run_controller, shutdown_signal, ControllerState};
pub use retry::{retry_on_conflict, Backoff};
pub use store::{GatewayStore, KubeGatewayStore};
pub use tunnel::TunnelHandler;
