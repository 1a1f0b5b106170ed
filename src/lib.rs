//! tunnel-agent: control loop of a cross-cluster L3 tunnel engine
//!
//! The agent watches cluster-wide Gateway resources, publishes this node's
//! NAT traversal parameters on its own endpoint and drives pluggable route
//! and VPN drivers to realize the tunnel topology.

pub mod config;
pub mod controller;
pub mod crd;
pub mod driver;
pub mod error;
pub mod nat;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
