//! Custom Resource Definitions for the tunnel agent
//!
//! The agent only consumes the cluster-scoped `Gateway` resource.

mod gateway;
pub mod types;


pub use gateway::{Gateway, GatewaySpec, GatewayStatus};
pub use types::*;
