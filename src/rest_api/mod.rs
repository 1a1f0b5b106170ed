//! REST API module for health and metrics
//!
//! Provides an HTTP API for probing the agent and inspecting the gateways it
//! sees.

mod dto;
mod handlers;
mod server;

pub use dto::{ErrorResponse, GatewayListResponse, GatewaySummary, HealthResponse};
pub use server::{router, run_server};
