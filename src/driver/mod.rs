//! Pluggable tunnel drivers
//!
//! A route driver owns the host routing state for tunnel traffic, a VPN
//! driver owns the tunnel endpoints themselves. Concrete drivers are picked
//! by name from a [`DriverRegistry`].

mod network;
pub mod noop;
mod registry;

use async_trait::async_trait;

use crate::error::Result;

pub use network::Network;
pub use registry::{DriverRegistry, RouteDriverFactory, VpnDriverFactory};

/// Programs routes that steer remote-subnet traffic into the tunnel
#[async_trait]
pub trait RouteDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare host state. Called at most once per driver instance.
    async fn init(&self) -> Result<()>;

    /// Converge routes to `network`, using `vpn_mtu` for tunnel routes
    async fn apply(&self, network: &Network, vpn_mtu: u32) -> Result<()>;

    /// Remove everything this driver installed. Best-effort.
    async fn cleanup(&self) -> Result<()>;
}

/// Maintains the VPN tunnels between gateways
#[async_trait]
pub trait VpnDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare host state. Called at most once per driver instance.
    async fn init(&self) -> Result<()>;

    /// Converge tunnels to `network`
    async fn apply(&self, network: &Network) -> Result<()>;

    /// MTU of the tunnel device
    async fn mtu(&self) -> Result<u32>;

    /// Tear down all tunnels. Best-effort.
    async fn cleanup(&self) -> Result<()>;
}
