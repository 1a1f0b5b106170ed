//! Drivers that program nothing
//!
//! Useful on nodes where another component owns the data plane, and as the
//! default so the agent can publish NAT info without tunnel privileges. They
//! log every call and remember the last network they were asked to apply.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

use super::{Network, RouteDriver, VpnDriver};

/// MTU reported by the no-op VPN driver (1500 minus IPsec/UDP overhead)
pub const NOOP_VPN_MTU: u32 = 1400;

#[derive(Debug, Default)]
pub struct NoopRouteDriver {
    last_applied: Mutex<Option<(Network, u32)>>,
}

impl NoopRouteDriver {
    pub const NAME: &'static str = "noop";

    pub fn new() -> Self {
        Self::default()
    }

    /// The network and MTU passed to the latest `apply`
    pub fn last_applied(&self) -> Option<(Network, u32)> {
        self.last_applied
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RouteDriver for NoopRouteDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn init(&self) -> Result<()> {
        info!("noop route driver initialized");
        Ok(())
    }

    async fn apply(&self, network: &Network, vpn_mtu: u32) -> Result<()> {
        info!(
            remote_gateways = network.remote_endpoints.len(),
            remote_subnets = network.remote_subnets().len(),
            vpn_mtu,
            "noop route driver apply"
        );
        if let Ok(mut last) = self.last_applied.lock() {
            *last = Some((network.clone(), vpn_mtu));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        info!("noop route driver cleaned up");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopVpnDriver {
    last_applied: Mutex<Option<Network>>,
}

impl NoopVpnDriver {
    pub const NAME: &'static str = "noop";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> Option<Network> {
        self.last_applied
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VpnDriver for NoopVpnDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn init(&self) -> Result<()> {
        info!("noop vpn driver initialized");
        Ok(())
    }

    async fn apply(&self, network: &Network) -> Result<()> {
        info!(
            local_endpoint = ?network.local_endpoint.as_ref().map(|ep| &ep.node_name),
            remote_gateways = network.remote_endpoints.len(),
            "noop vpn driver apply"
        );
        if let Ok(mut last) = self.last_applied.lock() {
            *last = Some(network.clone());
        }
        Ok(())
    }

    async fn mtu(&self) -> Result<u32> {
        Ok(NOOP_VPN_MTU)
    }

    async fn cleanup(&self) -> Result<()> {
        info!("noop vpn driver cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Endpoint;

    #[tokio::test]
    async fn test_noop_drivers_remember_last_network() {
        let route = NoopRouteDriver::new();
        let vpn = NoopVpnDriver::new();
        assert!(route.last_applied().is_none());

        let mut network = Network::default();
        network
            .remote_endpoints
            .insert("gw-2".to_string(), Endpoint::tunnel("node-b"));

        vpn.init().await.unwrap();
        vpn.apply(&network).await.unwrap();
        let mtu = vpn.mtu().await.unwrap();
        route.init().await.unwrap();
        route.apply(&network, mtu).await.unwrap();

        assert_eq!(vpn.last_applied(), Some(network.clone()));
        assert_eq!(route.last_applied(), Some((network, NOOP_VPN_MTU)));
        assert!(route.cleanup().await.is_ok());
        assert!(vpn.cleanup().await.is_ok());
    }
}
