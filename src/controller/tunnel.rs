//! Converges the local tunnel and route state to the Gateway topology

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::crd::{Gateway, NodeInfo};
use crate::driver::{Network, RouteDriver, VpnDriver};
use crate::error::Result;

use super::store::GatewayStore;

pub struct TunnelHandler {
    node_name: String,
    forward_node_ip: bool,
    store: Arc<dyn GatewayStore>,
    route: Arc<dyn RouteDriver>,
    vpn: Arc<dyn VpnDriver>,
}

impl TunnelHandler {
    pub fn new(
        node_name: impl Into<String>,
        forward_node_ip: bool,
        store: Arc<dyn GatewayStore>,
        route: Arc<dyn RouteDriver>,
        vpn: Arc<dyn VpnDriver>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            forward_node_ip,
            store,
            route,
            vpn,
        }
    }

    pub fn route_driver(&self) -> &Arc<dyn RouteDriver> {
        &self.route
    }

    pub fn vpn_driver(&self) -> &Arc<dyn VpnDriver> {
        &self.vpn
    }

    /// Read every gateway and push the resulting network to both drivers.
    ///
    /// The VPN side goes first because the route driver needs its MTU.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn apply(&self) -> Result<()> {
        let gateways = self.store.list().await?;
        let network = self.build_network(&gateways);
        debug!(
            gateway_node = network.is_gateway_node(&self.node_name),
            remote_gateways = network.remote_endpoints.len(),
            "applying tunnel network"
        );

        self.vpn.apply(&network).await?;
        let mtu = self.vpn.mtu().await?;
        self.route.apply(&network, mtu).await?;
        Ok(())
    }

    /// Project the gateway list onto the local node's point of view
    pub fn build_network(&self, gateways: &[Gateway]) -> Network {
        let mut network = Network::default();

        for gw in gateways {
            let nodes = gw
                .status
                .as_ref()
                .map(|s| s.nodes.as_slice())
                .unwrap_or_default();

            if gw.has_node(&self.node_name) {
                network.local_endpoint = gw.tunnel_active_endpoint();
                for node in nodes {
                    network
                        .local_node_info
                        .insert(node.node_name.clone(), self.node_info(node));
                }
                continue;
            }

            let Some(endpoint) = gw.tunnel_active_endpoint() else {
                debug!(gateway = %gw.name_any(), "no active tunnel endpoint, skipping");
                continue;
            };
            network.remote_endpoints.insert(gw.name_any(), endpoint);
            for node in nodes {
                network
                    .remote_node_info
                    .insert(node.node_name.clone(), self.node_info(node));
            }
        }

        network
    }

    fn node_info(&self, node: &NodeInfo) -> NodeInfo {
        let mut info = node.clone();
        if self.forward_node_ip && !node.private_ip.is_empty() {
            let host = format!("{}/32", node.private_ip);
            if !info.subnets.contains(&host) {
                info.subnets.push(host);
            }
        }
        info
    }
}
