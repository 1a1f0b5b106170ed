//! Desired tunnel topology handed to the drivers

use std::collections::BTreeMap;

use crate::crd::{Endpoint, NodeInfo};

/// Snapshot of the tunnel topology as seen from the local node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Network {
    /// Active tunnel endpoint of the local gateway, if one is elected
    pub local_endpoint: Option<Endpoint>,
    /// Members of the local gateway keyed by node name
    pub local_node_info: BTreeMap<String, NodeInfo>,
    /// Active tunnel endpoints of remote gateways keyed by gateway name
    pub remote_endpoints: BTreeMap<String, Endpoint>,
    /// Members of remote gateways keyed by node name
    pub remote_node_info: BTreeMap<String, NodeInfo>,
}

impl Network {
    /// True when the local node terminates the tunnels itself
    pub fn is_gateway_node(&self, node_name: &str) -> bool {
        self.local_endpoint
            .as_ref()
            .map(|ep| ep.node_name == node_name)
            .unwrap_or(false)
    }

    /// Every remote subnet that should be routed through the tunnel
    pub fn remote_subnets(&self) -> Vec<String> {
        let mut subnets: Vec<String> = self
            .remote_node_info
            .values()
            .flat_map(|n| n.subnets.iter().cloned())
            .collect();
        subnets.sort();
        subnets.dedup();
        subnets
    }
}
