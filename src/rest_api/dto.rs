//! Response bodies of the REST API

use kube::ResourceExt;
use serde::Serialize;

use crate::controller::DriverReadiness;
use crate::crd::Gateway;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_name: String,
    pub drivers: DriverReadiness,
    pub queue_depth: usize,
}

/// One gateway as seen from the local node
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySummary {
    pub name: String,
    pub active_node: Option<String>,
    pub nat_type: Option<String>,
    pub public_port: Option<i32>,
    /// The local node is a member of this gateway
    pub local: bool,
}

impl GatewaySummary {
    pub fn new(gw: &Gateway, node_name: &str) -> Self {
        let active = gw.tunnel_active_endpoint();
        Self {
            name: gw.name_any(),
            active_node: active.as_ref().map(|ep| ep.node_name.clone()),
            nat_type: active
                .as_ref()
                .filter(|ep| !ep.nat_type.is_empty())
                .map(|ep| ep.nat_type.clone()),
            public_port: active
                .as_ref()
                .filter(|ep| ep.public_port != 0)
                .map(|ep| ep.public_port),
            local: gw.has_node(node_name),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GatewayListResponse {
    pub items: Vec<GatewaySummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
