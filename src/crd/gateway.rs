//! Gateway Custom Resource Definition
//!
//! A Gateway groups the nodes of one network domain behind one or more
//! tunnel endpoints. The control plane fills the status with the endpoints it
//! elected as active; the agent on each node only writes the NAT metadata of
//! its own endpoint.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Endpoint, ExposeType, NodeInfo, TunnelConfiguration};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tunnelagent.dev",
    version = "v1beta1",
    kind = "Gateway",
    status = "GatewayStatus",
    shortname = "gw",
    printcolumn = r#"{"name":"Expose","type":"string","jsonPath":".spec.exposeType"}"#,
    printcolumn = r#"{"name":"ActiveNode","type":"string","jsonPath":".status.activeEndpoints[0].nodeName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Candidate endpoints, at most one per node and role
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose_type: Option<ExposeType>,

    #[serde(default)]
    pub tunnel_config: TunnelConfiguration,
}

/// Observed state of a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Nodes that belong to this gateway
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,

    /// Endpoints currently elected to carry traffic
    #[serde(default)]
    pub active_endpoints: Vec<Endpoint>,
}

impl Gateway {
    /// The active Tunnel endpoint, if one has been elected.
    ///
    /// Returns an owned snapshot: later changes to `self` are not reflected
    /// in the returned value and vice versa.
    pub fn tunnel_active_endpoint(&self) -> Option<Endpoint> {
        self.status
            .as_ref()?
            .active_endpoints
            .iter()
            .find(|ep| ep.is_tunnel())
            .cloned()
    }

    /// Whether `node_name` is listed as a member of this gateway
    pub fn has_node(&self, node_name: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.nodes.iter().any(|n| n.node_name == node_name))
            .unwrap_or(false)
    }

    /// Mutable access to the spec endpoint owned by `node_name`.
    ///
    /// A Tunnel endpoint is preferred when the node owns several.
    pub fn endpoint_for_node_mut(&mut self, node_name: &str) -> Option<&mut Endpoint> {
        let idx = self
            .spec
            .endpoints
            .iter()
            .position(|ep| ep.node_name == node_name && ep.is_tunnel())
            .or_else(|| {
                self.spec
                    .endpoints
                    .iter()
                    .position(|ep| ep.node_name == node_name)
            })?;
        self.spec.endpoints.get_mut(idx)
    }
}
