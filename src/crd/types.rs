//! Shared types for the Gateway resource
//!
//! These types are embedded in both the Gateway spec (desired endpoints) and
//! its status (active endpoints and member nodes).
//!
//! # Type Hierarchy
//!
//! - [`Endpoint`] - a node's tunnel or proxy endpoint, including NAT metadata
//! - [`EndpointType`] - the role an endpoint plays (Tunnel or Proxy)
//! - [`NodeInfo`] - a member node of a gateway and the subnets behind it
//! - [`ExposeType`] - how a gateway is reachable from other clusters

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of an endpoint within a gateway
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// Carries L3 tunnel traffic between gateways
    #[default]
    Tunnel,
    /// Carries L7 proxy traffic
    Proxy,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Tunnel => write!(f, "tunnel"),
            EndpointType::Proxy => write!(f, "proxy"),
        }
    }
}

/// How a gateway is exposed to peers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExposeType {
    /// The gateway node has a directly reachable public IP
    PublicIP,
    /// Exposed through a LoadBalancer service
    LoadBalancer,
    /// Not exposed; peers must traverse NAT to reach it
    #[default]
    Private,
}

/// A node's endpoint within a gateway
///
/// `nat_type` and `public_port` are filled in by the agent running on
/// `node_name` once it has probed its NAT. Empty string and zero mean
/// "not yet known".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Node that owns this endpoint
    pub node_name: String,

    /// Public address peers should dial
    #[serde(rename = "publicIP", skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Externally observed port, 0 when unknown
    #[serde(default)]
    pub public_port: i32,

    /// NAT classification, empty when unknown
    #[serde(rename = "natType", default)]
    pub nat_type: String,

    #[serde(rename = "underNAT", default)]
    pub under_nat: bool,

    #[serde(rename = "type", default)]
    pub type_: EndpointType,

    #[serde(default)]
    pub port: i32,

    /// Driver specific settings (e.g. pre-shared key references)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl Endpoint {
    /// Create a tunnel endpoint for a node with no NAT metadata yet
    pub fn tunnel(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            type_: EndpointType::Tunnel,
            ..Default::default()
        }
    }

    /// True once both the NAT type and the public port have been recorded
    pub fn has_nat_info(&self) -> bool {
        !self.nat_type.is_empty() && self.public_port != 0
    }

    pub fn is_tunnel(&self) -> bool {
        self.type_ == EndpointType::Tunnel
    }
}

/// A member node of a gateway
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_name: String,

    #[serde(rename = "privateIP")]
    pub private_ip: String,

    /// Pod CIDRs routed through this node
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Tunnel settings for a gateway
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfiguration {
    /// Number of active tunnel endpoints
    #[serde(default = "default_tunnel_replicas")]
    pub replicas: i32,
}

impl Default for TunnelConfiguration {
    fn default() -> Self {
        Self {
            replicas: default_tunnel_replicas(),
        }
    }
}

fn default_tunnel_replicas() -> i32 {
    1
}
