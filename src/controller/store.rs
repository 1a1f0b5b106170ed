//! Access to the shared Gateway collection
//!
//! [`GatewayStore`] is the seam between the engine and the API server so the
//! engine can be exercised against an in-memory store in tests.

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, PostParams},
    Client, ResourceExt,
};
use tracing::debug;

use crate::crd::Gateway;
use crate::error::{Error, Result};

/// Read/write access to Gateway resources
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Gateway>>;

    /// Fetch the latest version of one gateway
    async fn get(&self, name: &str) -> Result<Gateway>;

    /// Write `gateway` back, failing with [`Error::Conflict`] when the stored
    /// version changed since it was read
    async fn update(&self, gateway: &Gateway) -> Result<Gateway>;
}

/// [`GatewayStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeGatewayStore {
    api: Api<Gateway>,
}

impl KubeGatewayStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl GatewayStore for KubeGatewayStore {
    async fn list(&self) -> Result<Vec<Gateway>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get(&self, name: &str) -> Result<Gateway> {
        match self.api.get(name).await {
            Ok(gw) => Ok(gw),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(Error::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn update(&self, gateway: &Gateway) -> Result<Gateway> {
        let name = gateway.name_any();
        // replace carries the resourceVersion we read, so stale writes get a 409
        match self.api.replace(&name, &PostParams::default(), gateway).await {
            Ok(updated) => {
                debug!(
                    gateway = %name,
                    resource_version = ?updated.resource_version(),
                    "gateway updated"
                );
                Ok(updated)
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::Conflict { name }),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(Error::NotFound { name }),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
