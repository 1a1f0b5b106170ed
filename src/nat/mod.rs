//! NAT traversal probing
//!
//! Peer gateways need this node's NAT type and externally observed port to
//! reach it through NAT. [`NatProber`] is the seam the engine depends on;
//! [`StunProber`] answers it by querying public STUN servers.

pub mod behavior;
pub mod stun;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::NatConfig;
use crate::error::{Error, Result};

pub use behavior::NatType;
use stun::{ChangeRequest, StunError};

/// Discovers the NAT parameters of the local node
#[async_trait]
pub trait NatProber: Send + Sync {
    /// NAT classification, e.g. "Symmetric"
    async fn nat_type(&self) -> Result<String>;

    /// Public port the NAT maps the probe port to
    async fn public_port(&self) -> Result<i32>;
}

/// Probes a fixed, ordered list of STUN servers from one local port
///
/// The first server that answers wins. When every server fails the error
/// lists each server's failure.
pub struct StunProber {
    servers: Vec<String>,
    local_port: u16,
    timeout: Duration,
    // the local port can only be bound once at a time
    socket_lock: Mutex<()>,
}

impl StunProber {
    pub fn new(servers: Vec<String>, local_port: u16, timeout: Duration) -> Self {
        Self {
            servers,
            local_port,
            timeout,
            socket_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &NatConfig) -> Self {
        Self::new(
            config.stun_servers.clone(),
            config.local_port,
            config.timeout(),
        )
    }

    async fn first_success<T, F>(&self, what: &'static str, probe: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(&'a UdpSocket, SocketAddr, Duration) -> BoxFuture<'a, Result<T, StunError>>
            + Send
            + Sync,
    {
        let _guard = self.socket_lock.lock().await;
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], self.local_port)))
            .await
            .map_err(StunError::from)?;

        let mut causes = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let outcome = match stun::resolve(server).await {
                Ok(addr) => probe(&socket, addr, self.timeout).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => {
                    debug!(server = %server, "{} probe succeeded", what);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "{} probe failed", what);
                    causes.push(format!("{server}: {e}"));
                }
            }
        }

        Err(Error::Probe {
            what,
            servers: self.servers.clone(),
            causes,
        })
    }
}

#[async_trait]
impl NatProber for StunProber {
    async fn nat_type(&self) -> Result<String> {
        let nat_type = self
            .first_success("NAT type", |socket, server, timeout| {
                behavior::behavior_test(socket, server, timeout).boxed()
            })
            .await?;
        Ok(nat_type.to_string())
    }

    async fn public_port(&self) -> Result<i32> {
        let mapped = self
            .first_success("public port", |socket, server, timeout| {
                async move {
                    let response =
                        stun::binding(socket, server, ChangeRequest::NONE, timeout).await?;
                    Ok::<_, StunError>(response.mapped)
                }
                .boxed()
            })
            .await?;
        Ok(i32::from(mapped.port()))
    }
}
