//! Lazy, single-flight lifecycle of the route and VPN drivers
//!
//! Readiness moves `Uninitialized -> RoutePartial -> Ready`. A failed step
//! leaves the manager in one of the first two states and the next call to
//! [`DriverManager::ensure_ready`] starts over with fresh driver instances.
//! [`DriverManager::clear_driver`] is terminal.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{DriverRegistry, RouteDriver, VpnDriver};
use crate::error::{Error, Result};

use super::store::GatewayStore;
use super::tunnel::TunnelHandler;

enum DriverState {
    Uninitialized,
    RoutePartial { route: Arc<dyn RouteDriver> },
    Ready { handler: Arc<TunnelHandler> },
    ShutDown,
}

impl DriverState {
    fn readiness(&self) -> DriverReadiness {
        match self {
            DriverState::Uninitialized => DriverReadiness::Uninitialized,
            DriverState::RoutePartial { .. } => DriverReadiness::RoutePartial,
            DriverState::Ready { .. } => DriverReadiness::Ready,
            DriverState::ShutDown => DriverReadiness::ShutDown,
        }
    }
}

/// Externally visible readiness, reported by `/health`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DriverReadiness {
    Uninitialized,
    RoutePartial,
    Ready,
    ShutDown,
}

impl fmt::Display for DriverReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverReadiness::Uninitialized => "Uninitialized",
            DriverReadiness::RoutePartial => "RoutePartial",
            DriverReadiness::Ready => "Ready",
            DriverReadiness::ShutDown => "ShutDown",
        };
        f.write_str(s)
    }
}

pub struct DriverManager {
    config: Arc<Config>,
    registry: DriverRegistry,
    store: Arc<dyn GatewayStore>,
    // held across init so concurrent passes wait for the first initializer
    state: Mutex<DriverState>,
    // mirrors `state` so readers never wait on an init in progress
    readiness: watch::Sender<DriverReadiness>,
}

impl DriverManager {
    pub fn new(config: Arc<Config>, registry: DriverRegistry, store: Arc<dyn GatewayStore>) -> Self {
        Self {
            config,
            registry,
            store,
            state: Mutex::new(DriverState::Uninitialized),
            readiness: watch::Sender::new(DriverReadiness::Uninitialized),
        }
    }

    fn transition(&self, state: &mut DriverState, next: DriverState) -> DriverState {
        self.readiness.send_replace(next.readiness());
        std::mem::replace(state, next)
    }

    /// Return the tunnel handler, initializing both drivers first if needed
    pub async fn ensure_ready(&self) -> Result<Arc<TunnelHandler>> {
        let mut state = self.state.lock().await;
        match &*state {
            DriverState::Ready { handler } => return Ok(Arc::clone(handler)),
            DriverState::ShutDown => return Err(Error::DriversShutDown),
            DriverState::RoutePartial { route } => {
                debug!(
                    driver = route.name(),
                    "discarding half-initialized route driver"
                );
            }
            DriverState::Uninitialized => {}
        }
        self.init_driver(&mut state).await
    }

    async fn init_driver(&self, state: &mut DriverState) -> Result<Arc<TunnelHandler>> {
        self.transition(state, DriverState::Uninitialized);
        let tunnel = &self.config.tunnel;

        let route = self
            .registry
            .new_route_driver(&tunnel.route_driver, &self.config)?;
        if let Err(e) = route.init().await {
            record_init_failure("route");
            return Err(Error::DriverInit {
                kind: "route",
                driver: route.name().to_string(),
                reason: e.to_string(),
            });
        }
        info!("Route driver {} initialized", route.name());
        self.transition(
            state,
            DriverState::RoutePartial {
                route: Arc::clone(&route),
            },
        );

        let vpn = self.registry.new_vpn_driver(&tunnel.vpn_driver, &self.config)?;
        if let Err(e) = vpn.init().await {
            record_init_failure("vpn");
            return Err(Error::DriverInit {
                kind: "vpn",
                driver: vpn.name().to_string(),
                reason: e.to_string(),
            });
        }
        info!("VPN driver {} initialized", vpn.name());

        let handler = Arc::new(TunnelHandler::new(
            self.config.node_name.clone(),
            tunnel.forward_node_ip,
            Arc::clone(&self.store),
            route,
            vpn,
        ));
        self.transition(
            state,
            DriverState::Ready {
                handler: Arc::clone(&handler),
            },
        );
        Ok(handler)
    }

    /// Last published readiness. Does not wait for an init in progress.
    pub fn readiness(&self) -> DriverReadiness {
        *self.readiness.borrow()
    }

    /// Clean up every live driver. Failures are logged, never returned, and
    /// one driver failing does not keep the other from being cleaned up.
    pub async fn clear_driver(&self) {
        let previous = self.transition(&mut *self.state.lock().await, DriverState::ShutDown);
        match previous {
            DriverState::Ready { handler } => {
                cleanup_route(handler.route_driver()).await;
                cleanup_vpn(handler.vpn_driver()).await;
            }
            DriverState::RoutePartial { route } => cleanup_route(&route).await,
            DriverState::Uninitialized | DriverState::ShutDown => {
                debug!("no live drivers to clean up");
            }
        }
    }
}

async fn cleanup_route(route: &Arc<dyn RouteDriver>) {
    match route.cleanup().await {
        Ok(()) => info!("Route driver {} cleaned up", route.name()),
        Err(e) => error!(
            "{}",
            Error::DriverCleanup {
                kind: "route",
                driver: route.name().to_string(),
                reason: e.to_string(),
            }
        ),
    }
}

async fn cleanup_vpn(vpn: &Arc<dyn VpnDriver>) {
    match vpn.cleanup().await {
        Ok(()) => info!("VPN driver {} cleaned up", vpn.name()),
        Err(e) => error!(
            "{}",
            Error::DriverCleanup {
                kind: "vpn",
                driver: vpn.name().to_string(),
                reason: e.to_string(),
            }
        ),
    }
}

fn record_init_failure(kind: &str) {
    warn!(kind, "driver initialization failed");
    #[cfg(feature = "metrics")]
    super::metrics::inc_driver_init_failure(kind);
}
