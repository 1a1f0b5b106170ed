//! Name-keyed constructors for route and VPN drivers

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};

use super::noop::{NoopRouteDriver, NoopVpnDriver};
use super::{RouteDriver, VpnDriver};

pub type RouteDriverFactory = Arc<dyn Fn(&Config) -> Result<Arc<dyn RouteDriver>> + Send + Sync>;
pub type VpnDriverFactory = Arc<dyn Fn(&Config) -> Result<Arc<dyn VpnDriver>> + Send + Sync>;

/// Maps configured driver names to constructors
#[derive(Clone, Default)]
pub struct DriverRegistry {
    route: BTreeMap<String, RouteDriverFactory>,
    vpn: BTreeMap<String, VpnDriverFactory>,
}

impl DriverRegistry {
    /// A registry with no drivers
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the drivers shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_route(NoopRouteDriver::NAME, |_| {
            let driver: Arc<dyn RouteDriver> = Arc::new(NoopRouteDriver::new());
            Ok(driver)
        });
        registry.register_vpn(NoopVpnDriver::NAME, |_| {
            let driver: Arc<dyn VpnDriver> = Arc::new(NoopVpnDriver::new());
            Ok(driver)
        });
        registry
    }

    pub fn register_route<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn RouteDriver>> + Send + Sync + 'static,
    {
        self.route.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_vpn<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn VpnDriver>> + Send + Sync + 'static,
    {
        self.vpn.insert(name.to_string(), Arc::new(factory));
    }

    /// Build a new, uninitialized route driver
    pub fn new_route_driver(&self, name: &str, config: &Config) -> Result<Arc<dyn RouteDriver>> {
        let factory = self.route.get(name).ok_or_else(|| Error::UnknownDriver {
            kind: "route",
            name: name.to_string(),
        })?;
        factory(config)
    }

    /// Build a new, uninitialized VPN driver
    pub fn new_vpn_driver(&self, name: &str, config: &Config) -> Result<Arc<dyn VpnDriver>> {
        let factory = self.vpn.get(name).ok_or_else(|| Error::UnknownDriver {
            kind: "vpn",
            name: name.to_string(),
        })?;
        factory(config)
    }

    pub fn route_driver_names(&self) -> Vec<&str> {
        self.route.keys().map(String::as_str).collect()
    }

    pub fn vpn_driver_names(&self) -> Vec<&str> {
        self.vpn.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("route", &self.route_driver_names())
            .field("vpn", &self.vpn_driver_names())
            .finish()
    }
}
