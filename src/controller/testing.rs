//! In-memory fakes for the engine's collaborators

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::config::Config;
use crate::crd::{Endpoint, Gateway, GatewaySpec, GatewayStatus, NodeInfo};
use crate::driver::{DriverRegistry, Network, RouteDriver, VpnDriver};
use crate::error::{Error, Result};
use crate::nat::NatProber;

use super::store::GatewayStore;

pub const FAKE_DRIVER: &str = "fake";

pub fn test_config(node_name: &str) -> Config {
    let mut config = Config {
        node_name: node_name.to_string(),
        ..Default::default()
    };
    config.tunnel.route_driver = FAKE_DRIVER.to_string();
    config.tunnel.vpn_driver = FAKE_DRIVER.to_string();
    config.engine.requeue_base_delay_ms = 1;
    config.engine.requeue_max_delay_secs = 1;
    config
}

/// A gateway whose status elects `active_node` as its tunnel endpoint
pub fn gateway(name: &str, active_node: &str, nat_type: &str, public_port: i32) -> Gateway {
    let endpoint = Endpoint {
        nat_type: nat_type.to_string(),
        public_port,
        ..Endpoint::tunnel(active_node)
    };
    let mut gw = Gateway::new(
        name,
        GatewaySpec {
            endpoints: vec![endpoint.clone()],
            ..Default::default()
        },
    );
    gw.status = Some(GatewayStatus {
        nodes: vec![NodeInfo {
            node_name: active_node.to_string(),
            private_ip: "192.168.0.10".to_string(),
            subnets: vec!["10.0.0.0/24".to_string()],
        }],
        active_endpoints: vec![endpoint],
    });
    gw
}

/// Gateway store with resourceVersion checks and injectable conflicts
#[derive(Default)]
pub struct FakeStore {
    gateways: Mutex<BTreeMap<String, Gateway>>,
    pending_conflicts: AtomicU32,
    fail_list: AtomicBool,
    pub lists: AtomicU32,
    pub update_attempts: AtomicU32,
    pub writes: AtomicU32,
}

impl FakeStore {
    pub fn new(gateways: Vec<Gateway>) -> Self {
        let store = Self::default();
        for gw in gateways {
            store.put(gw);
        }
        store
    }

    /// Insert or replace a gateway as an external writer would
    pub fn put(&self, mut gw: Gateway) {
        let mut gateways = self.gateways.lock().unwrap();
        let version = gateways
            .get(&gw.name_any())
            .and_then(|old| old.resource_version())
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0);
        gw.metadata.resource_version = Some((version + 1).to_string());
        gateways.insert(gw.name_any(), gw);
    }

    pub fn gateway(&self, name: &str) -> Option<Gateway> {
        self.gateways.lock().unwrap().get(name).cloned()
    }

    /// Make the next `n` updates lose a race against an external writer
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    fn bump(&self, name: &str) {
        if let Some(gw) = self.gateway(name) {
            self.put(gw);
        }
    }
}

#[async_trait]
impl GatewayStore for FakeStore {
    async fn list(&self) -> Result<Vec<Gateway>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("store unavailable".to_string()));
        }
        Ok(self.gateways.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Gateway> {
        self.gateway(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })
    }

    async fn update(&self, gateway: &Gateway) -> Result<Gateway> {
        self.update_attempts.fetch_add(1, Ordering::SeqCst);
        let name = gateway.name_any();

        let remaining = self.pending_conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_conflicts.store(remaining - 1, Ordering::SeqCst);
            self.bump(&name);
        }

        let stored = self.gateway(&name).ok_or_else(|| Error::NotFound {
            name: name.clone(),
        })?;
        if stored.resource_version() != gateway.resource_version() {
            return Err(Error::Conflict { name });
        }
        self.put(gateway.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.gateway(&name).ok_or(Error::NotFound { name })
    }
}

pub struct FakeProber {
    nat_type: String,
    public_port: i32,
    pub fail: AtomicBool,
    pub nat_type_calls: AtomicU32,
    pub public_port_calls: AtomicU32,
}

impl FakeProber {
    pub fn new(nat_type: &str, public_port: i32) -> Self {
        Self {
            nat_type: nat_type.to_string(),
            public_port,
            fail: AtomicBool::new(false),
            nat_type_calls: AtomicU32::new(0),
            public_port_calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.nat_type_calls.load(Ordering::SeqCst) + self.public_port_calls.load(Ordering::SeqCst)
    }

    fn failure(&self, what: &'static str) -> Error {
        Error::Probe {
            what,
            servers: vec!["stun.invalid:3478".to_string()],
            causes: vec!["stun.invalid:3478: timed out".to_string()],
        }
    }
}

#[async_trait]
impl NatProber for FakeProber {
    async fn nat_type(&self) -> Result<String> {
        self.nat_type_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(self.failure("NAT type"));
        }
        Ok(self.nat_type.clone())
    }

    async fn public_port(&self) -> Result<i32> {
        self.public_port_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(self.failure("public port"));
        }
        Ok(self.public_port)
    }
}

/// Call counters and failure switches shared by every fake driver instance
#[derive(Default)]
pub struct DriverCalls {
    pub route_instances: AtomicU32,
    pub route_inits: AtomicU32,
    pub vpn_inits: AtomicU32,
    pub route_applies: AtomicU32,
    pub vpn_applies: AtomicU32,
    pub route_cleanups: AtomicU32,
    pub vpn_cleanups: AtomicU32,
    pub fail_route_init: AtomicBool,
    pub fail_vpn_init: AtomicBool,
    pub fail_route_cleanup: AtomicBool,
    pub fail_apply: AtomicBool,
    pub init_delay_ms: AtomicU64,
}

impl DriverCalls {
    async fn init_delay(&self) {
        let ms = self.init_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

struct FakeRouteDriver(Arc<DriverCalls>);
struct FakeVpnDriver(Arc<DriverCalls>);

#[async_trait]
impl RouteDriver for FakeRouteDriver {
    fn name(&self) -> &str {
        FAKE_DRIVER
    }

    async fn init(&self) -> Result<()> {
        self.0.init_delay().await;
        self.0.route_inits.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_route_init.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("route table locked".to_string()));
        }
        Ok(())
    }

    async fn apply(&self, _network: &Network, _vpn_mtu: u32) -> Result<()> {
        self.0.route_applies.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("route apply failed".to_string()));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.0.route_cleanups.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_route_cleanup.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("route cleanup failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VpnDriver for FakeVpnDriver {
    fn name(&self) -> &str {
        FAKE_DRIVER
    }

    async fn init(&self) -> Result<()> {
        self.0.init_delay().await;
        self.0.vpn_inits.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_vpn_init.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("no vpn credentials".to_string()));
        }
        Ok(())
    }

    async fn apply(&self, _network: &Network) -> Result<()> {
        self.0.vpn_applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mtu(&self) -> Result<u32> {
        Ok(1400)
    }

    async fn cleanup(&self) -> Result<()> {
        self.0.vpn_cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry whose "fake" drivers report into `calls`
pub fn fake_registry(calls: Arc<DriverCalls>) -> DriverRegistry {
    let mut registry = DriverRegistry::empty();
    let route_calls = Arc::clone(&calls);
    registry.register_route(FAKE_DRIVER, move |_| {
        route_calls.route_instances.fetch_add(1, Ordering::SeqCst);
        let driver: Arc<dyn RouteDriver> = Arc::new(FakeRouteDriver(Arc::clone(&route_calls)));
        Ok(driver)
    });
    registry.register_vpn(FAKE_DRIVER, move |_| {
        let driver: Arc<dyn VpnDriver> = Arc::new(FakeVpnDriver(Arc::clone(&calls)));
        Ok(driver)
    });
    registry
}
