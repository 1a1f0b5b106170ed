//! Reconciliation engine
//!
//! Workers pull gateway names off a shared [`WorkQueue`]. Each pass refreshes
//! this node's NAT metadata, makes sure the drivers are up and converges the
//! tunnel topology. Failures go back to the queue with a growing delay until
//! `max_retries` is reached, after which the item is dropped until the next
//! watch event brings it back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::crd::Gateway;
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::nat::NatProber;

use super::drivers::DriverManager;
use super::queue::{ExponentialRateLimiter, WorkQueue};
use super::retry::{retry_on_conflict, Backoff};
use super::store::GatewayStore;

pub struct TunnelEngine {
    node_name: String,
    store: Arc<dyn GatewayStore>,
    prober: Arc<dyn NatProber>,
    drivers: Arc<DriverManager>,
    queue: WorkQueue<String>,
    max_retries: u32,
    conflict_backoff: Backoff,
    reconcile_timeout: Option<Duration>,
}

impl TunnelEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn GatewayStore>,
        prober: Arc<dyn NatProber>,
        registry: DriverRegistry,
    ) -> Self {
        let engine = &config.engine;
        let queue = WorkQueue::new(ExponentialRateLimiter::new(
            engine.requeue_base_delay(),
            engine.requeue_max_delay(),
        ));
        Self {
            node_name: config.node_name.clone(),
            max_retries: engine.max_retries,
            reconcile_timeout: engine.reconcile_timeout(),
            conflict_backoff: Backoff::default(),
            drivers: Arc::new(DriverManager::new(
                Arc::clone(&config),
                registry,
                Arc::clone(&store),
            )),
            store,
            prober,
            queue,
        }
    }

    /// Replace the backoff used between conflicting NAT writes
    pub fn with_conflict_backoff(mut self, backoff: Backoff) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    /// Override the per-pass deadline, `None` disables it
    pub fn with_reconcile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn drivers(&self) -> &Arc<DriverManager> {
        &self.drivers
    }

    /// Process queue items until the queue is shut down and drained
    pub async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "worker stopped");
    }

    /// Handle one queued gateway. Returns false once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = self.handle(&key).await;
        self.handle_event_err(&key, result).await;
        self.queue.done(&key).await;
        true
    }

    #[instrument(skip(self), fields(node = %self.node_name))]
    async fn handle(&self, gateway: &str) -> Result<()> {
        info!("Reconciling on gateway event {}", gateway);
        let start = Instant::now();

        let result = match self.reconcile_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.reconcile())
                .await
                .unwrap_or(Err(Error::Timeout(deadline))),
            None => self.reconcile().await,
        };

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile(start.elapsed().as_secs_f64(), &result);
        debug!(elapsed = ?start.elapsed(), ok = result.is_ok(), "reconcile pass finished");
        result
    }

    /// One full pass: NAT sync, driver readiness, topology convergence
    pub async fn reconcile(&self) -> Result<()> {
        self.sync_gateway_list_nat_info().await?;

        let handler = match self.drivers.ensure_ready().await {
            Ok(handler) => Some(handler),
            Err(Error::DriversShutDown) => return Err(Error::DriversShutDown),
            Err(e) => {
                // later passes retry the initialization
                error!("Failed to initialize tunnel drivers: {}", e);
                None
            }
        };

        handler.ok_or(Error::DriversNotReady)?.apply().await
    }

    /// Refresh NAT info on every gateway whose active tunnel endpoint lacks
    /// it. Stops at the first failure.
    pub async fn sync_gateway_list_nat_info(&self) -> Result<()> {
        let gateways = self.store.list().await?;
        for gw in &gateways {
            let needs_sync = gw
                .tunnel_active_endpoint()
                .map(|ep| !ep.has_nat_info())
                .unwrap_or(false);
            if !needs_sync {
                continue;
            }
            self.sync_gateway_nat_info(gw)
                .await
                .map_err(|e| Error::NatSync {
                    gateway: gw.name_any(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Probe the NAT and record the result on this node's endpoint of `gw`.
    ///
    /// No-op unless the gateway's active tunnel endpoint is owned by this
    /// node. The write re-reads the gateway on every attempt. Returns whether
    /// the gateway was actually written.
    pub async fn sync_gateway_nat_info(&self, gw: &Gateway) -> Result<bool> {
        let name = gw.name_any();
        match gw.tunnel_active_endpoint() {
            Some(ep) if ep.node_name == self.node_name => {}
            _ => {
                debug!(gateway = %name, "active tunnel endpoint not owned by this node");
                return Ok(false);
            }
        }

        let nat_type = self.prober.nat_type().await?;
        let public_port = self.prober.public_port().await?;

        let store = &self.store;
        let node = self.node_name.as_str();
        let (gateway, nat) = (name.as_str(), nat_type.as_str());
        let written = retry_on_conflict(&self.conflict_backoff, move || async move {
            let mut latest = store.get(gateway).await?;
            let Some(endpoint) = latest.endpoint_for_node_mut(node) else {
                debug!(gateway, "endpoint of this node is gone, nothing to update");
                return Ok(false);
            };
            if endpoint.nat_type == nat && endpoint.public_port == public_port {
                debug!(gateway, "NAT info already up to date");
                return Ok(false);
            }
            endpoint.nat_type = nat.to_string();
            endpoint.public_port = public_port;
            store.update(&latest).await?;
            Ok(true)
        })
        .await?;

        if written {
            info!(
                "Updated NAT info of gateway {}: type {}, public port {}",
                name, nat_type, public_port
            );
            #[cfg(feature = "metrics")]
            super::metrics::inc_nat_info_update();
        }
        Ok(written)
    }

    /// Decide what happens to `key` after a pass
    async fn handle_event_err(&self, key: &String, result: Result<()>) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key).await;
                return;
            }
            Err(e) => e,
        };

        let requeues = self.queue.num_requeues(key).await;
        if err.is_retriable() && requeues < self.max_retries {
            info!("Error syncing gateway {}, retrying: {}", key, err);
            #[cfg(feature = "metrics")]
            super::metrics::inc_requeue();
            self.queue.add_rate_limited(key.clone()).await;
            return;
        }

        self.queue.forget(key).await;
        warn!(
            requeues,
            retriable = err.is_retriable(),
            "Dropping gateway {} out of the queue: {}",
            key,
            err
        );
        #[cfg(feature = "metrics")]
        super::metrics::inc_dropped();
    }

    /// Release both drivers; the engine cannot converge afterwards
    pub async fn clear_driver(&self) {
        self.drivers.clear_driver().await;
    }
}
