//! Host loop for the tunnel engine
//!
//! Watches Gateways with the kube-rs runtime watcher and feeds every touched
//! gateway into the engine's work queue, which a pool of workers drains.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crd::Gateway;
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::nat::StunProber;

use super::engine::TunnelEngine;
use super::store::KubeGatewayStore;

/// Shared state for the controller and the REST API
pub struct ControllerState {
    pub client: Client,
    pub config: Arc<Config>,
    pub engine: Arc<TunnelEngine>,
}

impl ControllerState {
    /// Wire the Kubernetes-backed store and the STUN prober into an engine
    pub fn new(client: Client, config: Arc<Config>, registry: DriverRegistry) -> Self {
        let store = Arc::new(KubeGatewayStore::new(client.clone()));
        let prober = Arc::new(StunProber::from_config(&config.nat));
        let engine = TunnelEngine::new(Arc::clone(&config), store, prober, registry);
        Self {
            client,
            config,
            engine: Arc::new(engine),
        }
    }
}

/// Main entry point to start the controller. Returns after a shutdown
/// signal once in-flight passes finished and the drivers were cleaned up.
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let gateways: Api<Gateway> = Api::all(state.client.clone());

    info!(
        "Starting tunnel agent controller on node {}",
        state.config.node_name
    );

    // Verify CRD exists
    match gateways.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Gateway CRD is available"),
        Err(e) => {
            error!("Gateway CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Gateway CRD not installed".to_string()));
        }
    }

    let workers: Vec<_> = (0..state.config.engine.workers)
        .map(|id| tokio::spawn(Arc::clone(&state.engine).run_worker(id)))
        .collect();
    info!("Started {} workers", workers.len());

    let engine = Arc::clone(&state.engine);
    let events = watcher(gateways, watcher::Config::default())
        .default_backoff()
        .for_each(|event| {
            let engine = Arc::clone(&engine);
            async move { enqueue(&engine, event).await }
        });

    tokio::select! {
        _ = events => warn!("Gateway watch stream ended"),
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    state.engine.queue().shut_down().await;
    for joined in futures::future::join_all(workers).await {
        if let Err(e) = joined {
            error!("Worker task failed: {}", e);
        }
    }
    state.engine.clear_driver().await;

    info!("Tunnel agent controller stopped");
    Ok(())
}

async fn enqueue(
    engine: &TunnelEngine,
    event: std::result::Result<watcher::Event<Gateway>, watcher::Error>,
) {
    match event {
        Ok(watcher::Event::Apply(gw))
        | Ok(watcher::Event::InitApply(gw))
        | Ok(watcher::Event::Delete(gw)) => engine.queue().add(gw.name_any()).await,
        Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
        Err(e) => warn!("Gateway watch error: {}", e),
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
