//! Prometheus metrics for the tunnel agent
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `tunnel_agent_reconcile_duration_seconds` (histogram): reconcile pass duration.
//! - `tunnel_agent_reconcile_total` (counter): reconcile passes labeled by result and error kind.
//! - `tunnel_agent_requeues_total` (counter): rate-limited requeues after a failed pass.
//! - `tunnel_agent_dropped_total` (counter): items dropped after exhausting their retries.
//! - `tunnel_agent_nat_info_updates_total` (counter): NAT metadata writes to gateways.
//! - `tunnel_agent_driver_init_failures_total` (counter): driver init failures labeled by kind.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::Result;

/// Labels for reconcile outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// "success" or "error"
    pub result: String,
    /// Error category, empty on success
    pub kind: String,
}

/// Labels for driver metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DriverLabels {
    /// "route" or "vpn"
    pub kind: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(exponential_buckets(0.005, 2.0, 14)));

pub static RECONCILE_TOTAL: Lazy<Family<ResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REQUEUES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static DROPPED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static NAT_INFO_UPDATES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static DRIVER_INIT_FAILURES_TOTAL: Lazy<Family<DriverLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::with_prefix("tunnel_agent");

    registry.register(
        "reconcile_duration_seconds",
        "Duration of reconcile passes",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "reconcile",
        "Reconcile passes by result",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "requeues",
        "Rate-limited requeues after a failed pass",
        REQUEUES_TOTAL.clone(),
    );
    registry.register(
        "dropped",
        "Queue items dropped after exhausting their retries",
        DROPPED_TOTAL.clone(),
    );
    registry.register(
        "nat_info_updates",
        "NAT metadata written to gateways",
        NAT_INFO_UPDATES_TOTAL.clone(),
    );
    registry.register(
        "driver_init_failures",
        "Route and VPN driver initialization failures",
        DRIVER_INIT_FAILURES_TOTAL.clone(),
    );

    registry
});

/// Record the duration and outcome of one reconcile pass
pub fn observe_reconcile(seconds: f64, result: &Result<()>) {
    RECONCILE_DURATION_SECONDS.observe(seconds);
    let labels = match result {
        Ok(()) => ResultLabels {
            result: "success".to_string(),
            kind: String::new(),
        },
        Err(e) => ResultLabels {
            result: "error".to_string(),
            kind: e.kind().to_string(),
        },
    };
    RECONCILE_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_requeue() {
    REQUEUES_TOTAL.inc();
}

pub fn inc_dropped() {
    DROPPED_TOTAL.inc();
}

pub fn inc_nat_info_update() {
    NAT_INFO_UPDATES_TOTAL.inc();
}

pub fn inc_driver_init_failure(kind: &str) {
    DRIVER_INIT_FAILURES_TOTAL
        .get_or_create(&DriverLabels {
            kind: kind.to_string(),
        })
        .inc();
}

/// Render the registry in the OpenMetrics text format
pub fn encode_registry() -> std::result::Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
