use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;

use super::drivers::DriverReadiness;
use super::engine::TunnelEngine;
use super::retry::Backoff;
use super::testing::{fake_registry, gateway, test_config, DriverCalls, FakeProber, FakeStore};
use crate::config::Config;
use crate::crd::Endpoint;
use crate::error::Error;

struct Harness {
    engine: Arc<TunnelEngine>,
    store: Arc<FakeStore>,
    prober: Arc<FakeProber>,
    calls: Arc<DriverCalls>,
}

fn fast_backoff() -> Backoff {
    Backoff {
        duration: Duration::from_millis(1),
        factor: 2.0,
        jitter: 0.0,
        steps: 4,
        cap: None,
    }
}

fn harness_with(config: Config, gateways: Vec<crate::crd::Gateway>) -> Harness {
    let store = Arc::new(FakeStore::new(gateways));
    let prober = Arc::new(FakeProber::new("Symmetric", 51820));
    let calls = Arc::new(DriverCalls::default());
    let engine = TunnelEngine::new(
        Arc::new(config),
        store.clone(),
        prober.clone(),
        fake_registry(calls.clone()),
    )
    .with_conflict_backoff(fast_backoff());
    Harness {
        engine: Arc::new(engine),
        store,
        prober,
        calls,
    }
}

fn harness(gateways: Vec<crate::crd::Gateway>) -> Harness {
    harness_with(test_config("local"), gateways)
}

fn spec_endpoint(store: &FakeStore, name: &str) -> Endpoint {
    store.gateway(name).unwrap().spec.endpoints[0].clone()
}

async fn next_item(engine: &TunnelEngine) -> bool {
    tokio::time::timeout(Duration::from_secs(2), engine.process_next_item())
        .await
        .expect("an item was delivered")
}

mod nat_sync {
    use super::*;

    #[tokio::test]
    async fn test_unknown_nat_info_is_probed_and_written() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);

        h.engine.reconcile().await.unwrap();

        let ep = spec_endpoint(&h.store, "gw-1");
        assert_eq!(ep.nat_type, "Symmetric");
        assert_eq!(ep.public_port, 51820);
        assert_eq!(ep.node_name, "local");
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.route_applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_known_nat_info_is_not_probed_again() {
        let h = harness(vec![gateway("gw-1", "local", "Full cone", 4500)]);

        h.engine.sync_gateway_list_nat_info().await.unwrap();

        assert_eq!(h.prober.calls(), 0);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partially_known_nat_info_is_refreshed() {
        let h = harness(vec![gateway("gw-1", "local", "Full cone", 0)]);

        h.engine.sync_gateway_list_nat_info().await.unwrap();

        assert_eq!(h.prober.calls(), 2);
        assert_eq!(spec_endpoint(&h.store, "gw-1").public_port, 51820);
    }

    #[tokio::test]
    async fn test_foreign_endpoint_is_never_touched() {
        let h = harness(vec![gateway("gw-1", "remote-node", "", 0)]);
        let before = h.store.gateway("gw-1").unwrap();

        let gw = h.store.gateway("gw-1").unwrap();
        assert!(!h.engine.sync_gateway_nat_info(&gw).await.unwrap());
        h.engine.sync_gateway_list_nat_info().await.unwrap();

        let after = h.store.gateway("gw-1").unwrap();
        assert_eq!(h.prober.calls(), 0);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(before.resource_version(), after.resource_version());
        assert_eq!(after.spec.endpoints[0].nat_type, "");
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_against_fresh_state() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        h.store.inject_conflicts(2);

        h.engine.sync_gateway_list_nat_info().await.unwrap();

        let ep = spec_endpoint(&h.store, "gw-1");
        assert_eq!(ep.nat_type, "Symmetric");
        assert_eq!(ep.public_port, 51820);
        assert_eq!(ep.node_name, "local");
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 1);
        // probing happens once, only the write is retried
        assert_eq!(h.prober.calls(), 2);
    }

    #[tokio::test]
    async fn test_conflict_exhaustion_fails_the_pass() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        h.store.inject_conflicts(10);

        let err = h.engine.reconcile().await.unwrap_err();

        match err {
            Error::NatSync { gateway, source } => {
                assert_eq!(gateway, "gw-1");
                assert!(source.is_conflict());
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 4);
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 0);
        // the pass stops before touching the drivers
        assert_eq!(h.calls.route_inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_aborts_without_partial_update() {
        let h = harness(vec![
            gateway("gw-1", "local", "", 0),
            gateway("gw-2", "local", "", 0),
        ]);
        h.prober.fail.store(true, Ordering::SeqCst);

        let err = h.engine.reconcile().await.unwrap_err();

        assert!(matches!(err, Error::NatSync { ref gateway, .. } if gateway == "gw-1"));
        assert_eq!(h.prober.nat_type_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.prober.public_port_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_removed_endpoint_is_a_silent_no_op() {
        let mut gw = gateway("gw-1", "local", "", 0);
        gw.spec.endpoints.clear();
        let h = harness(vec![gw.clone()]);

        h.engine.sync_gateway_list_nat_info().await.unwrap();
        let written = h.engine.sync_gateway_nat_info(&gw).await.unwrap();

        assert!(!written);
        assert_eq!(h.prober.calls(), 4);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_only_real_writes_are_reported() {
        // status still shows unknown NAT info, the stored spec already holds the probed values
        let mut gw = gateway("gw-1", "local", "", 0);
        gw.spec.endpoints[0].nat_type = "Symmetric".to_string();
        gw.spec.endpoints[0].public_port = 51820;
        let h = harness(vec![gw.clone(), gateway("gw-2", "local", "", 0)]);

        let unchanged = h.engine.sync_gateway_nat_info(&gw).await.unwrap();
        let fresh = h.store.gateway("gw-2").unwrap();
        let updated = h.engine.sync_gateway_nat_info(&fresh).await.unwrap();

        assert!(!unchanged);
        assert!(updated);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(spec_endpoint(&h.store, "gw-1").public_port, 51820);
    }

    #[tokio::test]
    async fn test_list_failure_fails_the_pass() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        h.store.fail_list(true);

        assert!(h.engine.reconcile().await.is_err());
        assert_eq!(h.prober.calls(), 0);
    }
}

mod driver_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_driver_init_failure_does_not_block_nat_sync() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        h.calls.fail_route_init.store(true, Ordering::SeqCst);

        let err = h.engine.reconcile().await.unwrap_err();

        assert!(matches!(err, Error::DriversNotReady));
        assert_eq!(spec_endpoint(&h.store, "gw-1").public_port, 51820);
        assert_eq!(h.calls.vpn_inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_init_is_recovered_on_next_pass() {
        let h = harness(vec![]);
        h.calls.fail_vpn_init.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.engine.reconcile().await,
            Err(Error::DriversNotReady)
        ));
        assert_eq!(
            h.engine.drivers().readiness(),
            DriverReadiness::RoutePartial
        );

        h.calls.fail_vpn_init.store(false, Ordering::SeqCst);
        h.engine.reconcile().await.unwrap();

        assert_eq!(h.calls.route_inits.load(Ordering::SeqCst), 2);
        assert_eq!(h.calls.vpn_inits.load(Ordering::SeqCst), 2);
        assert_eq!(h.engine.drivers().readiness(), DriverReadiness::Ready);

        h.engine.reconcile().await.unwrap();
        assert_eq!(h.calls.route_inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_passes_after_clear_driver_are_not_retried() {
        let h = harness(vec![]);
        h.engine.reconcile().await.unwrap();
        h.engine.clear_driver().await;

        assert_eq!(h.calls.route_cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.vpn_cleanups.load(Ordering::SeqCst), 1);

        h.engine.queue().add("gw-1".to_string()).await;
        assert!(next_item(&h.engine).await);
        assert_eq!(h.engine.queue().num_requeues(&"gw-1".to_string()).await, 0);
        assert!(h.engine.queue().is_empty().await);
    }
}

mod retry_policy {
    use super::*;

    #[tokio::test]
    async fn test_success_forgets_item() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        let key = "gw-1".to_string();

        h.engine.queue().add(key.clone()).await;
        assert!(next_item(&h.engine).await);

        assert_eq!(h.engine.queue().num_requeues(&key).await, 0);
        assert!(h.engine.queue().is_empty().await);
        assert_eq!(spec_endpoint(&h.store, "gw-1").nat_type, "Symmetric");
    }

    #[tokio::test]
    async fn test_failing_item_is_dropped_after_max_retries() {
        let mut config = test_config("local");
        config.engine.max_retries = 2;
        let h = harness_with(config, vec![]);
        h.calls.fail_apply.store(true, Ordering::SeqCst);
        let key = "gw-2".to_string();

        h.engine.queue().add(key.clone()).await;
        h.engine.queue().add(key.clone()).await;
        h.engine.queue().add(key.clone()).await;

        for expected_requeues in [1, 2] {
            assert!(next_item(&h.engine).await);
            assert_eq!(h.engine.queue().num_requeues(&key).await, expected_requeues);
        }
        assert!(next_item(&h.engine).await);

        // third delivery dropped the item and reset its counter
        assert_eq!(h.calls.route_applies.load(Ordering::SeqCst), 3);
        assert_eq!(h.engine.queue().num_requeues(&key).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.engine.queue().is_empty().await);

        // a fresh event starts a new retry cycle
        h.engine.queue().add(key.clone()).await;
        assert!(next_item(&h.engine).await);
        assert_eq!(h.calls.route_applies.load(Ordering::SeqCst), 4);
        assert_eq!(h.engine.queue().num_requeues(&key).await, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_still_runs_initial_pass() {
        let mut config = test_config("local");
        config.engine.max_retries = 0;
        let h = harness_with(config, vec![]);
        h.calls.fail_apply.store(true, Ordering::SeqCst);

        h.engine.queue().add("gw-1".to_string()).await;
        assert!(next_item(&h.engine).await);

        assert_eq!(h.calls.route_applies.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.engine.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_stuck_pass_times_out_and_is_requeued() {
        let h = harness(vec![]);
        let engine = Arc::try_unwrap(h.engine)
            .ok()
            .unwrap()
            .with_reconcile_timeout(Some(Duration::from_millis(20)));
        h.calls.init_delay_ms.store(500, Ordering::SeqCst);
        let key = "gw-1".to_string();

        engine.queue().add(key.clone()).await;
        assert!(next_item(&engine).await);

        assert_eq!(engine.queue().num_requeues(&key).await, 1);
        assert_eq!(
            engine.drivers().readiness(),
            DriverReadiness::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_workers_exit_on_shutdown() {
        let h = harness(vec![gateway("gw-1", "local", "", 0)]);
        let workers: Vec<_> = (0..2)
            .map(|id| tokio::spawn(Arc::clone(&h.engine).run_worker(id)))
            .collect();

        h.engine.queue().add("gw-1".to_string()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.queue().shut_down().await;

        for worker in workers {
            tokio::time::timeout(Duration::from_secs(2), worker)
                .await
                .expect("worker stopped")
                .unwrap();
        }
        assert_eq!(spec_endpoint(&h.store, "gw-1").public_port, 51820);
        assert!(!h.engine.process_next_item().await);
    }
}
