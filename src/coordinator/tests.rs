use super::*;
use crate::config::WorkerConfig;
use crate::lease::MemoryLeaseStore;
use crate::registry::Destination;
use crate::testing::utils::wait_for_condition;
use crate::testing::{FaultyLeaseStore, MockTransport, ScriptedHandler};
use crate::worker::WorkerState;
use test_log::test;

const DEFAULT_WEIGHT: Weight = crate::config::DEFAULT_MAX_COMPETITORS;

struct Fixture {
    coordinator: Arc<Coordinator>,
    store: Arc<dyn LeaseStore>,
    transport: MockTransport,
    handler: ScriptedHandler,
}

fn registry(fan_out: u32) -> Arc<PartitionRegistry> {
    let registry = PartitionRegistry::new();
    registry
        .register(
            Destination::new("orders", "order").with_fan_out(fan_out),
            ["OrderPlaced"],
        )
        .unwrap();
    Arc::new(registry)
}

fn fixture_with(fan_out: u32, config: CoordinatorConfig, store: Arc<dyn LeaseStore>) -> Fixture {
    let transport = MockTransport::new();
    let handler = ScriptedHandler::new();
    let coordinator = Coordinator::new(
        config,
        registry(fan_out),
        store.clone(),
        Arc::new(transport.clone()),
        Arc::new(handler.clone()),
    )
    .unwrap();
    Fixture {
        coordinator: Arc::new(coordinator),
        store,
        transport,
        handler,
    }
}

fn fixture(fan_out: u32) -> Fixture {
    fixture_with(
        fan_out,
        CoordinatorConfig::default(),
        Arc::new(MemoryLeaseStore::with_defaults()),
    )
}

fn faulty_fixture(fan_out: u32, config: CoordinatorConfig) -> (Fixture, Arc<FaultyLeaseStore>) {
    let faulty = Arc::new(FaultyLeaseStore::new(Arc::new(
        MemoryLeaseStore::with_defaults(),
    )));
    (fixture_with(fan_out, config, faulty.clone()), faulty)
}

fn key(index: u32) -> PartitionKey {
    PartitionKey::for_destination("orders", index)
}

fn completed(outcome: TickOutcome) -> TickReport {
    match outcome {
        TickOutcome::Completed(report) => report,
        TickOutcome::Skipped => panic!("tick was skipped"),
    }
}

#[test]
fn test_new_rejects_invalid_config() {
    let config = CoordinatorConfig::default()
        .with_renew_interval(Duration::from_secs(60))
        .with_lease_ttl(Duration::from_secs(30));
    let result = Coordinator::new(
        config,
        registry(1),
        Arc::new(MemoryLeaseStore::with_defaults()),
        Arc::new(MockTransport::new()),
        Arc::new(ScriptedHandler::new()),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test(tokio::test)]
async fn test_discovery_acquires_every_free_partition() {
    let f = fixture(3);
    assert_eq!(f.coordinator.current_weight(), DEFAULT_WEIGHT);

    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.examined, 3);
    assert_eq!(report.acquired, vec![key(0), key(1), key(2)]);
    assert!(report.failures.is_empty());

    assert_eq!(f.coordinator.owned_count(), 3);
    assert_eq!(f.coordinator.current_weight(), DEFAULT_WEIGHT - 3);
    for i in 0..3 {
        assert_eq!(f.coordinator.partition_state(&key(i)), PartitionState::Owned);
        assert_eq!(f.transport.consumers_on(&format!("order_{}", i)), 1);
        let holder = f.store.holder(&key(i)).await.unwrap().unwrap();
        assert_eq!(holder.holder, f.coordinator.process_id());
        assert_eq!(Some(holder.lease_id), f.coordinator.lease_of(&key(i)));
    }

    let snapshot = f.coordinator.metrics().snapshot();
    assert_eq!(snapshot.bids_granted, 3);
    assert_eq!(snapshot.workers_started, 3);
    assert_eq!(snapshot.owned_partitions, 3);

    // Nothing left to bid for.
    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.examined, 0);
    assert_eq!(f.coordinator.metrics().bids_total.get(), 3);
}

#[test(tokio::test)]
async fn test_consumers_report_running_workers() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;

    let tag = f.transport.push("order_1", "payload");
    assert!(wait_for_condition(|| f.handler.handled_count() == 1, Duration::from_secs(5)).await);

    let consumers = f.coordinator.consumers();
    assert_eq!(consumers.len(), 2);
    assert_eq!(consumers[1].partition, key(1));
    assert_eq!(consumers[1].destination, "orders");
    assert_eq!(consumers[1].routing_key, "order_1");
    assert_eq!(consumers[1].worker.state, WorkerState::Running);
    assert!(wait_for_condition(
        || f.transport.acked() == vec![("order_1".to_string(), tag)],
        Duration::from_secs(5)
    )
    .await);
}

#[test(tokio::test)]
async fn test_partition_held_elsewhere_stays_unowned() {
    let f = fixture(3);
    let other = ProcessId::new();
    let outcome = f
        .store
        .acquire(&key(1), Bid::new(other, 1), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(outcome.is_granted());

    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.acquired, vec![key(0), key(2)]);
    assert!(report.failures.is_empty());
    assert_eq!(f.coordinator.partition_state(&key(1)), PartitionState::Unowned);
    assert_eq!(f.transport.consumers_on("order_1"), 0);
    assert_eq!(f.coordinator.metrics().bids_denied.get(), 1);
    assert!(f.coordinator.next_rebid(&key(1)).is_some());
}

#[test(tokio::test)]
async fn test_renew_keeps_held_leases() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;

    let report = completed(f.coordinator.renew_tick().await);
    assert_eq!(report.examined, 2);
    assert!(report.lost.is_empty());
    assert_eq!(f.coordinator.owned_count(), 2);
    assert_eq!(f.coordinator.metrics().renewals_total.get(), 2);
    assert_eq!(f.coordinator.metrics().renewals_failed.get(), 0);
}

#[test(tokio::test)]
async fn test_lost_lease_evicts_worker() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;

    let lease_id = f.coordinator.lease_of(&key(0)).unwrap();
    assert!(f.store.release(&key(0), lease_id).await.unwrap());

    let report = completed(f.coordinator.renew_tick().await);
    assert_eq!(report.lost, vec![key(0)]);
    assert!(report.failures.is_empty());

    assert_eq!(f.coordinator.owned_partitions(), vec![key(1)]);
    assert_eq!(f.coordinator.partition_state(&key(0)), PartitionState::Unowned);
    assert_eq!(f.transport.consumers_on("order_0"), 0);
    assert_eq!(f.transport.consumers_on("order_1"), 1);
    assert_eq!(f.coordinator.metrics().leases_lost.get(), 1);
    assert_eq!(f.coordinator.metrics().owned_partitions.get(), 1);
}

#[test(tokio::test)]
async fn test_renewal_error_gives_up_partition() {
    let (f, faulty) = faulty_fixture(2, CoordinatorConfig::default());
    f.coordinator.discovery_tick().await;

    faulty.fail_renewals_for(&key(1));
    let report = completed(f.coordinator.renew_tick().await);
    assert_eq!(report.lost, vec![key(1)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, key(1));
    assert_eq!(f.coordinator.owned_partitions(), vec![key(0)]);
    assert_eq!(f.coordinator.metrics().renewals_failed.get(), 1);

    // Back to normal: the partition is won again on the next discovery.
    faulty.restore_renewals_for(&key(1));
    let lease_id = f.store.holder(&key(1)).await.unwrap().unwrap().lease_id;
    assert!(f.store.release(&key(1), lease_id).await.unwrap());
    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.acquired, vec![key(1)]);
}

#[test(tokio::test(start_paused = true))]
async fn test_renew_hands_over_one_partition_at_a_time() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::with_defaults());
    let a = fixture_with(4, CoordinatorConfig::default(), store.clone());
    let b = fixture_with(4, CoordinatorConfig::default(), store.clone());

    completed(a.coordinator.discovery_tick().await);
    assert_eq!(a.coordinator.owned_count(), 4);

    // B is denied everywhere and told to come back shortly.
    let report = completed(b.coordinator.discovery_tick().await);
    assert!(report.acquired.is_empty());
    let soon = Instant::now() + Duration::from_secs(5);
    for i in 0..4 {
        assert!(b.coordinator.next_rebid(&key(i)).unwrap() <= soon);
    }

    for round in 1..=2 {
        // B keeps coming back while it is owed a partition.
        completed(b.coordinator.rebid_tick().await);
        let report = completed(a.coordinator.renew_tick().await);
        assert_eq!(report.lost.len(), 1, "round {}", round);
        let handed = report.lost[0].clone();

        // The lease went straight to B; no partition is ever without one.
        let holder = store.holder(&handed).await.unwrap().unwrap();
        assert_eq!(holder.holder, b.coordinator.process_id());
        for i in 0..4 {
            assert!(store.holder(&key(i)).await.unwrap().is_some());
        }

        // Nothing more is given up until the cooldown has passed.
        assert!(completed(a.coordinator.renew_tick().await).lost.is_empty());
        assert_eq!(a.coordinator.owned_count(), 4 - round);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let report = completed(b.coordinator.rebid_tick().await);
        assert_eq!(report.acquired, vec![handed.clone()]);
        assert_eq!(b.coordinator.lease_of(&handed), Some(holder.lease_id));

        tokio::time::sleep(Duration::from_secs(15)).await;
    }

    assert_eq!(a.coordinator.owned_count(), 2);
    assert_eq!(b.coordinator.owned_count(), 2);

    // Even loads sit inside the margin: nothing moves any more.
    assert!(completed(a.coordinator.renew_tick().await).lost.is_empty());
    assert!(completed(b.coordinator.renew_tick().await).lost.is_empty());

    let kept = a.coordinator.owned_partitions();
    assert!(b.coordinator.owned_partitions().iter().all(|k| !kept.contains(k)));
}

#[test(tokio::test(start_paused = true))]
async fn test_denied_bid_is_placed_again_when_due() {
    let f = fixture(1);
    let other = ProcessId::new();
    f.store
        .acquire(&key(0), Bid::new(other, DEFAULT_WEIGHT), Duration::from_secs(60))
        .await
        .unwrap();

    // An equal bidder is not owed the lease: come back once it lapses.
    let report = completed(f.coordinator.discovery_tick().await);
    assert!(report.acquired.is_empty());
    let due = f.coordinator.next_rebid(&key(0)).unwrap();
    assert!(due > Instant::now() + Duration::from_secs(59));
    assert!(due <= Instant::now() + Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(completed(f.coordinator.rebid_tick().await).examined, 0);

    // The holder never renewed. The re-bid wins it without waiting for discovery.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let report = completed(f.coordinator.rebid_tick().await);
    assert_eq!(report.examined, 1);
    assert_eq!(report.acquired, vec![key(0)]);
    assert!(f.coordinator.next_rebid(&key(0)).is_none());
    assert_eq!(f.transport.consumers_on("order_0"), 1);
}

#[test(tokio::test(start_paused = true))]
async fn test_slow_renewals_run_side_by_side() {
    let (f, faulty) = faulty_fixture(6, CoordinatorConfig::default());
    completed(f.coordinator.discovery_tick().await);
    assert_eq!(f.coordinator.owned_count(), 6);
    faulty.set_delay(Duration::from_secs(3));

    let started = Instant::now();
    let first = tokio::spawn({
        let coordinator = f.coordinator.clone();
        async move { coordinator.renew_tick().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(f.coordinator.renew_tick().await.is_skipped());
    assert_eq!(f.coordinator.metrics().snapshot().skipped("renew"), 1);

    let report = completed(first.await.unwrap());
    assert_eq!(report.examined, 6);
    assert!(report.lost.is_empty());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(faulty.max_in_flight(), 6);
    assert_eq!(f.coordinator.owned_count(), 6);
}

#[test(tokio::test(start_paused = true))]
async fn test_partition_given_up_before_lease_can_lapse() {
    let f = fixture(1);
    completed(f.coordinator.discovery_tick().await);

    tokio::time::sleep(Duration::from_secs(30)).await;
    completed(f.coordinator.renew_tick().await);
    let expires_in = f.coordinator.consumers()[0].expires_in;
    assert!(expires_in <= Duration::from_secs(55));
    assert!(expires_in > Duration::from_secs(54));

    // No further renewals: the deadline passes first.
    tokio::time::sleep(Duration::from_secs(54)).await;
    assert_eq!(f.coordinator.owned_count(), 1);
    assert!(wait_for_condition(|| f.coordinator.owned_count() == 0, Duration::from_secs(2)).await);
    assert!(wait_for_condition(|| f.transport.consumers_on("order_0") == 0, Duration::from_secs(1)).await);
    assert_eq!(f.coordinator.metrics().leases_lost.get(), 1);

    // The store still counts the lease as ours.
    let holder = f.store.holder(&key(0)).await.unwrap().unwrap();
    assert_eq!(holder.holder, f.coordinator.process_id());
}

#[test(tokio::test(start_paused = true))]
async fn test_overlapping_tick_is_skipped() {
    let (f, faulty) = faulty_fixture(1, CoordinatorConfig::default());
    faulty.set_delay(Duration::from_secs(2));

    let first = tokio::spawn({
        let coordinator = f.coordinator.clone();
        async move { coordinator.discovery_tick().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.coordinator.partition_state(&key(0)), PartitionState::Bidding);

    assert!(f.coordinator.discovery_tick().await.is_skipped());
    assert_eq!(f.coordinator.metrics().snapshot().skipped("discovery"), 1);

    let report = completed(first.await.unwrap());
    assert_eq!(report.acquired, vec![key(0)]);
    assert_eq!(faulty.acquire_calls(), 1);
    assert_eq!(faulty.max_in_flight(), 1);

    // Other activities are not blocked by discovery.
    assert!(!f.coordinator.renew_tick().await.is_skipped());
}

#[test(tokio::test(start_paused = true))]
async fn test_lease_call_timeout_counts_as_failure() {
    let config = CoordinatorConfig::default().with_lease_call_timeout(Duration::from_secs(1));
    let (f, faulty) = faulty_fixture(2, config);
    faulty.set_delay(Duration::from_secs(5));

    let report = completed(f.coordinator.discovery_tick().await);
    assert!(report.acquired.is_empty());
    assert_eq!(report.failures.len(), 2);
    assert_eq!(f.coordinator.owned_count(), 0);
    assert_eq!(f.coordinator.metrics().bid_errors.get(), 2);
    assert_eq!(f.transport.opened_count(), 0);
}

#[test(tokio::test)]
async fn test_store_outage_acquires_nothing() {
    let (f, faulty) = faulty_fixture(2, CoordinatorConfig::default());
    faulty.set_unavailable(true);

    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(f.coordinator.owned_count(), 0);

    faulty.set_unavailable(false);
    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.acquired.len(), 2);
}

#[test(tokio::test)]
async fn test_worker_start_failure_releases_lease() {
    let f = fixture(2);
    f.transport.set_unavailable(true);

    let report = completed(f.coordinator.discovery_tick().await);
    assert!(report.acquired.is_empty());
    assert_eq!(report.failures.len(), 2);
    assert_eq!(f.coordinator.owned_count(), 0);
    assert_eq!(f.coordinator.metrics().worker_start_failures.get(), 2);
    for i in 0..2 {
        assert!(f.store.holder(&key(i)).await.unwrap().is_none());
    }

    f.transport.set_unavailable(false);
    let report = completed(f.coordinator.discovery_tick().await);
    assert_eq!(report.acquired.len(), 2);
}

#[test(tokio::test)]
async fn test_health_recovers_dead_consumers() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;

    let report = completed(f.coordinator.health_tick().await);
    assert_eq!(report.examined, 2);
    assert!(!report.is_eventful());

    f.transport.kill_channels();
    assert!(wait_for_condition(
        || f
            .coordinator
            .consumers()
            .iter()
            .all(|c| c.worker.state == WorkerState::Unhealthy),
        Duration::from_secs(5)
    )
    .await);

    let mut report = completed(f.coordinator.health_tick().await);
    report.recovered.sort();
    assert_eq!(report.recovered, vec![key(0), key(1)]);
    assert!(report.retired.is_empty());

    assert_eq!(f.coordinator.owned_count(), 2);
    assert_eq!(f.transport.consumers_on("order_0"), 1);
    assert_eq!(f.transport.consumers_on("order_1"), 1);
    for consumer in f.coordinator.consumers() {
        assert_eq!(consumer.worker.state, WorkerState::Running);
        assert_eq!(consumer.worker.restarts, 1);
    }
}

#[test(tokio::test(start_paused = true))]
async fn test_overlapping_health_tick_is_skipped() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;

    f.transport.kill_channels();
    assert!(wait_for_condition(
        || f
            .coordinator
            .consumers()
            .iter()
            .all(|c| c.worker.state == WorkerState::Unhealthy),
        Duration::from_secs(5)
    )
    .await);
    f.transport.set_open_delay(Duration::from_secs(2));

    let started = Instant::now();
    let first = tokio::spawn({
        let coordinator = f.coordinator.clone();
        async move { coordinator.health_tick().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(f.coordinator.health_tick().await.is_skipped());
    assert_eq!(f.coordinator.metrics().snapshot().skipped("health"), 1);

    let report = completed(first.await.unwrap());
    assert_eq!(report.recovered, vec![key(0), key(1)]);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test(tokio::test(start_paused = true))]
async fn test_timed_out_probes_count_toward_retirement() {
    let config = CoordinatorConfig::default()
        .with_max_recovery_attempts(2)
        .with_health_check_timeout(Duration::from_secs(1));
    let f = fixture_with(1, config, Arc::new(MemoryLeaseStore::with_defaults()));
    f.coordinator.discovery_tick().await;

    f.transport.kill_channels();
    assert!(wait_for_condition(
        || f.coordinator.consumers()[0].worker.state == WorkerState::Unhealthy,
        Duration::from_secs(5)
    )
    .await);
    f.transport.set_open_delay(Duration::from_secs(10));

    let report = completed(f.coordinator.health_tick().await);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("timed out"));
    assert!(report.retired.is_empty());

    let report = completed(f.coordinator.health_tick().await);
    assert_eq!(report.retired, vec![key(0)]);
    assert!(f.store.holder(&key(0)).await.unwrap().is_none());
    assert_eq!(f.coordinator.metrics().snapshot().health_failures, 2);
}

#[test(tokio::test)]
async fn test_unrecoverable_worker_is_retired() {
    let config = CoordinatorConfig::default().with_max_recovery_attempts(2);
    let f = fixture_with(1, config, Arc::new(MemoryLeaseStore::with_defaults()));
    f.coordinator.discovery_tick().await;

    f.transport.set_unavailable(true);
    f.transport.kill_channels();
    assert!(wait_for_condition(
        || f.coordinator.consumers()[0].worker.state == WorkerState::Unhealthy,
        Duration::from_secs(5)
    )
    .await);

    let report = completed(f.coordinator.health_tick().await);
    assert_eq!(report.failures.len(), 1);
    assert!(report.retired.is_empty());
    assert_eq!(f.coordinator.owned_count(), 1);

    let report = completed(f.coordinator.health_tick().await);
    assert_eq!(report.retired, vec![key(0)]);
    assert_eq!(f.coordinator.owned_count(), 0);
    assert!(f.store.holder(&key(0)).await.unwrap().is_none());

    let snapshot = f.coordinator.metrics().snapshot();
    assert_eq!(snapshot.health_failures, 2);
    assert_eq!(snapshot.workers_retired, 1);
}

#[test(tokio::test)]
async fn test_stop_is_idempotent_and_leaves_leases_to_expire() {
    let f = fixture(2);
    f.coordinator.discovery_tick().await;
    let closes_before = f.transport.close_count();

    f.coordinator.stop().await;
    assert_eq!(f.coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(f.coordinator.owned_count(), 0);
    assert_eq!(f.transport.consumers_on("order_0"), 0);
    assert_eq!(f.transport.consumers_on("order_1"), 0);
    let closes = f.transport.close_count();
    assert_eq!(closes - closes_before, 2);

    f.coordinator.stop().await;
    assert_eq!(f.transport.close_count(), closes);

    // Not released: the leases lapse on their own.
    for i in 0..2 {
        assert!(f.store.holder(&key(i)).await.unwrap().is_some());
    }

    // A stopped coordinator takes nothing new.
    let report = completed(f.coordinator.discovery_tick().await);
    assert!(report.acquired.is_empty());
    assert!(f.coordinator.start().await.is_err());
}

#[test(tokio::test)]
async fn test_release_on_stop_frees_partitions() {
    let config = CoordinatorConfig::default().with_release_on_stop(true);
    let f = fixture_with(2, config, Arc::new(MemoryLeaseStore::with_defaults()));
    f.coordinator.discovery_tick().await;

    f.coordinator.stop().await;
    for i in 0..2 {
        assert!(f.store.holder(&key(i)).await.unwrap().is_none());
    }
}

#[test(tokio::test)]
async fn test_stop_lets_inflight_delivery_finish() {
    let config = CoordinatorConfig::default()
        .with_worker_config(WorkerConfig::default().with_close_timeout(Duration::from_secs(5)));
    let f = fixture_with(1, config, Arc::new(MemoryLeaseStore::with_defaults()));
    f.coordinator.discovery_tick().await;

    f.handler.set_delay(Duration::from_millis(200));
    let tag = f.transport.push("order_0", "payload");
    assert!(wait_for_condition(|| f.handler.started_count() == 1, Duration::from_secs(5)).await);

    f.coordinator.stop().await;
    assert_eq!(f.handler.handled_count(), 1);
    assert_eq!(f.transport.acked(), vec![("order_0".to_string(), tag)]);
}

#[test(tokio::test(start_paused = true))]
async fn test_concurrent_stop_waits_for_the_first() {
    let config = CoordinatorConfig::default()
        .with_worker_config(WorkerConfig::default().with_close_timeout(Duration::from_secs(5)));
    let f = fixture_with(1, config, Arc::new(MemoryLeaseStore::with_defaults()));
    f.coordinator.discovery_tick().await;

    f.handler.set_delay(Duration::from_secs(2));
    let tag = f.transport.push("order_0", "payload");
    assert!(wait_for_condition(|| f.handler.started_count() == 1, Duration::from_secs(1)).await);

    let first = tokio::spawn({
        let coordinator = f.coordinator.clone();
        async move { coordinator.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.coordinator.state(), CoordinatorState::ShuttingDown);

    f.coordinator.stop().await;
    assert_eq!(f.coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(f.handler.handled_count(), 1);
    assert_eq!(f.transport.acked(), vec![("order_0".to_string(), tag)]);
    assert_eq!(f.transport.consumers_on("order_0"), 0);

    first.await.unwrap();
}

#[test(tokio::test(start_paused = true))]
async fn test_grant_during_shutdown_is_released() {
    let (f, faulty) = faulty_fixture(2, CoordinatorConfig::default());
    faulty.set_delay(Duration::from_secs(1));

    let tick = tokio::spawn({
        let coordinator = f.coordinator.clone();
        async move { coordinator.discovery_tick().await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.coordinator.partition_state(&key(0)), PartitionState::Bidding);

    f.coordinator.stop().await;
    assert_eq!(f.coordinator.state(), CoordinatorState::Stopped);

    let report = completed(tick.await.unwrap());
    assert!(report.acquired.is_empty());
    assert_eq!(report.examined, 1);
    assert_eq!(f.coordinator.owned_count(), 0);
    assert_eq!(f.transport.opened_count(), 0);
    for i in 0..2 {
        assert!(f.store.holder(&key(i)).await.unwrap().is_none());
    }
}

#[test(tokio::test(start_paused = true))]
async fn test_start_declares_and_runs_timers() {
    let f = fixture(3);
    f.coordinator.start().await.unwrap();
    assert_eq!(f.coordinator.state(), CoordinatorState::Running);
    assert_eq!(
        f.transport.declared(),
        vec![("orders".to_string(), "direct".to_string(), true)]
    );
    assert!(f.coordinator.start().await.is_err());

    // The first discovery tick fires after the initial delay.
    assert!(wait_for_condition(|| f.coordinator.owned_count() == 3, Duration::from_secs(5)).await);

    // Renewals keep the leases alive well past one TTL.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(f.coordinator.owned_count(), 3);
    assert!(f.coordinator.metrics().renewals_total.get() >= 3 * 14);

    f.coordinator.stop().await;
    assert_eq!(f.coordinator.owned_count(), 0);
}

#[test(tokio::test)]
async fn test_start_fails_when_broker_unavailable() {
    let f = fixture(1);
    f.transport.set_unavailable(true);

    assert!(f.coordinator.start().await.is_err());
    assert_eq!(f.coordinator.state(), CoordinatorState::Stopped);
}
