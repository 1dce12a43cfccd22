use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use symbion_devkit::{FleetMessageBuilder, SampleBuilder, TestHarness, HARNESS_NOW_MS};
use symbion_fleet_sync::clock::from_epoch_ms;
use symbion_fleet_sync::{
    ConnectionStatus, FetchError, MetricFamily, SeriesQuery, SourceRef, SubscriptionKey, TimeRange, ViewMode,
};

const MINUTE_MS: i64 = 60_000;

fn cpu_query(mode: ViewMode, range: TimeRange) -> SeriesQuery {
    SeriesQuery {
        source: SourceRef::server(1),
        family: MetricFamily::Cpu,
        mode,
        range,
    }
}

#[tokio::test]
async fn test_push_reaches_metric_subscribers() {
    let harness = TestHarness::new();
    harness
        .history
        .respond_with(vec![SampleBuilder::cpu(HARNESS_NOW_MS - 2 * MINUTE_MS, 10.0)]);
    let engine = harness.started_engine().await;
    harness.wait_connected(1_000).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _handle = engine.subscribe_to_metrics(1, MetricFamily::Cpu, move |samples| {
        sink.lock().push(samples.len());
    });
    engine.ensure_initial_metrics(1, MetricFamily::Cpu).await.unwrap();
    // seeded buffer delivered once
    assert_eq!(*received.lock(), vec![1]);

    harness
        .send(&FleetMessageBuilder::server_metrics(1, HARNESS_NOW_MS - MINUTE_MS, 20.0, 1, 2))
        .unwrap();
    // another server's metrics are not ours
    harness
        .send(&FleetMessageBuilder::server_metrics(2, HARNESS_NOW_MS - MINUTE_MS, 99.0, 1, 2))
        .unwrap();
    harness
        .wait_until(1_000, || received.lock().len() == 2)
        .await
        .unwrap();

    let key = SubscriptionKey::server(1, MetricFamily::Cpu);
    assert_eq!(engine.subscriptions().read(&key).len(), 2);
    assert_eq!(*received.lock(), vec![1, 1]);

    // the same push replayed adds nothing
    harness
        .send(&FleetMessageBuilder::server_metrics(1, HARNESS_NOW_MS - MINUTE_MS, 20.0, 1, 2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().len(), 2);
    assert_eq!(engine.subscriptions().read(&key).len(), 2);
}

#[tokio::test]
async fn test_concurrent_consumers_share_one_seed() {
    let harness = TestHarness::new();
    let reply = harness.history.defer();
    let engine = harness.started_engine().await;
    let key = SubscriptionKey::server(1, MetricFamily::Memory);

    let handles: Vec<_> = (0..3)
        .map(|_| engine.subscribe_to_metrics(1, MetricFamily::Memory, |_| {}))
        .collect();
    assert_eq!(engine.subscriptions().refcount(&key), 3);

    let (a, b, c, ()) = tokio::join!(
        engine.ensure_initial_metrics(1, MetricFamily::Memory),
        engine.ensure_initial_metrics(1, MetricFamily::Memory),
        engine.ensure_initial_metrics(1, MetricFamily::Memory),
        async move {
            tokio::task::yield_now().await;
            reply.resolve(vec![
                SampleBuilder::memory(HARNESS_NOW_MS - 3 * MINUTE_MS, 512, 1_024),
                SampleBuilder::memory(HARNESS_NOW_MS - 2 * MINUTE_MS, 768, 1_024),
            ]);
        }
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(harness.history.call_count(), 1);
    assert_eq!(engine.subscriptions().seed_fetches(), 1);
    assert!(engine.subscriptions().is_seeded(&key));

    // already seeded: no new request
    engine.ensure_initial_metrics(1, MetricFamily::Memory).await.unwrap();
    assert_eq!(harness.history.call_count(), 1);
    assert_eq!(engine.subscriptions().active_registrations(), 1);

    drop(handles);
    assert_eq!(engine.subscriptions().refcount(&key), 0);
    assert_eq!(engine.subscriptions().active_registrations(), 0);
}

#[tokio::test]
async fn test_monitor_seed_and_push() {
    let harness = TestHarness::new();
    harness.history.respond_with(vec![
        SampleBuilder::probe_sample(7, 1, HARNESS_NOW_MS - 2 * MINUTE_MS, true, 12.0),
        SampleBuilder::probe_sample(7, 2, HARNESS_NOW_MS - 2 * MINUTE_MS, true, 30.0),
    ]);
    let engine = harness.started_engine().await;
    harness.wait_connected(1_000).await.unwrap();

    let pushes = Arc::new(Mutex::new(0usize));
    let counter = pushes.clone();
    let _handle = engine.subscribe_to_monitor_results(7, move |_| *counter.lock() += 1);
    engine.ensure_initial_monitor_results(7).await.unwrap();

    let calls = harness.history.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, SourceRef::monitor(7));
    assert_eq!(calls[0].family, MetricFamily::Latency);
    assert_eq!(calls[0].limit, Some(600));
    assert_eq!(calls[0].end, from_epoch_ms(HARNESS_NOW_MS));
    assert_eq!(calls[0].start, from_epoch_ms(HARNESS_NOW_MS - 5 * MINUTE_MS));

    harness
        .send(&FleetMessageBuilder::service_monitor_result(
            7,
            2,
            "agent-2",
            HARNESS_NOW_MS - MINUTE_MS,
            false,
            0.0,
        ))
        .unwrap();
    // a different monitor
    harness
        .send(&FleetMessageBuilder::service_monitor_result(8, 2, "agent-2", HARNESS_NOW_MS, true, 1.0))
        .unwrap();
    harness.wait_until(1_000, || *pushes.lock() == 2).await.unwrap();

    let feed = engine
        .get_series(SeriesQuery {
            source: SourceRef::monitor(7),
            family: MetricFamily::Latency,
            mode: ViewMode::Realtime,
            range: TimeRange::Last5m,
        })
        .await;
    let data = feed.state().data;
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].get("agent-1"), Some(12.0));
    assert_eq!(data[0].get("agent-2"), Some(30.0));
    // the down result is a gap for agent-2, agent-1 carries forward
    assert_eq!(data[1].get("agent-1"), Some(12.0));
    assert_eq!(data[1].get("agent-2"), None);
}

#[tokio::test]
async fn test_monitor_has_no_metric_series() {
    let harness = TestHarness::new();
    let engine = harness.started_engine().await;

    let feed = engine
        .get_series(SeriesQuery {
            source: SourceRef::monitor(7),
            family: MetricFamily::Cpu,
            mode: ViewMode::Realtime,
            range: TimeRange::Last5m,
        })
        .await;
    let state = feed.state();
    assert!(!state.loading);
    assert!(state.error.is_some());
    assert_eq!(harness.history.call_count(), 0);
    assert_eq!(engine.subscriptions().active_registrations(), 0);
}

#[tokio::test]
async fn test_switch_to_historical_releases_the_push_listener_first() {
    let harness = TestHarness::new();
    harness.history.respond_with(vec![
        SampleBuilder::cpu(HARNESS_NOW_MS - 2 * MINUTE_MS, 10.0),
        SampleBuilder::cpu(HARNESS_NOW_MS - MINUTE_MS, 15.0),
    ]);
    let engine = harness.started_engine().await;

    let feed = engine
        .get_series(cpu_query(ViewMode::Realtime, TimeRange::Last10m))
        .await;
    assert_eq!(feed.state().data.len(), 2);
    assert!(!feed.state().loading);
    assert_eq!(engine.subscriptions().active_registrations(), 1);

    let reply = harness.history.defer();
    let switching = tokio::spawn({
        let feed = feed.clone();
        async move {
            feed.set_query(cpu_query(ViewMode::Historical, TimeRange::Last1h))
                .await
        }
    });
    harness.wait_until(1_000, || harness.history.in_flight() == 1).await.unwrap();

    // no push listener left while the historical request is pending
    assert_eq!(engine.subscriptions().active_registrations(), 0);
    let pending = feed.state();
    assert!(pending.loading);
    assert_eq!(pending.data.len(), 2);

    reply.resolve(vec![
        SampleBuilder::cpu(HARNESS_NOW_MS - 50 * MINUTE_MS, 1.0),
        SampleBuilder::cpu(HARNESS_NOW_MS - 40 * MINUTE_MS, 2.0),
        SampleBuilder::cpu(HARNESS_NOW_MS - 30 * MINUTE_MS, 3.0),
    ]);
    switching.await.unwrap();

    let state = feed.state();
    assert!(!state.loading);
    assert_eq!(state.error, None);
    assert_eq!(state.data.len(), 3);
    assert_eq!(state.data[2].get("cpu"), Some(3.0));
    assert_eq!(feed.historical_fetches(), 1);

    let request = harness.history.calls().pop().unwrap();
    assert_eq!(request.interval, Some(Duration::from_secs(60)));
    assert_eq!(request.limit, None);
    assert_eq!(request.start, from_epoch_ms(HARNESS_NOW_MS - 60 * MINUTE_MS));
    // the realtime buffer is untouched by historical data
    assert_eq!(
        engine
            .subscriptions()
            .read(&SubscriptionKey::server(1, MetricFamily::Cpu))
            .len(),
        2
    );
}

#[tokio::test]
async fn test_stale_historical_response_is_dropped() {
    let harness = TestHarness::new();
    let engine = harness.started_engine().await;
    let feed = engine.series_feed();

    let first = harness.history.defer();
    let second = harness.history.defer();

    let slow = tokio::spawn({
        let feed = feed.clone();
        async move { feed.set_query(cpu_query(ViewMode::Historical, TimeRange::Last1h)).await }
    });
    harness.wait_until(1_000, || harness.history.in_flight() == 1).await.unwrap();

    let fast = tokio::spawn({
        let feed = feed.clone();
        async move { feed.set_query(cpu_query(ViewMode::Historical, TimeRange::Last6h)).await }
    });
    harness.wait_until(1_000, || harness.history.in_flight() == 2).await.unwrap();

    second.resolve(vec![SampleBuilder::cpu(HARNESS_NOW_MS - 5 * 60 * MINUTE_MS, 66.0)]);
    fast.await.unwrap();
    first.resolve(vec![SampleBuilder::cpu(HARNESS_NOW_MS - 30 * MINUTE_MS, 11.0)]);
    slow.await.unwrap();

    let state = feed.state();
    assert_eq!(state.data.len(), 1);
    assert_eq!(state.data[0].get("cpu"), Some(66.0));
    assert_eq!(feed.query().map(|q| q.range), Some(TimeRange::Last6h));
    assert_eq!(feed.historical_fetches(), 2);
}

#[tokio::test]
async fn test_failed_fetch_keeps_the_previous_series() {
    let harness = TestHarness::new();
    harness
        .history
        .respond_with(vec![SampleBuilder::cpu(HARNESS_NOW_MS - 30 * MINUTE_MS, 42.0)])
        .fail_with(FetchError::Http("502".into()));
    let engine = harness.started_engine().await;

    let feed = engine
        .get_series(cpu_query(ViewMode::Historical, TimeRange::Last1h))
        .await;
    assert_eq!(feed.state().data.len(), 1);

    feed.set_query(cpu_query(ViewMode::Historical, TimeRange::Last24h))
        .await;
    let state = feed.state();
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("HTTP error: 502"));
    assert_eq!(state.data.len(), 1);
    assert_eq!(state.data[0].get("cpu"), Some(42.0));
}

#[tokio::test]
async fn test_health_reflects_engine_state() {
    let harness = TestHarness::new();
    harness
        .history
        .respond_with(vec![SampleBuilder::cpu(HARNESS_NOW_MS - MINUTE_MS, 5.0)]);
    let engine = harness.started_engine().await;
    harness.wait_connected(1_000).await.unwrap();
    harness
        .send(&FleetMessageBuilder::full_server_list(vec![
            FleetMessageBuilder::server(1, "web", "online"),
            FleetMessageBuilder::server(2, "db", "offline"),
        ]))
        .unwrap();
    harness
        .wait_for_status(&engine, ConnectionStatus::Connected, 1_000)
        .await
        .unwrap();
    harness
        .wait_until(1_000, || engine.fleet().servers().len() == 2)
        .await
        .unwrap();

    let _handle = engine.subscribe_to_metrics(1, MetricFamily::Cpu, |_| {});
    engine.ensure_initial_metrics(1, MetricFamily::Cpu).await.unwrap();

    let health = engine.health();
    assert_eq!(health.connection_status, ConnectionStatus::Connected);
    assert_eq!(health.servers_tracked, 2);
    assert_eq!(health.active_subscriptions, 1);
    assert_eq!(health.buffered_points, 1);
    assert_eq!(health.seed_fetches, 1);
    assert_eq!(health.connect_attempts, 1);
    assert_eq!(health.reconnects, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_ensure_alone_leaves_no_push_listener() {
    let harness = TestHarness::new();
    let engine = harness.started_engine().await;
    let baseline = engine.bus().total_listeners();

    for server_id in 1..=50 {
        engine.ensure_initial_metrics(server_id, MetricFamily::Cpu).await.unwrap();
    }
    engine.ensure_initial_monitor_results(7).await.unwrap();

    assert_eq!(engine.subscriptions().active_registrations(), 0);
    assert_eq!(engine.bus().total_listeners(), baseline);
    assert_eq!(engine.health().active_subscriptions, 0);
}

#[tokio::test]
async fn test_realtime_range_change_does_not_reseed() {
    let harness = TestHarness::new();
    harness
        .history
        .set_fallback(vec![SampleBuilder::cpu(HARNESS_NOW_MS - MINUTE_MS, 3.0)]);
    let engine = harness.started_engine().await;

    let feed = engine
        .get_series(cpu_query(ViewMode::Realtime, TimeRange::Last5m))
        .await;
    assert_eq!(engine.subscriptions().seed_fetches(), 1);

    feed.set_query(cpu_query(ViewMode::Realtime, TimeRange::Last10m))
        .await;
    assert_eq!(engine.subscriptions().seed_fetches(), 1);
    assert_eq!(harness.history.call_count(), 1);
    assert_eq!(engine.subscriptions().active_registrations(), 1);
    assert_eq!(feed.state().data.len(), 1);
}
