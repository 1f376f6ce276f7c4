use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use trip_monitor::clock::ManualClock;
use trip_monitor::config::{MonitorConfig, OverridesFile, ThresholdOverrides};
use trip_monitor::error::{MonitorError, Result};
use trip_monitor::geometry::destination;
use trip_monitor::hub::Event;
use trip_monitor::model::{AlertKind, Position, Route, TripId, TripStatus, Waypoint};
use trip_monitor::monitor::Monitor;
use trip_monitor::scheduler::Scheduler;
use trip_monitor::sink::{
    JsonDirStateRepository, MemoryAlertSink, MemoryStateRepository, StateRepository,
};
use trip_monitor::source::{MemoryTripSource, TripSource};

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// East along the equator, about 11 km.
fn route() -> Route {
    Route::new(vec![Waypoint::new(0.0, 0.0), Waypoint::new(0.0, 0.05), Waypoint::new(0.0, 0.1)])
}

/// A sample `meters` north of the route at `minutes` past the start.
fn sample(minutes: i64, meters: f64, speed: f64) -> Position {
    let point = destination(Waypoint::new(0.0, 0.03), 0.0, meters);
    Position {
        timestamp: t(minutes),
        latitude: point.latitude,
        longitude: point.longitude,
        speed: Some(speed),
        ignition: speed > 0.0,
    }
}

struct Harness {
    source: Arc<MemoryTripSource>,
    sink: Arc<MemoryAlertSink>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
}

impl Harness {
    fn new(config: MonitorConfig) -> Self {
        Self::with_source(Arc::new(MemoryTripSource::new()), config)
    }

    fn with_source(source: Arc<MemoryTripSource>, config: MonitorConfig) -> Self {
        Self::build(source.clone(), source, Arc::new(MemoryStateRepository::new()), config)
    }

    fn build(
        source: Arc<MemoryTripSource>,
        upstream: Arc<dyn TripSource>,
        repository: Arc<dyn StateRepository>,
        config: MonitorConfig,
    ) -> Self {
        let sink = Arc::new(MemoryAlertSink::new());
        let clock = Arc::new(ManualClock::new(t(0)));
        let monitor =
            Monitor::new(upstream, sink.clone(), repository, config).with_clock(clock.clone());
        Self { source, sink, clock, scheduler: Scheduler::new(Arc::new(monitor)) }
    }

    fn start(&self, id: &str) -> TripId {
        let trip = TripId::from(id);
        self.source.insert_trip(trip.clone(), TripStatus::InProgress, Some(route()));
        trip
    }

    fn kinds(&self, trip: &TripId) -> Vec<AlertKind> {
        self.sink.alerts_for(trip).iter().map(|a| a.kind).collect()
    }
}

#[tokio::test]
async fn test_deviation_lifecycle_across_ticks() {
    let mut h = Harness::new(MonitorConfig::default());
    let trip = h.start("SM-0001");
    h.scheduler.tick().await;
    let mut events = h.scheduler.monitor().subscribe_trip(&trip).await;

    for (minute, meters) in [(0, 50.0), (1, 400.0), (2, 420.0), (3, 410.0), (4, 100.0)] {
        h.clock.set(t(minute));
        h.source.report_position(&trip, sample(minute, meters, 40.0));
        h.scheduler.tick().await;
    }

    assert_eq!(
        h.kinds(&trip),
        vec![AlertKind::DeviationStart, AlertKind::DeviationContinue, AlertKind::DeviationEnd]
    );
    let alerts = h.sink.alerts_for(&trip);
    assert_eq!(alerts[0].timestamp, t(1));
    assert_eq!(alerts[1].payload.duration_secs, Some(120));
    assert_eq!(alerts[2].payload.duration_secs, Some(180));

    let mut updates = 0;
    let mut streamed = Vec::new();
    while let Some(event) = events.try_recv() {
        match &*event {
            Event::PositionUpdate(_) => updates += 1,
            Event::Alert(alert) => streamed.push(alert.kind),
            Event::FleetSnapshot(_) => panic!("fleet batches are not sent to trip channels"),
        }
    }
    assert_eq!(updates, 5);
    assert_eq!(streamed, h.kinds(&trip));
}

#[tokio::test]
async fn test_stop_lifecycle_with_reminder() {
    let mut h = Harness::new(MonitorConfig::default());
    let trip = h.start("SM-0002");

    h.source.report_position(&trip, sample(0, 0.0, 30.0));
    h.scheduler.tick().await;
    for minute in 1..=11 {
        h.source.report_position(&trip, sample(minute, 0.0, 0.0));
        h.scheduler.tick().await;
    }
    h.source.report_position(&trip, sample(12, 0.0, 25.0));
    h.scheduler.tick().await;

    assert_eq!(
        h.kinds(&trip),
        vec![AlertKind::StopStart, AlertKind::StopContinue, AlertKind::StopEnd]
    );
    let alerts = h.sink.alerts_for(&trip);
    assert_eq!(alerts[0].timestamp, t(6));
    assert_eq!(alerts[1].timestamp, t(11));
    assert_eq!(alerts[2].payload.duration_secs, Some(11 * 60));

    let track = h.scheduler.monitor().store().track(&trip).await;
    assert_eq!(track.len(), 13);
    assert_eq!(track.last().unwrap().timestamp, t(12));
}

#[tokio::test]
async fn test_deviation_and_stop_in_same_tick_are_ordered() {
    let mut h = Harness::new(MonitorConfig::default());
    let trip = h.start("SM-0003");

    for minute in 0..5 {
        h.source.report_position(&trip, sample(minute, 0.0, 0.0));
        h.scheduler.tick().await;
    }
    h.source.report_position(&trip, sample(5, 800.0, 0.0));
    let stats = h.scheduler.tick().await;

    assert_eq!(stats.alerts, 2);
    assert_eq!(h.kinds(&trip), vec![AlertKind::DeviationStart, AlertKind::StopStart]);
}

/// Fails every position fetch for one trip.
struct BrokenTrip {
    inner: Arc<MemoryTripSource>,
    broken: TripId,
}

#[async_trait]
impl TripSource for BrokenTrip {
    async fn active_trips(&self) -> Result<Vec<TripId>> {
        self.inner.active_trips().await
    }

    async fn latest_position(&self, trip_id: &TripId) -> Result<Option<Position>> {
        if *trip_id == self.broken {
            return Err(MonitorError::UpstreamFetchFailure("connection reset".to_string()));
        }
        self.inner.latest_position(trip_id).await
    }

    async fn route(&self, trip_id: &TripId) -> Result<Option<Route>> {
        self.inner.route(trip_id).await
    }

    async fn tolerance(&self, trip_id: &TripId) -> Result<Option<f64>> {
        self.inner.tolerance(trip_id).await
    }
}

#[tokio::test]
async fn test_failing_trip_does_not_block_others() {
    let source = Arc::new(MemoryTripSource::new());
    let broken = TripId::from("A");
    let upstream = Arc::new(BrokenTrip { inner: source.clone(), broken: broken.clone() });
    let mut h = Harness::build(
        source,
        upstream,
        Arc::new(MemoryStateRepository::new()),
        MonitorConfig::default(),
    );

    let a = h.start("A");
    let b = h.start("B");
    let c = TripId::from("C");
    let single_point = Route::new(vec![Waypoint::new(0.0, 0.0)]);
    h.source.insert_trip(c.clone(), TripStatus::InProgress, Some(single_point));

    h.source.report_position(&a, sample(0, 900.0, 40.0));
    h.source.report_position(&b, sample(0, 900.0, 40.0));
    h.source.report_position(&c, sample(0, 900.0, 40.0));
    let stats = h.scheduler.tick().await;

    assert_eq!(stats.upstream_failures, 1);
    assert_eq!(stats.evaluated, 2);
    assert!(h.kinds(&a).is_empty());
    assert_eq!(h.kinds(&b), vec![AlertKind::DeviationStart]);
    // A single-waypoint route cannot be evaluated: no deviation.
    assert!(h.kinds(&c).is_empty());
    assert_eq!(h.scheduler.monitor().store().snapshot(&a).await.unwrap().last_position, None);
}

#[tokio::test]
async fn test_out_of_order_sample_is_ignored() {
    let mut h = Harness::new(MonitorConfig::default());
    let trip = h.start("SM-0004");

    h.source.report_position(&trip, sample(5, 0.0, 40.0));
    h.scheduler.tick().await;
    let before = h.scheduler.monitor().store().snapshot(&trip).await.unwrap();

    h.source.report_position(&trip, sample(2, 900.0, 40.0));
    let stats = h.scheduler.tick().await;

    assert_eq!(stats.skipped_stale, 1);
    assert_eq!(h.scheduler.monitor().store().snapshot(&trip).await.unwrap(), before);
    assert!(h.kinds(&trip).is_empty());
}

#[tokio::test]
async fn test_trip_overrides_and_upstream_tolerance() {
    let mut overrides = OverridesFile::default();
    overrides.trips.insert(
        "lenient".to_string(),
        ThresholdOverrides { tolerance_meters: Some(1_000.0), ..ThresholdOverrides::default() },
    );
    let config = MonitorConfig { overrides, ..MonitorConfig::default() };
    let mut h = Harness::new(config);

    let lenient = h.start("lenient");
    let strict = h.start("strict");
    h.source.set_tolerance(&strict, Some(100.0));

    h.source.report_position(&lenient, sample(0, 600.0, 40.0));
    h.source.report_position(&strict, sample(0, 150.0, 40.0));
    h.scheduler.tick().await;

    assert!(h.kinds(&lenient).is_empty());
    assert_eq!(h.kinds(&strict), vec![AlertKind::DeviationStart]);
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test]
async fn test_state_survives_restart_and_completed_trip_is_archived() {
    let dir = temp_dir("trip_monitor_it_restart");
    let source = Arc::new(MemoryTripSource::new());

    let trip = {
        let mut h = Harness::build(
            source.clone(),
            source.clone(),
            Arc::new(JsonDirStateRepository::new(&dir)),
            MonitorConfig::default(),
        );
        let trip = h.start("SM-0005");
        h.source.report_position(&trip, sample(0, 700.0, 40.0));
        h.scheduler.tick().await;
        assert_eq!(h.kinds(&trip), vec![AlertKind::DeviationStart]);
        trip
    };

    // A new process picks up the deviation and its cooldown.
    let mut h = Harness::build(
        source.clone(),
        source.clone(),
        Arc::new(JsonDirStateRepository::new(&dir)),
        MonitorConfig::default(),
    );
    assert_eq!(h.scheduler.monitor().restore().await.unwrap(), 1);

    h.source.report_position(&trip, sample(1, 700.0, 40.0));
    h.scheduler.tick().await;
    assert!(h.kinds(&trip).is_empty());

    h.source.report_position(&trip, sample(2, 700.0, 40.0));
    h.scheduler.tick().await;
    assert_eq!(h.kinds(&trip), vec![AlertKind::DeviationContinue]);

    h.source.set_status(&trip, TripStatus::Completed);
    let stats = h.scheduler.tick().await;
    assert_eq!(stats.deactivated, 1);
    assert!(!h.scheduler.monitor().store().contains(&trip));
    assert!(!dir.join("SM-0005.json").exists());
    assert_eq!(std::fs::read_dir(dir.join("archive")).unwrap().count(), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_fleet_subscriber_gets_snapshot_then_live_updates() {
    let mut h = Harness::new(MonitorConfig::default());
    let a = h.start("A");
    let b = h.start("B");
    h.source.report_position(&a, sample(0, 0.0, 40.0));
    h.scheduler.tick().await;

    let mut fleet = h.scheduler.monitor().subscribe_fleet().await;
    let Event::FleetSnapshot(snapshot) = &*fleet.recv().await.unwrap() else {
        panic!("expected the initial snapshot");
    };
    assert_eq!(snapshot.iter().map(|u| u.trip_id.clone()).collect::<Vec<_>>(), vec![a.clone()]);

    h.source.report_position(&b, sample(1, 0.0, 40.0));
    h.scheduler.tick().await;

    let Event::PositionUpdate(update) = &*fleet.recv().await.unwrap() else {
        panic!("expected a live update");
    };
    assert_eq!(update.trip_id, b);
    let Event::FleetSnapshot(batch) = &*fleet.recv().await.unwrap() else {
        panic!("expected the tick batch");
    };
    assert_eq!(batch.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_runs_on_cadence() {
    let config =
        MonitorConfig { tick_interval: StdDuration::from_secs(30), ..MonitorConfig::default() };
    let mut h = Harness::new(config);
    h.start("A");

    let shutdown = tokio::time::sleep(StdDuration::from_secs(100));
    h.scheduler.run(0, shutdown).await;
    // 0s, 30s, 60s, 90s
    assert_eq!(h.scheduler.ticks(), 4);
}
