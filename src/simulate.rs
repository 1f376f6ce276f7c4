//! Synthetic trips for exercising the engine end to end without a live
//! telemetry feed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{Clock, ManualClock};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::geometry::{destination, point_along, route_length_meters, validate_route};
use crate::model::{Alert, Position, Route, TripId, TripStatus};
use crate::monitor::Monitor;
use crate::scheduler::Scheduler;
use crate::sink::{MemoryAlertSink, MemoryStateRepository};
use crate::source::MemoryTripSource;
use crate::stats::TickStats;

pub const SIMULATED_TRIP: &str = "SIM-1";

/// Radius of the off-route loop driven in [`SimulationMode::Circle`].
const CIRCLE_RADIUS_METERS: f64 = 500.0;

/// Age of the out-of-order sample injected mid-run.
const OLD_SAMPLE_AGE_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Drive along the route at constant speed, parking at its end.
    Route,
    /// Loop around the route's first waypoint, off the route.
    Circle,
    /// Stand still at the route's first waypoint.
    Static,
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub mode: SimulationMode,
    pub speed_kmh: f64,
    pub interval: Duration,
    pub duration: Duration,
    /// Inserts a sample ten minutes older than its neighbours halfway through.
    pub inject_old: bool,
    pub start: DateTime<Utc>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Route,
            speed_kmh: 60.0,
            interval: Duration::seconds(30),
            duration: Duration::minutes(30),
            inject_old: false,
            start: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub mode: SimulationMode,
    pub positions: usize,
    pub evaluated: usize,
    pub rejected_stale: usize,
    pub alerts: Vec<Alert>,
    pub is_deviated: bool,
    pub is_stopped: bool,
}

/// Generates the samples for one simulated trip, oldest first (apart from the
/// injected out-of-order sample).
///
/// # Errors
///
/// Returns [`MonitorError::InvalidRoute`] for routes that cannot be driven and
/// [`MonitorError::Config`] for an interval under one second.
pub fn generate_positions(route: &Route, options: &SimulationOptions) -> Result<Vec<Position>> {
    validate_route(&route.waypoints)?;
    if options.interval.num_seconds() < 1 {
        return Err(MonitorError::Config(
            "simulation interval must be at least one second".to_string(),
        ));
    }
    let origin = route.waypoints[0];
    let length = route_length_meters(&route.waypoints);
    let count = options.duration.num_seconds() / options.interval.num_seconds();
    let step_meters = options.speed_kmh / 3.6 * options.interval.num_seconds() as f64;

    let mut positions = Vec::new();
    for i in 0..count {
        let timestamp = options.start + options.interval * i as i32;
        let (point, speed) = match options.mode {
            SimulationMode::Route => {
                let travelled = step_meters * i as f64;
                let point = point_along(&route.waypoints, travelled).unwrap_or(origin);
                // Starts parked and parks again on arrival.
                let speed = if i == 0 || travelled >= length { 0.0 } else { options.speed_kmh };
                (point, speed)
            }
            SimulationMode::Circle => {
                let bearing = i as f64 / count as f64 * 360.0;
                (destination(origin, bearing, CIRCLE_RADIUS_METERS), options.speed_kmh)
            }
            SimulationMode::Static => (origin, 0.0),
        };
        positions.push(Position {
            timestamp,
            latitude: point.latitude,
            longitude: point.longitude,
            speed: Some(speed),
            ignition: speed > 0.0,
        });
    }

    if options.inject_old && positions.len() >= 2 {
        let mid = positions.len() / 2;
        let mut old = positions[mid].clone();
        old.timestamp -= Duration::minutes(OLD_SAMPLE_AGE_MINUTES);
        positions.insert(mid, old);
    }
    Ok(positions)
}

/// Feeds the generated samples through a full monitor, one tick per sample,
/// with simulated time.
///
/// # Errors
///
/// See [`generate_positions`].
#[tracing::instrument(skip_all, fields(mode = ?options.mode))]
pub async fn run_simulation(
    route: Route,
    options: SimulationOptions,
    config: MonitorConfig,
) -> Result<SimulationReport> {
    let positions = generate_positions(&route, &options)?;
    info!(positions = positions.len(), "Starting simulation");

    let trip_id = TripId::from(SIMULATED_TRIP);
    let source = Arc::new(MemoryTripSource::new());
    source.insert_trip(trip_id.clone(), TripStatus::InProgress, Some(route));
    let sink = Arc::new(MemoryAlertSink::new());
    let clock = Arc::new(ManualClock::new(options.start));

    let repository = Arc::new(MemoryStateRepository::new());
    let monitor =
        Monitor::new(source.clone(), sink.clone(), repository, config).with_clock(clock.clone());
    let mut scheduler = Scheduler::new(Arc::new(monitor));

    let mut totals = TickStats::default();
    for position in &positions {
        if position.timestamp > clock.now_utc() {
            clock.set(position.timestamp);
        }
        source.report_position(&trip_id, position.clone());
        let stats = scheduler.tick().await;
        debug!(
            tick = stats.tick,
            evaluated = stats.evaluated,
            alerts = stats.alerts,
            "Simulated tick"
        );
        totals.evaluated += stats.evaluated;
        totals.skipped_stale += stats.skipped_stale;
    }

    let state = scheduler.monitor().store().snapshot(&trip_id).await.unwrap_or_default();
    Ok(SimulationReport {
        mode: options.mode,
        positions: positions.len(),
        evaluated: totals.evaluated,
        rejected_stale: totals.skipped_stale,
        alerts: sink.alerts(),
        is_deviated: state.is_deviated,
        is_stopped: state.is_stopped,
    })
}
