use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::{DEFAULT_TRACK_LEN, Thresholds};
use crate::engine::state::TripMonitoringState;
use crate::error::{MonitorError, Result};
use crate::geometry::{RouteDistance, distance_to_route};
use crate::model::{Alert, AlertKind, AlertPayload, Position, Route, TripId};

/// Alerts and measurements produced by one evaluation.
///
/// Deviation alerts always precede stop alerts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub alerts: Vec<Alert>,
    /// `None` when the route could not be evaluated.
    pub route_distance: Option<RouteDistance>,
}

/// Runs the deviation and stop state machines for one trip.
#[derive(Debug, Clone, Copy)]
pub struct Analyzer {
    thresholds: Thresholds,
    track_len: usize,
}

impl Analyzer {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds, track_len: DEFAULT_TRACK_LEN }
    }

    #[must_use]
    pub const fn with_track_len(mut self, track_len: usize) -> Self {
        self.track_len = track_len;
        self
    }

    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Evaluates `position` against `state` and the trip's route.
    ///
    /// The sample timestamp is the clock for every cooldown and threshold, so
    /// replaying the same samples always yields the same alerts.
    ///
    /// # Errors
    ///
    /// * [`MonitorError::InvalidPosition`] for a malformed sample.
    /// * [`MonitorError::StalePosition`] when the sample is not newer than the
    ///   last evaluated one.
    ///
    /// `state` is left untouched on error. An unusable route is not an error:
    /// the deviation pass is skipped and the stop pass still runs.
    pub fn evaluate(
        &self,
        trip_id: &TripId,
        state: &mut TripMonitoringState,
        position: &Position,
        route: Option<&Route>,
    ) -> Result<Evaluation> {
        position.validate()?;
        if let Some(last) = state.last_evaluated_at
            && position.timestamp <= last
        {
            return Err(MonitorError::StalePosition(format!(
                "sample at {} is not newer than last evaluated {last}",
                position.timestamp
            )));
        }

        let mut evaluation = Evaluation::default();

        match route.map(|r| distance_to_route(position.point(), &r.waypoints)) {
            Some(Ok(distance)) => {
                evaluation.route_distance = Some(distance);
                if let Some(alert) = self.deviation_pass(trip_id, state, position, distance) {
                    evaluation.alerts.push(alert);
                }
            }
            Some(Err(err)) => {
                debug!(trip_id = %trip_id, error = %err, "Skipping deviation check");
            }
            None => debug!(trip_id = %trip_id, "No route assigned, skipping deviation check"),
        }

        if let Some(alert) = self.stop_pass(trip_id, state, position) {
            evaluation.alerts.push(alert);
        }

        state.last_distance_meters = evaluation.route_distance.map(|d| d.distance_meters);
        state.record(position, self.track_len);
        Ok(evaluation)
    }

    fn deviation_pass(
        &self,
        trip_id: &TripId,
        state: &mut TripMonitoringState,
        position: &Position,
        distance: RouteDistance,
    ) -> Option<Alert> {
        let now = position.timestamp;
        let payload = AlertPayload {
            latitude: position.latitude,
            longitude: position.longitude,
            distance_meters: Some(distance.distance_meters),
            segment_index: Some(distance.segment_index),
            duration_secs: None,
        };

        if distance.distance_meters > self.thresholds.tolerance_meters {
            if !state.is_deviated {
                state.is_deviated = true;
                state.deviation_started_at = Some(now);
                state.last_deviation_alert_at = Some(now);
                return Some(alert(trip_id, AlertKind::DeviationStart, now, payload));
            }

            if cooled_down(state.last_deviation_alert_at, now, self.thresholds.deviation_cooldown) {
                state.last_deviation_alert_at = Some(now);
                let duration = elapsed_secs(state.deviation_started_at, now);
                return Some(alert(
                    trip_id,
                    AlertKind::DeviationContinue,
                    now,
                    AlertPayload { duration_secs: duration, ..payload },
                ));
            }
            return None;
        }

        if state.is_deviated {
            let duration = elapsed_secs(state.deviation_started_at, now);
            state.clear_deviation();
            return Some(alert(
                trip_id,
                AlertKind::DeviationEnd,
                now,
                AlertPayload { duration_secs: duration, ..payload },
            ));
        }
        None
    }

    fn stop_pass(
        &self,
        trip_id: &TripId,
        state: &mut TripMonitoringState,
        position: &Position,
    ) -> Option<Alert> {
        let now = position.timestamp;
        let payload = AlertPayload {
            latitude: position.latitude,
            longitude: position.longitude,
            ..AlertPayload::default()
        };

        match position.speed {
            // Unknown speed neither starts nor ends a stop.
            None => {
                if state.is_stopped {
                    return self.stop_reminder(trip_id, state, now, payload);
                }
                None
            }
            Some(speed) if speed == 0.0 => {
                if state.is_stopped {
                    return self.stop_reminder(trip_id, state, now, payload);
                }
                let since = *state.stop_candidate_since.get_or_insert(now);
                if now - since < self.thresholds.stop_threshold {
                    return None;
                }
                state.is_stopped = true;
                state.stop_candidate_since = None;
                state.stop_started_at = Some(since);
                state.last_stop_alert_at = Some(now);
                Some(alert(
                    trip_id,
                    AlertKind::StopStart,
                    now,
                    AlertPayload { duration_secs: Some((now - since).num_seconds()), ..payload },
                ))
            }
            Some(_) => {
                if state.is_stopped {
                    let duration = elapsed_secs(state.stop_started_at, now);
                    state.clear_stop();
                    return Some(alert(
                        trip_id,
                        AlertKind::StopEnd,
                        now,
                        AlertPayload { duration_secs: duration, ..payload },
                    ));
                }
                state.stop_candidate_since = None;
                None
            }
        }
    }

    fn stop_reminder(
        &self,
        trip_id: &TripId,
        state: &mut TripMonitoringState,
        now: DateTime<Utc>,
        payload: AlertPayload,
    ) -> Option<Alert> {
        if !cooled_down(state.last_stop_alert_at, now, self.thresholds.stop_cooldown) {
            return None;
        }
        state.last_stop_alert_at = Some(now);
        Some(alert(
            trip_id,
            AlertKind::StopContinue,
            now,
            AlertPayload { duration_secs: elapsed_secs(state.stop_started_at, now), ..payload },
        ))
    }
}

fn cooled_down(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    last.is_none_or(|last| now - last >= cooldown)
}

fn elapsed_secs(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    since.map(|since| (now - since).num_seconds())
}

fn alert(
    trip_id: &TripId,
    kind: AlertKind,
    timestamp: DateTime<Utc>,
    payload: AlertPayload,
) -> Alert {
    Alert { trip_id: trip_id.clone(), kind, timestamp, payload }
}
