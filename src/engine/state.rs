use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Position;

/// Per-trip analysis state.
///
/// A stop is tracked in two phases. `stop_candidate_since` holds the time of
/// the first zero-speed reading while the stop threshold has not yet been
/// reached. Once it is reached the candidate time moves to `stop_started_at`
/// and `is_stopped` becomes true, so stop durations always count from the
/// first zero reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripMonitoringState {
    pub is_deviated: bool,
    pub deviation_started_at: Option<DateTime<Utc>>,
    pub last_deviation_alert_at: Option<DateTime<Utc>>,

    pub is_stopped: bool,
    #[serde(default)]
    pub stop_candidate_since: Option<DateTime<Utc>>,
    pub stop_started_at: Option<DateTime<Utc>>,
    pub last_stop_alert_at: Option<DateTime<Utc>>,

    pub last_position: Option<Position>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_distance_meters: Option<f64>,

    /// Most recent accepted positions, oldest first.
    #[serde(default)]
    pub track: VecDeque<Position>,
}

impl TripMonitoringState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clear_deviation(&mut self) {
        self.is_deviated = false;
        self.deviation_started_at = None;
        self.last_deviation_alert_at = None;
    }

    pub(crate) fn clear_stop(&mut self) {
        self.is_stopped = false;
        self.stop_candidate_since = None;
        self.stop_started_at = None;
        self.last_stop_alert_at = None;
    }

    pub(crate) fn record(&mut self, position: &Position, track_len: usize) {
        self.last_evaluated_at = Some(position.timestamp);
        self.last_position = Some(position.clone());
        if track_len == 0 {
            self.track.clear();
            return;
        }
        while self.track.len() >= track_len {
            self.track.pop_front();
        }
        self.track.push_back(position.clone());
    }

    /// Checks the flag/timestamp pairing. A state that fails this check was
    /// not produced by the engine.
    pub fn is_consistent(&self) -> bool {
        (!self.is_deviated || self.deviation_started_at.is_some())
            && (!self.is_stopped || self.stop_started_at.is_some())
            && !(self.is_stopped && self.stop_candidate_since.is_some())
    }
}
