use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::monitor::TripOutcome;

/// Summary of one scheduler tick. Written as one CSV row per tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub active_trips: usize,
    pub activated: usize,
    pub deactivated: usize,

    // per-trip outcomes
    pub evaluated: usize,
    pub skipped_stale: usize,
    pub skipped_no_position: usize,
    pub skipped_busy: usize,
    pub rejected: usize,
    pub upstream_failures: usize,
    pub discarded: usize,
    pub timed_out: usize,

    pub alerts: usize,
    pub elapsed_ms: u64,
}

impl TickStats {
    pub fn new(tick: u64, timestamp: DateTime<Utc>) -> Self {
        Self { tick, timestamp, ..Default::default() }
    }

    pub fn record(&mut self, outcome: &TripOutcome) {
        match outcome {
            TripOutcome::Evaluated { alerts, .. } => {
                self.evaluated += 1;
                self.alerts += alerts;
            }
            TripOutcome::Stale => self.skipped_stale += 1,
            TripOutcome::NoPosition => self.skipped_no_position += 1,
            TripOutcome::Busy => self.skipped_busy += 1,
            TripOutcome::Inactive | TripOutcome::Discarded => self.discarded += 1,
            TripOutcome::Failed(err) if err.code() == "upstream_fetch_failure" => {
                self.upstream_failures += 1;
            }
            TripOutcome::Failed(_) => self.rejected += 1,
        }
    }

    /// Trips that were dispatched but produced no evaluation.
    pub fn skipped(&self) -> usize {
        self.skipped_stale
            + self.skipped_no_position
            + self.skipped_busy
            + self.rejected
            + self.upstream_failures
            + self.discarded
            + self.timed_out
    }
}
