//! Upstream collaborators that own trips, routes and telemetry.
//!
//! The engine only reads through [`TripSource`]; any vendor-specific telemetry
//! shape is normalized into [`Position`] before it crosses this boundary.

mod http;

pub use http::HttpTripSource;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Position, Route, TripId, TripStatus};

#[async_trait]
pub trait TripSource: Send + Sync {
    /// Trips currently `IN_PROGRESS`.
    async fn active_trips(&self) -> Result<Vec<TripId>>;

    async fn latest_position(&self, trip_id: &TripId) -> Result<Option<Position>>;

    async fn route(&self, trip_id: &TripId) -> Result<Option<Route>>;

    /// Tolerance configured on the trip record, if any.
    async fn tolerance(&self, trip_id: &TripId) -> Result<Option<f64>>;
}

#[derive(Debug, Clone)]
struct TripRecord {
    status: TripStatus,
    route: Option<Route>,
    tolerance: Option<f64>,
    position: Option<Position>,
}

/// A trip table held in memory. Used by the simulator and in tests.
#[derive(Debug, Default)]
pub struct MemoryTripSource {
    trips: RwLock<HashMap<TripId, TripRecord>>,
}

impl MemoryTripSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_trip(&self, trip_id: TripId, status: TripStatus, route: Option<Route>) {
        self.trips.write().unwrap_or_else(PoisonError::into_inner).insert(
            trip_id,
            TripRecord { status, route, tolerance: None, position: None },
        );
    }

    pub fn set_status(&self, trip_id: &TripId, status: TripStatus) {
        self.update(trip_id, |record| record.status = status);
    }

    pub fn set_tolerance(&self, trip_id: &TripId, tolerance: Option<f64>) {
        self.update(trip_id, |record| record.tolerance = tolerance);
    }

    /// Replaces the trip's latest position, as a telemetry sync would.
    pub fn report_position(&self, trip_id: &TripId, position: Position) {
        self.update(trip_id, |record| record.position = Some(position));
    }

    fn update(&self, trip_id: &TripId, f: impl FnOnce(&mut TripRecord)) {
        let mut trips = self.trips.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = trips.get_mut(trip_id) {
            f(record);
        }
    }

    fn read<T>(&self, trip_id: &TripId, f: impl FnOnce(&TripRecord) -> Option<T>) -> Option<T> {
        self.trips.read().unwrap_or_else(PoisonError::into_inner).get(trip_id).and_then(f)
    }
}

#[async_trait]
impl TripSource for MemoryTripSource {
    async fn active_trips(&self) -> Result<Vec<TripId>> {
        let trips = self.trips.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<TripId> = trips
            .iter()
            .filter(|(_, r)| r.status.is_monitored())
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        Ok(active)
    }

    async fn latest_position(&self, trip_id: &TripId) -> Result<Option<Position>> {
        Ok(self.read(trip_id, |r| r.position.clone()))
    }

    async fn route(&self, trip_id: &TripId) -> Result<Option<Route>> {
        Ok(self.read(trip_id, |r| r.route.clone()))
    }

    async fn tolerance(&self, trip_id: &TripId) -> Result<Option<f64>> {
        Ok(self.read(trip_id, |r| r.tolerance))
    }
}
