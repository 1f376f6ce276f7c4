//! In-memory registry of monitoring state, partitioned by trip.
//!
//! Each trip's state sits behind its own async mutex inside a sharded map, so
//! writers for different trips never contend on a shared lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::TripMonitoringState;
use crate::model::{Position, TripId};

pub type StateCell = Arc<Mutex<TripMonitoringState>>;

#[derive(Debug, Default)]
pub struct TripStateStore {
    states: DashMap<TripId, StateCell>,
}

/// Exclusive access to one trip's state.
#[derive(Debug)]
pub struct TripGuard {
    trip_id: TripId,
    cell: StateCell,
    guard: OwnedMutexGuard<TripMonitoringState>,
}

impl TripGuard {
    pub fn trip_id(&self) -> &TripId {
        &self.trip_id
    }

    pub fn state(&self) -> &TripMonitoringState {
        &self.guard
    }

    pub fn replace(&mut self, state: TripMonitoringState) {
        *self.guard = state;
    }

    fn cell(&self) -> &StateCell {
        &self.cell
    }
}

impl TripStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trip's state cell, creating an empty state on first use.
    pub fn activate(&self, trip_id: &TripId) -> StateCell {
        Arc::clone(
            self.states
                .entry(trip_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(TripMonitoringState::new())))
                .value(),
        )
    }

    /// Installs a previously persisted state, unless the trip is already tracked.
    pub fn restore(&self, trip_id: TripId, state: TripMonitoringState) -> bool {
        let mut inserted = false;
        self.states.entry(trip_id).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(state))
        });
        inserted
    }

    /// Drops the trip from the active set without waiting for its lock and
    /// returns its state cell.
    ///
    /// An evaluation still holding the trip's lock finishes normally, but
    /// [`TripStateStore::is_current`] reports false for it afterwards.
    pub fn remove(&self, trip_id: &TripId) -> Option<StateCell> {
        self.states.remove(trip_id).map(|(_, cell)| cell)
    }

    pub fn contains(&self, trip_id: &TripId) -> bool {
        self.states.contains_key(trip_id)
    }

    /// Acquires the trip's lock if no other evaluation holds it.
    pub fn try_lock(&self, trip_id: &TripId) -> Option<TripGuard> {
        let cell = self.states.get(trip_id).map(|entry| Arc::clone(entry.value()))?;
        let guard = Arc::clone(&cell).try_lock_owned().ok()?;
        Some(TripGuard { trip_id: trip_id.clone(), cell, guard })
    }

    /// Waits for the trip's lock.
    pub async fn lock(&self, trip_id: &TripId) -> Option<TripGuard> {
        let cell = self.states.get(trip_id).map(|entry| Arc::clone(entry.value()))?;
        let guard = Arc::clone(&cell).lock_owned().await;
        Some(TripGuard { trip_id: trip_id.clone(), cell, guard })
    }

    /// True while the guard's trip is still active and has not been
    /// deactivated and re-activated since the guard was taken.
    pub fn is_current(&self, guard: &TripGuard) -> bool {
        self.states
            .get(guard.trip_id())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), guard.cell()))
    }

    pub async fn snapshot(&self, trip_id: &TripId) -> Option<TripMonitoringState> {
        let cell = self.states.get(trip_id).map(|entry| Arc::clone(entry.value()))?;
        let state = cell.lock().await.clone();
        Some(state)
    }

    /// Recent accepted positions, oldest first.
    pub async fn track(&self, trip_id: &TripId) -> Vec<Position> {
        self.snapshot(trip_id).await.map(|s| s.track.into_iter().collect()).unwrap_or_default()
    }

    pub fn trip_ids(&self) -> Vec<TripId> {
        let mut ids: Vec<TripId> = self.states.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_activate_is_get_or_create() {
        let store = TripStateStore::new();
        let trip = TripId::from("t1");

        let first = store.activate(&trip);
        first.lock().await.is_deviated = true;
        let second = store.activate(&trip);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.lock().await.is_deviated);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_try_lock_is_exclusive_per_trip() {
        let store = TripStateStore::new();
        let (a, b) = (TripId::from("a"), TripId::from("b"));
        store.activate(&a);
        store.activate(&b);

        let held = store.try_lock(&a).unwrap();
        assert!(store.try_lock(&a).is_none());
        assert!(store.try_lock(&b).is_some());

        drop(held);
        assert!(store.try_lock(&a).is_some());
    }

    #[tokio::test]
    async fn test_unknown_trip_has_no_lock() {
        let store = TripStateStore::new();
        assert!(store.try_lock(&TripId::from("missing")).is_none());
        assert!(store.lock(&TripId::from("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_does_not_wait_for_in_flight_evaluation() {
        let store = TripStateStore::new();
        let trip = TripId::from("t1");
        store.activate(&trip);

        let mut guard = store.try_lock(&trip).unwrap();
        assert!(store.is_current(&guard));

        let cell = store.remove(&trip).unwrap();
        assert!(!store.contains(&trip));
        assert!(!store.is_current(&guard));
        assert!(cell.try_lock().is_err());

        guard.replace(TripMonitoringState { is_stopped: true, ..TripMonitoringState::default() });
        drop(guard);
        assert!(cell.lock().await.is_stopped);
        assert!(store.remove(&trip).is_none());
    }

    #[tokio::test]
    async fn test_reactivated_trip_invalidates_old_guard() {
        let store = TripStateStore::new();
        let trip = TripId::from("t1");
        store.activate(&trip);
        let guard = store.try_lock(&trip).unwrap();

        store.remove(&trip);
        store.activate(&trip);

        assert!(!store.is_current(&guard));
    }

    #[test]
    fn test_restore_does_not_overwrite() {
        let store = TripStateStore::new();
        let trip = TripId::from("t1");
        let restored = TripMonitoringState { is_deviated: true, ..TripMonitoringState::default() };

        assert!(store.restore(trip.clone(), restored));
        assert!(!store.restore(trip, TripMonitoringState::default()));
        assert_eq!(store.trip_ids(), vec![TripId::from("t1")]);
    }
}
