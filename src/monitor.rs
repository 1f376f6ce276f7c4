//! Wires the upstream source, the state store, the analysis engine and the
//! outputs together for one trip at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::engine::{Analyzer, TripMonitoringState};
use crate::error::{MonitorError, Result};
use crate::hub::{Channel, Event, Hub, PositionUpdate, Subscription};
use crate::model::{Position, TripId};
use crate::sink::{AlertSink, StateRepository};
use crate::source::TripSource;
use crate::store::TripStateStore;

/// What happened to one trip during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TripOutcome {
    /// The sample was analysed and published.
    Evaluated { update: PositionUpdate, alerts: usize },
    /// The latest sample was not newer than the last evaluated one.
    Stale,
    /// The trip has no position yet.
    NoPosition,
    /// A previous evaluation of this trip still holds its lock.
    Busy,
    /// The trip is not in the active set.
    Inactive,
    /// The trip was deactivated while it was being evaluated.
    Discarded,
    Failed(MonitorError),
}

/// Trips added to and removed from the active set by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub activated: Vec<TripId>,
    pub deactivated: Vec<TripId>,
}

pub struct Monitor {
    source: Arc<dyn TripSource>,
    sink: Arc<dyn AlertSink>,
    repository: Arc<dyn StateRepository>,
    store: TripStateStore,
    hub: Hub,
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    /// Archive writes still waiting on a deactivated trip's lock.
    archives: Mutex<JoinSet<()>>,
}

impl Monitor {
    pub fn new(
        source: Arc<dyn TripSource>,
        sink: Arc<dyn AlertSink>,
        repository: Arc<dyn StateRepository>,
        config: MonitorConfig,
    ) -> Self {
        let hub = Hub::new(config.subscriber_buffer, config.overflow);
        Self {
            source,
            sink,
            repository,
            store: TripStateStore::new(),
            hub,
            config,
            clock: Arc::new(SystemClock),
            archives: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &TripStateStore {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn source(&self) -> &Arc<dyn TripSource> {
        &self.source
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Reloads persisted state so cooldowns and ongoing deviations or stops
    /// carry over a restart.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Persistence`] when the repository cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for (trip_id, state) in self.repository.load_all().await? {
            if self.store.restore(trip_id, state) {
                restored += 1;
            }
        }
        info!(restored, "Restored trip state");
        Ok(restored)
    }

    /// Activates newly in-progress trips and deactivates (and archives) trips
    /// that left `IN_PROGRESS`.
    ///
    /// Never waits on a trip's lock; see [`Monitor::deactivate`].
    pub fn reconcile(&self, active: &[TripId]) -> Reconciliation {
        let mut result = Reconciliation::default();
        let wanted: HashSet<&TripId> = active.iter().collect();

        for trip_id in active {
            if !self.store.contains(trip_id) {
                self.store.activate(trip_id);
                info!(trip_id = %trip_id, "Trip activated");
                result.activated.push(trip_id.clone());
            }
        }

        for trip_id in self.store.trip_ids() {
            if wanted.contains(&trip_id) {
                continue;
            }
            if self.deactivate(&trip_id) {
                result.deactivated.push(trip_id);
            }
        }
        result
    }

    /// Removes a trip from the active set and archives its final state in the
    /// background.
    ///
    /// The archive task waits for an in-flight evaluation of the trip to
    /// finish; that evaluation's result is discarded. Use
    /// [`Monitor::flush_archives`] to wait for pending archives.
    pub fn deactivate(&self, trip_id: &TripId) -> bool {
        let Some(cell) = self.store.remove(trip_id) else {
            return false;
        };
        info!(trip_id = %trip_id, "Trip deactivated");

        let repository = Arc::clone(&self.repository);
        let trip_id = trip_id.clone();
        let span = info_span!("archive_trip", trip_id = %trip_id);
        let task = async move {
            let state = cell.lock().await.clone();
            match repository.archive(&trip_id, &state).await {
                Ok(()) => debug!("Trip state archived"),
                Err(e) => error!(error = %e, "Failed to archive trip state"),
            }
        };

        let mut archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        while archives.try_join_next().is_some() {}
        archives.spawn(task.instrument(span));
        true
    }

    /// Waits for every archive started by [`Monitor::deactivate`].
    pub async fn flush_archives(&self) {
        let mut pending =
            std::mem::take(&mut *self.archives.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Archive task failed");
            }
        }
    }

    /// Fetches the trip's newest position and runs it through the engine.
    ///
    /// Never fails: every error is logged with the trip id and reported as a
    /// [`TripOutcome`], so one trip cannot affect another.
    pub async fn process_trip(&self, trip_id: &TripId) -> TripOutcome {
        let Some(mut guard) = self.store.try_lock(trip_id) else {
            if self.store.contains(trip_id) {
                debug!(trip_id = %trip_id, "Previous evaluation still running, skipping");
                return TripOutcome::Busy;
            }
            return TripOutcome::Inactive;
        };

        let position = match self.source.latest_position(trip_id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                debug!(trip_id = %trip_id, "No position reported yet");
                return TripOutcome::NoPosition;
            }
            Err(e) => return failed(trip_id, e, "Position fetch failed"),
        };

        let route = match self.source.route(trip_id).await {
            Ok(route) => route,
            Err(MonitorError::InvalidRoute(msg)) => {
                warn!(trip_id = %trip_id, error = %msg, "Route unusable, skipping deviation check");
                None
            }
            Err(e) => return failed(trip_id, e, "Route fetch failed"),
        };

        let tolerance = match self.source.tolerance(trip_id).await {
            Ok(tolerance) => tolerance,
            Err(e) => return failed(trip_id, e, "Tolerance fetch failed"),
        };

        let route_id = route.as_ref().and_then(|r| r.id.as_deref());
        let thresholds = self.config.thresholds_for(trip_id, route_id, tolerance);
        let analyzer = Analyzer::new(thresholds).with_track_len(self.config.track_len);

        // Work on a copy so a rejected sample or a cancelled trip leaves the
        // stored state untouched.
        let mut next = guard.state().clone();
        let evaluation = match analyzer.evaluate(trip_id, &mut next, &position, route.as_ref()) {
            Ok(evaluation) => evaluation,
            Err(MonitorError::StalePosition(msg)) => {
                debug!(trip_id = %trip_id, reason = %msg, "Ignoring stale position");
                return TripOutcome::Stale;
            }
            Err(e) => return failed(trip_id, e, "Position rejected"),
        };

        if !self.store.is_current(&guard) {
            info!(trip_id = %trip_id, "Trip deactivated during evaluation, discarding result");
            return TripOutcome::Discarded;
        }
        guard.replace(next);

        for alert in &evaluation.alerts {
            info!(
                trip_id = %trip_id,
                kind = %alert.kind,
                distance_meters = alert.payload.distance_meters,
                duration_secs = alert.payload.duration_secs,
                "Alert emitted"
            );
            if let Err(e) = self.sink.append_alert(alert).await {
                error!(trip_id = %trip_id, error = %e, "Failed to persist alert");
            }
        }
        if let Err(e) = self.repository.upsert(trip_id, guard.state()).await {
            error!(trip_id = %trip_id, error = %e, "Failed to persist trip state");
        }

        let update = self.position_update(trip_id, guard.state(), position);
        let channel = Channel::Trip(trip_id.clone());
        self.hub.publish(&channel, Event::PositionUpdate(update.clone()));
        self.hub.publish(&Channel::Fleet, Event::PositionUpdate(update.clone()));
        let alerts = evaluation.alerts.len();
        for alert in evaluation.alerts {
            self.hub.publish(&channel, Event::Alert(alert));
        }

        TripOutcome::Evaluated { update, alerts }
    }

    /// Subscribes to one trip. The trip's last known position, if any, is
    /// queued ahead of live events.
    pub async fn subscribe_trip(&self, trip_id: &TripId) -> Subscription {
        // Holding the trip lock keeps the primed snapshot ordered before any
        // update published by a concurrent evaluation.
        let guard = self.store.lock(trip_id).await;
        let subscription = self.hub.subscribe(Channel::Trip(trip_id.clone()));
        if let Some(guard) = guard
            && let Some(position) = guard.state().last_position.clone()
        {
            let update = self.position_update(trip_id, guard.state(), position);
            subscription.prime(Event::PositionUpdate(update), self.config.subscriber_buffer);
        }
        subscription
    }

    /// Subscribes to the whole fleet, starting with a snapshot of every
    /// active trip that has a known position.
    pub async fn subscribe_fleet(&self) -> Subscription {
        let subscription = self.hub.subscribe(Channel::Fleet);
        let snapshot = self.fleet_snapshot().await;
        subscription.prime(Event::FleetSnapshot(snapshot), self.config.subscriber_buffer);
        subscription
    }

    /// Last known position of every active trip, ordered by trip id.
    pub async fn fleet_snapshot(&self) -> Vec<PositionUpdate> {
        let mut updates = Vec::new();
        for trip_id in self.store.trip_ids() {
            let Some(state) = self.store.snapshot(&trip_id).await else {
                continue;
            };
            if let Some(position) = state.last_position.clone() {
                updates.push(self.position_update(&trip_id, &state, position));
            }
        }
        updates
    }

    /// Publishes the positions evaluated in one tick as a single fleet event.
    pub fn publish_fleet_batch(&self, updates: Vec<PositionUpdate>) {
        if updates.is_empty() {
            return;
        }
        let report = self.hub.publish(&Channel::Fleet, Event::FleetSnapshot(updates));
        debug!(delivered = report.delivered, dropped = report.dropped, "Fleet batch published");
    }

    fn position_update(
        &self,
        trip_id: &TripId,
        state: &TripMonitoringState,
        position: Position,
    ) -> PositionUpdate {
        let now = self.clock.now_utc();
        PositionUpdate {
            trip_id: trip_id.clone(),
            device_stale: now - position.timestamp > self.config.device_stale_after,
            position,
            distance_from_route_meters: state.last_distance_meters,
            is_deviated: state.is_deviated,
            is_stopped: state.is_stopped,
            published_at: now,
        }
    }
}

fn failed(trip_id: &TripId, err: MonitorError, message: &str) -> TripOutcome {
    warn!(trip_id = %trip_id, code = err.code(), error = %err, "{message}");
    TripOutcome::Failed(err)
}
