//! Fixed-cadence evaluation loop.
//!
//! One coordinating task per tick lists the in-progress trips, reconciles the
//! active set and fans out one worker per trip, bounded by a semaphore.
//! Workers still running when the tick's budget (one tick interval) runs out
//! are detached; they keep their trip's lock, so the next tick skips those
//! trips instead of overlapping them.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info, info_span, warn};

use crate::monitor::{Monitor, TripOutcome};
use crate::output::append_record;
use crate::stats::TickStats;

pub struct Scheduler {
    monitor: Arc<Monitor>,
    semaphore: Arc<Semaphore>,
    stats_output: Option<String>,
    ticks: u64,
}

impl Scheduler {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        let semaphore = Arc::new(Semaphore::new(monitor.config().concurrency.max(1)));
        Self { monitor, semaphore, stats_output: None, ticks: 0 }
    }

    /// Appends every tick's [`TickStats`] to the CSV file at `path`.
    #[must_use]
    pub fn with_stats_output(mut self, path: impl Into<String>) -> Self {
        self.stats_output = Some(path.into());
        self
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Runs one evaluation pass over every in-progress trip.
    pub async fn tick(&mut self) -> TickStats {
        self.ticks += 1;
        let started = Instant::now();
        let mut stats = TickStats::new(self.ticks, self.monitor.now_utc());

        let active = match self.monitor.source().active_trips().await {
            Ok(active) => active,
            Err(e) => {
                // Keep evaluating the current set rather than deactivating
                // every trip because the listing failed.
                error!(error = %e, "Failed to list active trips");
                stats.upstream_failures += 1;
                self.monitor.store().trip_ids()
            }
        };

        let reconciliation = self.monitor.reconcile(&active);
        stats.active_trips = active.len();
        stats.activated = reconciliation.activated.len();
        stats.deactivated = reconciliation.deactivated.len();

        let mut tasks = JoinSet::new();
        for trip_id in active {
            let monitor = Arc::clone(&self.monitor);
            let sem = Arc::clone(&self.semaphore);
            let span = info_span!("analyze_trip", trip_id = %trip_id);

            tasks.spawn(
                async move {
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return TripOutcome::Inactive;
                    };
                    monitor.process_trip(&trip_id).await
                }
                .instrument(span),
            );
        }

        let deadline = tokio::time::Instant::now() + self.monitor.config().tick_interval;
        let mut batch = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    stats.record(&outcome);
                    if let TripOutcome::Evaluated { update, .. } = outcome {
                        batch.push(update);
                    }
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Trip worker failed");
                    stats.rejected += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    stats.timed_out = tasks.len();
                    warn!(pending = tasks.len(), "Tick budget exhausted, detaching slow trips");
                    tasks.detach_all();
                    break;
                }
            }
        }

        batch.sort_by(|a, b| a.trip_id.cmp(&b.trip_id));
        self.monitor.publish_fleet_batch(batch);

        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            tick = stats.tick,
            active = stats.active_trips,
            evaluated = stats.evaluated,
            skipped = stats.skipped(),
            alerts = stats.alerts,
            elapsed_ms = stats.elapsed_ms,
            "Tick complete"
        );

        if let Some(path) = &self.stats_output
            && let Err(e) = append_record(path, &stats)
        {
            error!(path = %path, error = %e, "Failed to write tick stats");
        }
        stats
    }

    /// Ticks at the configured cadence until `shutdown` resolves or
    /// `num_ticks` ticks have run (0 = unbounded). The first tick fires
    /// immediately.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(&mut self, num_ticks: u64, shutdown: impl Future<Output = ()>) {
        let tick_interval = self.monitor.config().tick_interval;
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        if num_ticks == 0 {
            info!(
                tick_secs = tick_interval.as_secs(),
                "Monitoring indefinitely. Press Ctrl+C to stop."
            );
        } else {
            info!(tick_secs = tick_interval.as_secs(), num_ticks, "Starting monitoring");
        }

        loop {
            if num_ticks > 0 && self.ticks >= num_ticks {
                break;
            }
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        if tokio::time::timeout(tick_interval, self.monitor.flush_archives()).await.is_err() {
            warn!("Archives still pending at shutdown");
        }
        info!(ticks = self.ticks, "Scheduler stopped");
    }
}
