//! Monitor configuration: global defaults, environment overrides and the
//! per-trip / per-route thresholds file.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};
use crate::hub::OverflowPolicy;
use crate::model::TripId;

pub const DEFAULT_TICK_SECS: u64 = 30;
pub const DEFAULT_TOLERANCE_METERS: f64 = 200.0;
pub const DEFAULT_DEVIATION_COOLDOWN_SECS: i64 = 2 * 60;
pub const DEFAULT_STOP_THRESHOLD_SECS: i64 = 5 * 60;
pub const DEFAULT_STOP_COOLDOWN_SECS: i64 = 5 * 60;
pub const DEFAULT_CONCURRENCY: usize = 16;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;
pub const DEFAULT_DEVICE_STALE_SECS: i64 = 30 * 60;
pub const DEFAULT_TRACK_LEN: usize = 50;

/// Alerting thresholds applied to one trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub tolerance_meters: f64,
    pub deviation_cooldown: Duration,
    pub stop_threshold: Duration,
    pub stop_cooldown: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            tolerance_meters: DEFAULT_TOLERANCE_METERS,
            deviation_cooldown: Duration::seconds(DEFAULT_DEVIATION_COOLDOWN_SECS),
            stop_threshold: Duration::seconds(DEFAULT_STOP_THRESHOLD_SECS),
            stop_cooldown: Duration::seconds(DEFAULT_STOP_COOLDOWN_SECS),
        }
    }
}

impl Thresholds {
    /// Applies any values present in `overrides` on top of `self`.
    #[must_use]
    pub fn merge(mut self, overrides: &ThresholdOverrides) -> Self {
        if let Some(tolerance) = overrides.tolerance_meters {
            self.tolerance_meters = tolerance;
        }
        if let Some(secs) = overrides.deviation_cooldown_secs {
            self.deviation_cooldown = Duration::seconds(secs);
        }
        if let Some(secs) = overrides.stop_threshold_secs {
            self.stop_threshold = Duration::seconds(secs);
        }
        if let Some(secs) = overrides.stop_cooldown_secs {
            self.stop_cooldown = Duration::seconds(secs);
        }
        self
    }

    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] for a negative or non-finite tolerance
    /// or a negative duration.
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance_meters.is_finite() || self.tolerance_meters < 0.0 {
            return Err(MonitorError::Config(format!(
                "invalid tolerance: {}",
                self.tolerance_meters
            )));
        }
        for (name, value) in [
            ("deviation cooldown", self.deviation_cooldown),
            ("stop threshold", self.stop_threshold),
            ("stop cooldown", self.stop_cooldown),
        ] {
            if value < Duration::zero() {
                return Err(MonitorError::Config(format!(
                    "{name} must not be negative: {}s",
                    value.num_seconds()
                )));
            }
        }
        Ok(())
    }
}

/// Partial thresholds as written in the overrides file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverrides {
    pub tolerance_meters: Option<f64>,
    pub deviation_cooldown_secs: Option<i64>,
    pub stop_threshold_secs: Option<i64>,
    pub stop_cooldown_secs: Option<i64>,
}

/// Per-trip and per-route overrides, stored as JSON:
///
/// ```json
/// {
///   "trips":  { "SM-2024-0001": { "tolerance_meters": 350.0 } },
///   "routes": { "route-12": { "stop_threshold_secs": 600 } }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverridesFile {
    #[serde(default)]
    pub trips: HashMap<String, ThresholdOverrides>,
    #[serde(default)]
    pub routes: HashMap<String, ThresholdOverrides>,
}

impl OverridesFile {
    /// Loads the overrides from a JSON file at `path` and validates every entry.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let overrides: Self = serde_json::from_str(&content)?;
        overrides.validate()?;
        Ok(overrides)
    }

    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] naming the first trip or route whose
    /// overrides would produce invalid thresholds.
    pub fn validate(&self) -> Result<()> {
        let entries = self
            .trips
            .iter()
            .map(|(id, o)| ("trip", id, o))
            .chain(self.routes.iter().map(|(id, o)| ("route", id, o)));
        for (scope, id, overrides) in entries {
            let merged = Thresholds::default().merge(overrides);
            if let Err(MonitorError::Config(msg)) = merged.validate() {
                return Err(MonitorError::Config(format!("{scope} {id}: {msg}")));
            }
        }
        Ok(())
    }
}

/// Process-wide settings for the scheduler, engine and hub.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick_interval: StdDuration,
    pub thresholds: Thresholds,
    pub concurrency: usize,
    pub subscriber_buffer: usize,
    pub overflow: OverflowPolicy,
    pub device_stale_after: Duration,
    pub track_len: usize,
    pub overrides: OverridesFile,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(DEFAULT_TICK_SECS),
            thresholds: Thresholds::default(),
            concurrency: DEFAULT_CONCURRENCY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            overflow: OverflowPolicy::DropOldest,
            device_stale_after: Duration::seconds(DEFAULT_DEVICE_STALE_SECS),
            track_len: DEFAULT_TRACK_LEN,
            overrides: OverridesFile::default(),
        }
    }
}

impl MonitorConfig {
    /// Builds the configuration from `MONITOR_*` environment variables,
    /// falling back to the defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] when a variable is set but cannot be
    /// parsed.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let thresholds = Thresholds {
            tolerance_meters: env_or("MONITOR_TOLERANCE_METERS", DEFAULT_TOLERANCE_METERS)?,
            deviation_cooldown: Duration::seconds(env_or(
                "MONITOR_DEVIATION_COOLDOWN_SECS",
                DEFAULT_DEVIATION_COOLDOWN_SECS,
            )?),
            stop_threshold: Duration::seconds(env_or(
                "MONITOR_STOP_THRESHOLD_SECS",
                DEFAULT_STOP_THRESHOLD_SECS,
            )?),
            stop_cooldown: Duration::seconds(env_or(
                "MONITOR_STOP_COOLDOWN_SECS",
                DEFAULT_STOP_COOLDOWN_SECS,
            )?),
        };

        let config = Self {
            tick_interval: StdDuration::from_secs(env_or("MONITOR_TICK_SECS", DEFAULT_TICK_SECS)?),
            thresholds,
            concurrency: env_or("MONITOR_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            subscriber_buffer: env_or("MONITOR_SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)?,
            overflow: env_or("MONITOR_OVERFLOW_POLICY", defaults.overflow)?,
            device_stale_after: Duration::seconds(env_or(
                "MONITOR_DEVICE_STALE_SECS",
                DEFAULT_DEVICE_STALE_SECS,
            )?),
            track_len: env_or("MONITOR_TRACK_LEN", DEFAULT_TRACK_LEN)?,
            overrides: defaults.overrides,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] for values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(MonitorError::Config("tick interval must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(MonitorError::Config("concurrency must be at least 1".to_string()));
        }
        if self.subscriber_buffer == 0 {
            return Err(MonitorError::Config("subscriber buffer must be at least 1".to_string()));
        }
        self.thresholds.validate()?;
        self.overrides.validate()
    }

    /// Thresholds for one trip: global defaults, then route overrides, then
    /// trip overrides, then a tolerance supplied by the upstream trip record.
    pub fn thresholds_for(
        &self,
        trip_id: &TripId,
        route_id: Option<&str>,
        upstream_tolerance: Option<f64>,
    ) -> Thresholds {
        let mut thresholds = self.thresholds;
        if let Some(route) = route_id.and_then(|id| self.overrides.routes.get(id)) {
            thresholds = thresholds.merge(route);
        }
        if let Some(trip) = self.overrides.trips.get(trip_id.as_str()) {
            thresholds = thresholds.merge(trip);
        }
        if let Some(tolerance) = upstream_tolerance.filter(|t| t.is_finite() && *t >= 0.0) {
            thresholds.tolerance_meters = tolerance;
        }
        thresholds
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| MonitorError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}
