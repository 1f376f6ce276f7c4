//! Domain values shared by the engine, the adapters and the broadcast hub.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Identifier of a trip owned by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(String);

impl TripId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TripId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TripId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of a trip. Only `InProgress` trips are monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    NotStarted,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_monitored(self) -> bool {
        self == Self::InProgress
    }
}

/// A normalized telemetry sample.
///
/// `speed` is in km/h. `None` means the device did not report a speed and is
/// never read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub ignition: bool,
}

impl Position {
    /// Rejects samples that cannot be placed on the globe or carry a
    /// nonsensical speed.
    pub fn validate(&self) -> Result<()> {
        if !valid_coordinate(self.latitude, self.longitude) {
            return Err(MonitorError::InvalidPosition(format!(
                "coordinates out of range: ({}, {})",
                self.latitude, self.longitude
            )));
        }
        if let Some(speed) = self.speed
            && (!speed.is_finite() || speed < 0.0)
        {
            return Err(MonitorError::InvalidPosition(format!("invalid speed: {speed}")));
        }
        Ok(())
    }

    pub fn point(&self) -> Waypoint {
        Waypoint { latitude: self.latitude, longitude: self.longitude }
    }
}

pub(crate) fn valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Waypoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// The planned path of a trip as an ordered polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: Option<String>,
    pub waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { id: None, waypoints }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    DeviationStart,
    DeviationContinue,
    DeviationEnd,
    StopStart,
    StopContinue,
    StopEnd,
}

impl AlertKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviationStart => "DEVIATION_START",
            Self::DeviationContinue => "DEVIATION_CONTINUE",
            Self::DeviationEnd => "DEVIATION_END",
            Self::StopStart => "STOP_START",
            Self::StopContinue => "STOP_CONTINUE",
            Self::StopEnd => "STOP_END",
        }
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurements attached to an alert. Fields not relevant to the alert kind
/// are left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

/// An immutable record of a state transition or reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub trip_id: TripId,
    pub kind: AlertKind,
    pub timestamp: DateTime<Utc>,
    pub payload: AlertPayload,
}
