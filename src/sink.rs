//! Alert history and trip state persistence.
//!
//! [`AlertSink`] receives every emitted alert in emission order.
//! [`StateRepository`] stores the latest [`TripMonitoringState`] per trip so a
//! restarted process can resume cooldowns where it left off.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::TripMonitoringState;
use crate::error::{MonitorError, Result};
use crate::model::{Alert, TripId};
use crate::output::append_record;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn append_alert(&self, alert: &Alert) -> Result<()>;
}

/// Keeps alerts in memory, for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn alerts_for(&self, trip_id: &TripId) -> Vec<Alert> {
        self.alerts().into_iter().filter(|a| &a.trip_id == trip_id).collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn append_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).push(alert.clone());
        Ok(())
    }
}

/// Flat CSV row for one alert.
#[derive(Debug, Serialize, Deserialize)]
struct AlertRow {
    timestamp: DateTime<Utc>,
    trip_id: String,
    kind: String,
    latitude: f64,
    longitude: f64,
    distance_meters: Option<f64>,
    segment_index: Option<usize>,
    duration_secs: Option<i64>,
}

impl From<&Alert> for AlertRow {
    fn from(alert: &Alert) -> Self {
        Self {
            timestamp: alert.timestamp,
            trip_id: alert.trip_id.to_string(),
            kind: alert.kind.to_string(),
            latitude: alert.payload.latitude,
            longitude: alert.payload.longitude,
            distance_meters: alert.payload.distance_meters,
            segment_index: alert.payload.segment_index,
            duration_secs: alert.payload.duration_secs,
        }
    }
}

/// Appends one CSV row per alert.
#[derive(Debug)]
pub struct CsvAlertSink {
    path: String,
    // Serializes appends so concurrent trips never interleave rows.
    write_lock: tokio::sync::Mutex<()>,
}

impl CsvAlertSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), write_lock: tokio::sync::Mutex::new(()) }
    }
}

#[async_trait]
impl AlertSink for CsvAlertSink {
    async fn append_alert(&self, alert: &Alert) -> Result<()> {
        let _write = self.write_lock.lock().await;
        append_record(&self.path, &AlertRow::from(alert))
            .with_context(|| format!("appending alert to {}", self.path))
            .map_err(|e| MonitorError::Persistence(format!("{e:#}")))
    }
}

#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn upsert(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()>;

    /// Called when a trip leaves `IN_PROGRESS`.
    async fn archive(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<(TripId, TripMonitoringState)>>;
}

#[derive(Debug, Default)]
pub struct MemoryStateRepository {
    active: DashMap<TripId, TripMonitoringState>,
    archived: DashMap<TripId, TripMonitoringState>,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trip_id: &TripId) -> Option<TripMonitoringState> {
        self.active.get(trip_id).map(|entry| entry.value().clone())
    }

    pub fn archived(&self, trip_id: &TripId) -> Option<TripMonitoringState> {
        self.archived.get(trip_id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StateRepository for MemoryStateRepository {
    async fn upsert(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()> {
        self.active.insert(trip_id.clone(), state.clone());
        Ok(())
    }

    async fn archive(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()> {
        self.active.remove(trip_id);
        self.archived.insert(trip_id.clone(), state.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(TripId, TripMonitoringState)>> {
        Ok(self.active.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    trip_id: TripId,
    saved_at: DateTime<Utc>,
    state: TripMonitoringState,
}

/// One JSON document per active trip under `dir`; archived trips move to
/// `dir/archive`.
#[derive(Debug, Clone)]
pub struct JsonDirStateRepository {
    dir: PathBuf,
}

impl JsonDirStateRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, trip_id: &TripId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(trip_id)))
    }
}

/// Trip ids are opaque strings. Percent-encoding keeps path separators out of
/// the file name and never maps two ids to the same file.
fn file_stem(trip_id: &TripId) -> String {
    urlencoding::encode(trip_id.as_str()).into_owned()
}

async fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| MonitorError::Persistence(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StateRepository for JsonDirStateRepository {
    async fn upsert(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stored =
            StoredState { trip_id: trip_id.clone(), saved_at: Utc::now(), state: state.clone() };
        write_json(&self.file_for(trip_id), &stored).await
    }

    async fn archive(&self, trip_id: &TripId, state: &TripMonitoringState) -> Result<()> {
        let archive_dir = self.dir.join("archive");
        tokio::fs::create_dir_all(&archive_dir).await?;
        let saved_at = Utc::now();
        let stored = StoredState { trip_id: trip_id.clone(), saved_at, state: state.clone() };
        let file_name =
            format!("{}-{}.json", file_stem(trip_id), saved_at.format("%Y%m%dT%H%M%S"));
        let target = archive_dir.join(file_name);
        write_json(&target, &stored).await?;

        match tokio::fs::remove_file(self.file_for(trip_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn load_all(&self) -> Result<Vec<(TripId, TripMonitoringState)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<StoredState>(&bytes) {
                Ok(stored) if stored.state.is_consistent() => {
                    debug!(
                        trip_id = %stored.trip_id,
                        saved_at = %stored.saved_at,
                        "Loaded trip state"
                    );
                    states.push((stored.trip_id, stored.state));
                }
                Ok(stored) => {
                    warn!(
                        trip_id = %stored.trip_id,
                        path = %path.display(),
                        "Ignoring inconsistent trip state"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable trip state");
                }
            }
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{AlertKind, AlertPayload};

    fn alert(trip: &str, kind: AlertKind) -> Alert {
        Alert {
            trip_id: TripId::from(trip),
            kind,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            payload: AlertPayload {
                latitude: -23.5,
                longitude: -46.6,
                distance_meters: Some(412.5),
                segment_index: Some(3),
                duration_secs: None,
            },
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_memory_sink_preserves_order() {
        let sink = MemoryAlertSink::new();
        sink.append_alert(&alert("a", AlertKind::DeviationStart)).await.unwrap();
        sink.append_alert(&alert("b", AlertKind::StopStart)).await.unwrap();
        sink.append_alert(&alert("a", AlertKind::DeviationEnd)).await.unwrap();

        let kinds: Vec<_> = sink.alerts_for(&TripId::from("a")).iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::DeviationStart, AlertKind::DeviationEnd]);
        assert_eq!(sink.alerts().len(), 3);
    }

    #[tokio::test]
    async fn test_csv_sink_writes_flat_rows() {
        let dir = temp_dir("trip_monitor_csv_sink");
        let path = dir.join("alerts.csv");
        let sink = CsvAlertSink::new(path.to_string_lossy());

        sink.append_alert(&alert("SM-1", AlertKind::DeviationStart)).await.unwrap();
        sink.append_alert(&alert("SM-1", AlertKind::DeviationContinue)).await.unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<AlertRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "DEVIATION_START");
        assert_eq!(rows[1].distance_meters, Some(412.5));
        assert_eq!(rows[1].duration_secs, None);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_json_repository_round_trip_and_archive() {
        let dir = temp_dir("trip_monitor_state_repo");
        let repo = JsonDirStateRepository::new(&dir);
        let trip = TripId::from("SM/2024/0001");
        let state = TripMonitoringState {
            is_deviated: true,
            deviation_started_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()),
            last_deviation_alert_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 0).unwrap()),
            ..TripMonitoringState::default()
        };

        repo.upsert(&trip, &state).await.unwrap();
        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![(trip.clone(), state.clone())]);

        repo.archive(&trip, &state).await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.join("archive")).unwrap().count(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_json_repository_missing_dir_is_empty() {
        let repo = JsonDirStateRepository::new(temp_dir("trip_monitor_state_missing"));
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_repository_archive_moves_state() {
        let repo = MemoryStateRepository::new();
        let trip = TripId::from("t");
        repo.upsert(&trip, &TripMonitoringState::default()).await.unwrap();
        assert!(repo.get(&trip).is_some());

        repo.archive(&trip, &TripMonitoringState::default()).await.unwrap();
        assert!(repo.get(&trip).is_none());
        assert!(repo.archived(&trip).is_some());
    }

    #[test]
    fn test_file_stem_encodes_ids() {
        assert_eq!(file_stem(&TripId::from("SM/2024 01")), "SM%2F2024%2001");
        assert_eq!(file_stem(&TripId::from("SM-2024_01")), "SM-2024_01");
    }

    #[tokio::test]
    async fn test_json_repository_keeps_similar_ids_apart() {
        let dir = temp_dir("trip_monitor_state_similar_ids");
        let repo = JsonDirStateRepository::new(&dir);
        let slash = TripId::from("SM/1");
        let space = TripId::from("SM 1");
        let underscore = TripId::from("SM_1");
        let deviated = TripMonitoringState { is_deviated: true, ..TripMonitoringState::default() };
        let stopped = TripMonitoringState { is_stopped: true, ..TripMonitoringState::default() };

        repo.upsert(&slash, &deviated).await.unwrap();
        repo.upsert(&space, &stopped).await.unwrap();
        repo.upsert(&underscore, &TripMonitoringState::default()).await.unwrap();
        assert_eq!(
            repo.load_all().await.unwrap(),
            vec![
                (space.clone(), stopped.clone()),
                (slash.clone(), deviated.clone()),
                (underscore.clone(), TripMonitoringState::default()),
            ]
        );

        // Archiving one trip leaves the others' files alone.
        repo.archive(&underscore, &TripMonitoringState::default()).await.unwrap();
        assert_eq!(
            repo.load_all().await.unwrap(),
            vec![(space, stopped), (slash, deviated)]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
