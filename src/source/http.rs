use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MonitorError, Result};
use crate::fetch::{HttpClient, get_bytes, get_json};
use crate::model::{Position, Route, TripId, TripStatus};
use crate::parser::parse_route;
use crate::source::TripSource;

/// Reads trips from the CRUD layer's REST API.
///
/// Endpoints, relative to `base_url`:
///
/// * `GET /trips?status=IN_PROGRESS` returns a list (or a paginated
///   `{"results": [...]}`) of `{id, status}`
/// * `GET /trips/{id}/position` returns the latest [`Position`]
/// * `GET /trips/{id}/route` returns GeoJSON or a waypoint list
/// * `GET /trips/{id}/tolerance` returns `{"tolerance_meters": <f64|null>}`
///
/// A `404` on any per-trip endpoint means "nothing recorded yet".
pub struct HttpTripSource<C> {
    client: C,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TripList {
    Paginated { results: Vec<TripSummary> },
    Plain(Vec<TripSummary>),
}

#[derive(Deserialize)]
struct TripSummary {
    id: RawId,
    status: TripStatus,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for TripId {
    fn from(id: RawId) -> Self {
        match id {
            RawId::Text(s) => TripId::new(s),
            RawId::Number(n) => TripId::new(n.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ToleranceBody {
    tolerance_meters: Option<f64>,
}

impl<C: HttpClient> HttpTripSource<C> {
    pub fn new(client: C, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn trip_url(&self, trip_id: &TripId, resource: &str) -> String {
        format!("{}/trips/{}/{resource}", self.base_url, urlencoding::encode(trip_id.as_str()))
    }
}

#[async_trait]
impl<C: HttpClient> TripSource for HttpTripSource<C> {
    async fn active_trips(&self) -> Result<Vec<TripId>> {
        let url = format!("{}/trips?status=IN_PROGRESS", self.base_url);
        let list = get_json::<_, TripList>(&self.client, &url).await?;
        let summaries = match list {
            Some(TripList::Paginated { results }) => results,
            Some(TripList::Plain(trips)) => trips,
            None => Vec::new(),
        };

        // The filter is re-applied locally in case the API ignores the query.
        let active: Vec<TripId> = summaries
            .into_iter()
            .filter(|t| t.status.is_monitored())
            .map(|t| t.id.into())
            .collect();
        debug!(count = active.len(), "Fetched active trips");
        Ok(active)
    }

    async fn latest_position(&self, trip_id: &TripId) -> Result<Option<Position>> {
        Ok(get_json(&self.client, &self.trip_url(trip_id, "position")).await?)
    }

    async fn route(&self, trip_id: &TripId) -> Result<Option<Route>> {
        let Some(bytes) = get_bytes(&self.client, &self.trip_url(trip_id, "route")).await? else {
            return Ok(None);
        };
        parse_route(&bytes)
            .map(Some)
            .map_err(|e| MonitorError::InvalidRoute(format!("route for trip {trip_id}: {e}")))
    }

    async fn tolerance(&self, trip_id: &TripId) -> Result<Option<f64>> {
        let body: Option<ToleranceBody> =
            get_json(&self.client, &self.trip_url(trip_id, "tolerance")).await?;
        Ok(body.and_then(|b| b.tolerance_meters))
    }
}
