//! Route geometry decoding.
//!
//! The CRUD layer stores route geometry as GeoJSON (`[lng, lat]` pairs), either
//! as a bare `LineString`, wrapped in a `Feature`, or as a plain list of
//! `{latitude, longitude}` waypoints.

use anyhow::{Result, bail};
use serde::Deserialize;

use crate::model::{Route, Waypoint};

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteDocument {
    Feature { geometry: Geometry, properties: Option<serde_json::Value> },
    Geometry(Geometry),
    Route(Route),
    Waypoints(Vec<Waypoint>),
}

#[derive(Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<Vec<f64>>,
}

impl Geometry {
    fn into_waypoints(self) -> Result<Vec<Waypoint>> {
        if self.kind != "LineString" {
            bail!("unsupported geometry type '{}', expected LineString", self.kind);
        }
        self.coordinates
            .into_iter()
            .enumerate()
            .map(|(i, pair)| match pair.as_slice() {
                [lng, lat, ..] => Ok(Waypoint::new(*lat, *lng)),
                _ => bail!("coordinate {i} has {} value(s), expected [lng, lat]", pair.len()),
            })
            .collect()
    }
}

/// Decodes a route from JSON bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not one of the accepted shapes. Geometry
/// that parses but cannot be evaluated (for example a single waypoint) is
/// accepted here and rejected later by the geometry evaluator.
pub fn parse_route(bytes: &[u8]) -> Result<Route> {
    let route = match serde_json::from_slice::<RouteDocument>(bytes)? {
        RouteDocument::Feature { geometry, properties } => {
            let id = properties
                .as_ref()
                .and_then(|p| p.get("id"))
                .and_then(|id| match id {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
            Route { id, waypoints: geometry.into_waypoints()? }
        }
        RouteDocument::Geometry(geometry) => Route::new(geometry.into_waypoints()?),
        RouteDocument::Route(route) => route,
        RouteDocument::Waypoints(waypoints) => Route::new(waypoints),
    };
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_geojson_linestring_swaps_axes() {
        let json = br#"{"type":"LineString","coordinates":[[-46.63,-23.55],[-46.60,-23.50]]}"#;
        let route = parse_route(json).unwrap();
        assert_eq!(route.waypoints[0], Waypoint::new(-23.55, -46.63));
        assert_eq!(route.waypoints.len(), 2);
        assert_eq!(route.id, None);
    }

    #[test]
    fn test_parse_feature_with_numeric_id() {
        let json = br#"{
            "type": "Feature",
            "properties": {"id": 12, "name": "SP - Campinas"},
            "geometry": {"type":"LineString","coordinates":[[0.0,0.0],[1.0,0.0,760.0]]}
        }"#;
        let route = parse_route(json).unwrap();
        assert_eq!(route.id.as_deref(), Some("12"));
        assert_eq!(route.waypoints[1], Waypoint::new(0.0, 1.0));
    }

    #[test]
    fn test_parse_plain_waypoints() {
        let json = br#"[{"latitude":1.0,"longitude":2.0},{"latitude":3.0,"longitude":4.0}]"#;
        let route = parse_route(json).unwrap();
        assert_eq!(route.waypoints, vec![Waypoint::new(1.0, 2.0), Waypoint::new(3.0, 4.0)]);
    }

    #[test]
    fn test_parse_route_object() {
        let json = br#"{"id":"r-1","waypoints":[{"latitude":1.0,"longitude":2.0}]}"#;
        let route = parse_route(json).unwrap();
        assert_eq!(route.id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_parse_rejects_polygon() {
        let json = br#"{"type":"Polygon","coordinates":[[0.0,0.0],[1.0,1.0]]}"#;
        assert!(parse_route(json).is_err());
    }

    #[test]
    fn test_parse_rejects_short_coordinate() {
        let json = br#"{"type":"LineString","coordinates":[[0.0]]}"#;
        assert!(parse_route(json).is_err());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        assert!(parse_route(&[0xFF, 0xFE, 0x00]).is_err());
    }
}
