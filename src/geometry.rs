//! Spherical distance helpers for matching positions against a route.
//!
//! All distances are in meters on a sphere of mean Earth radius. Point to
//! segment distance uses cross-track and along-track distances, so the nearest
//! point may lie anywhere on a segment and not only on its vertices.

use crate::error::{MonitorError, Result};
use crate::model::{Waypoint, valid_coordinate};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Result of projecting a point onto a route polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteDistance {
    pub distance_meters: f64,
    /// Index `i` of the nearest segment `waypoints[i]..waypoints[i + 1]`.
    pub segment_index: usize,
}

/// Great-circle distance between two points.
pub fn haversine_meters(a: Waypoint, b: Waypoint) -> f64 {
    EARTH_RADIUS_METERS * angular_distance(a, b)
}

fn angular_distance(a: Waypoint, b: Waypoint) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.sqrt().min(1.0).asin()
}

/// Initial bearing from `a` to `b`, in radians.
fn bearing(a: Waypoint, b: Waypoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x)
}

/// Point reached by travelling `distance_meters` from `origin` on the given
/// initial bearing (degrees clockwise from north).
pub fn destination(origin: Waypoint, bearing_degrees: f64, distance_meters: f64) -> Waypoint {
    let delta = distance_meters / EARTH_RADIUS_METERS;
    let theta = bearing_degrees.to_radians();
    let lat1 = origin.latitude.to_radians();
    let lon1 = origin.longitude.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    let longitude = (lon2.to_degrees() + 540.0) % 360.0 - 180.0;
    Waypoint::new(lat2.to_degrees(), longitude)
}

/// Shortest distance from `point` to the segment `start..end`.
pub fn distance_to_segment(point: Waypoint, start: Waypoint, end: Waypoint) -> f64 {
    let segment = angular_distance(start, end);
    let to_point = angular_distance(start, point);
    if segment == 0.0 || to_point == 0.0 {
        return EARTH_RADIUS_METERS * to_point;
    }

    let relative = bearing(start, point) - bearing(start, end);
    let cross_track = (to_point.sin() * relative.sin()).clamp(-1.0, 1.0).asin();

    // Behind the segment start.
    if relative.cos() < 0.0 {
        return EARTH_RADIUS_METERS * to_point;
    }

    let along_track = (to_point.cos() / cross_track.cos()).clamp(-1.0, 1.0).acos();
    if along_track > segment {
        return haversine_meters(point, end);
    }

    EARTH_RADIUS_METERS * cross_track.abs()
}

/// Minimum distance from `point` to any segment of `route`.
///
/// # Errors
///
/// Returns [`MonitorError::InvalidRoute`] when the route has fewer than two
/// waypoints or a waypoint outside the valid coordinate range. Callers treat
/// this as "cannot evaluate deviation", never as "deviated".
pub fn distance_to_route(point: Waypoint, route: &[Waypoint]) -> Result<RouteDistance> {
    validate_route(route)?;

    let mut best = RouteDistance { distance_meters: f64::INFINITY, segment_index: 0 };
    for (index, pair) in route.windows(2).enumerate() {
        let distance = distance_to_segment(point, pair[0], pair[1]);
        if distance < best.distance_meters {
            best = RouteDistance { distance_meters: distance, segment_index: index };
        }
    }
    Ok(best)
}

/// Checks that a polyline can be evaluated.
///
/// # Errors
///
/// Returns [`MonitorError::InvalidRoute`] describing the first problem found.
pub fn validate_route(route: &[Waypoint]) -> Result<()> {
    if route.len() < 2 {
        return Err(MonitorError::InvalidRoute(format!(
            "route has {} waypoint(s), at least two are required",
            route.len()
        )));
    }
    if let Some((index, bad)) =
        route.iter().enumerate().find(|(_, w)| !valid_coordinate(w.latitude, w.longitude))
    {
        return Err(MonitorError::InvalidRoute(format!(
            "waypoint {index} out of range: ({}, {})",
            bad.latitude, bad.longitude
        )));
    }
    Ok(())
}

/// Total length of a polyline.
pub fn route_length_meters(route: &[Waypoint]) -> f64 {
    route.windows(2).map(|pair| haversine_meters(pair[0], pair[1])).sum()
}

/// Point at `distance_meters` along the polyline, clamped to its end.
///
/// Returns `None` for an empty polyline.
pub fn point_along(route: &[Waypoint], distance_meters: f64) -> Option<Waypoint> {
    let first = *route.first()?;
    let mut remaining = distance_meters.max(0.0);
    for pair in route.windows(2) {
        let length = haversine_meters(pair[0], pair[1]);
        if remaining <= length && length > 0.0 {
            let f = remaining / length;
            return Some(Waypoint::new(
                pair[0].latitude + (pair[1].latitude - pair[0].latitude) * f,
                pair[0].longitude + (pair[1].longitude - pair[0].longitude) * f,
            ));
        }
        remaining -= length;
    }
    Some(route.last().copied().unwrap_or(first))
}
