//! Planar geometry on WGS84 longitude/latitude pairs.
//!
//! Distances are small (a few kilometres at most), so an equirectangular
//! approximation with a per-latitude longitude scale is used throughout.

use serde::{Deserialize, Serialize};

use crate::ephemeris::SunPosition;

pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;
/// Points closer than this (degrees) to a ring edge count as inside.
pub const BOUNDARY_EPSILON_DEG: f64 = 1e-9;
/// Longitude scale below which offsets collapse to zero (near the poles).
const MIN_LNG_SCALE: f64 = 1e-12;

/// A (longitude, latitude) pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lng: f64,
    pub lat: f64,
}

impl Position {
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lng.is_finite() && self.lat.is_finite()
    }

    /// Move by metric offsets, converting at this position's own latitude.
    pub fn offset_meters(&self, east_m: f64, north_m: f64) -> Position {
        Position {
            lng: self.lng + meters_to_lng_degrees(east_m, self.lat),
            lat: self.lat + meters_to_lat_degrees(north_m),
        }
    }

    /// Metric (east, north) vector from `self` to `other`.
    pub fn delta_meters(&self, other: &Position) -> (f64, f64) {
        let mid_lat = 0.5 * (self.lat + other.lat);
        (
            lng_degrees_to_meters(other.lng - self.lng, mid_lat),
            lat_degrees_to_meters(other.lat - self.lat),
        )
    }

    pub fn distance_meters(&self, other: &Position) -> f64 {
        let (dx, dy) = self.delta_meters(other);
        dx.hypot(dy)
    }
}

// ── Metre / degree conversion ───────────────────────────────────────────────

pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE_LAT
}

/// Zero near the poles where a degree of longitude has no length.
pub fn meters_to_lng_degrees(meters: f64, latitude_deg: f64) -> f64 {
    let scale = latitude_deg.to_radians().cos();
    if scale.abs() < MIN_LNG_SCALE {
        return 0.0;
    }
    meters / (METERS_PER_DEGREE_LAT * scale)
}

pub fn lat_degrees_to_meters(degrees: f64) -> f64 {
    degrees * METERS_PER_DEGREE_LAT
}

pub fn lng_degrees_to_meters(degrees: f64, latitude_deg: f64) -> f64 {
    degrees * METERS_PER_DEGREE_LAT * latitude_deg.to_radians().cos()
}

// ── Bounding boxes ──────────────────────────────────────────────────────────

/// Axis-aligned box in degrees. `min_*` may exceed `max_*` only for an empty box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    pub const fn empty() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY)
    }

    pub fn from_points(points: &[Position]) -> Self {
        points.iter().fold(Self::empty(), |mut bb, p| {
            bb.min_lng = bb.min_lng.min(p.lng);
            bb.min_lat = bb.min_lat.min(p.lat);
            bb.max_lng = bb.max_lng.max(p.lng);
            bb.max_lat = bb.max_lat.max(p.lat);
            bb
        })
    }

    /// Square box of half-width `radius_m` around `center`.
    pub fn around(center: Position, radius_m: f64) -> Self {
        let dlat = meters_to_lat_degrees(radius_m);
        let dlng = meters_to_lng_degrees(radius_m, center.lat);
        Self::new(
            center.lng - dlng,
            center.lat - dlat,
            center.lng + dlng,
            center.lat + dlat,
        )
    }

    pub fn is_empty(&self) -> bool {
        !(self.min_lng <= self.max_lng && self.min_lat <= self.max_lat)
    }

    pub fn width(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn center(&self) -> Position {
        Position::new(
            0.5 * (self.min_lng + self.max_lng),
            0.5 * (self.min_lat + self.max_lat),
        )
    }

    pub fn contains(&self, p: &Position) -> bool {
        p.lng >= self.min_lng && p.lng <= self.max_lng && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        !other.is_empty()
            && other.min_lng >= self.min_lng
            && other.max_lng <= self.max_lng
            && other.min_lat >= self.min_lat
            && other.max_lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    /// Grow each side by `fraction` of the box's own span.
    pub fn padded(&self, fraction: f64) -> Self {
        let dx = self.width() * fraction;
        let dy = self.height() * fraction;
        Self::new(
            self.min_lng - dx,
            self.min_lat - dy,
            self.max_lng + dx,
            self.max_lat + dy,
        )
    }

    /// Grow each side by a metric distance, measured at the box centre.
    pub fn expanded_by_meters(&self, meters: f64) -> Self {
        let dlat = meters_to_lat_degrees(meters);
        let dlng = meters_to_lng_degrees(meters, self.center().lat);
        Self::new(
            self.min_lng - dlng,
            self.min_lat - dlat,
            self.max_lng + dlng,
            self.max_lat + dlat,
        )
    }

    /// Every edge within `tolerance_deg` of the other box's.
    pub fn is_close_to(&self, other: &BoundingBox, tolerance_deg: f64) -> bool {
        (self.min_lng - other.min_lng).abs() < tolerance_deg
            && (self.min_lat - other.min_lat).abs() < tolerance_deg
            && (self.max_lng - other.max_lng).abs() < tolerance_deg
            && (self.max_lat - other.max_lat).abs() < tolerance_deg
    }

    pub fn touches_antimeridian(&self) -> bool {
        self.min_lng <= -180.0 || self.max_lng >= 180.0
    }

    /// Plain lng/lat union. Boxes at the antimeridian are not unwrapped; the
    /// result is approximate there and a warning is logged.
    pub fn union(&self, other: &BoundingBox) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        if self.touches_antimeridian() || other.touches_antimeridian() {
            log::warn!(
                "bounds union across the antimeridian is approximate: {self:?} ∪ {other:?}"
            );
        }
        Self::new(
            self.min_lng.min(other.min_lng),
            self.min_lat.min(other.min_lat),
            self.max_lng.max(other.max_lng),
            self.max_lat.max(other.max_lat),
        )
    }
}

// ── Rings ───────────────────────────────────────────────────────────────────

/// Append the first vertex if the ring is open.
pub fn close_ring(points: &[Position]) -> Vec<Position> {
    let mut ring = points.to_vec();
    if let (Some(first), Some(last)) = (points.first(), points.last()) {
        if first != last {
            ring.push(*first);
        }
    }
    ring
}

/// Vertices of a ring without the closing duplicate.
pub fn open_vertices(ring: &[Position]) -> &[Position] {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// Vertex average of a ring (closing duplicate ignored).
pub fn ring_centroid(ring: &[Position]) -> Option<Position> {
    let vertices = open_vertices(ring);
    if vertices.is_empty() {
        return None;
    }
    let n = vertices.len() as f64;
    let (sx, sy) = vertices
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.lng, sy + p.lat));
    Some(Position::new(sx / n, sy / n))
}

fn distance_sq_to_segment(p: &Position, a: &Position, b: &Position) -> f64 {
    let (dx, dy) = (b.lng - a.lng, b.lat - a.lat);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((p.lng - a.lng) * dx + (p.lat - a.lat) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (a.lng + t * dx - p.lng, a.lat + t * dy - p.lat);
    cx * cx + cy * cy
}

/// Ray-casting point-in-polygon test, boundary inclusive.
///
/// Accepts open or closed rings; fewer than three distinct vertices is
/// never a polygon.
pub fn is_point_in_polygon(point: &Position, ring: &[Position]) -> bool {
    let vertices = open_vertices(ring);
    let n = vertices.len();
    if n < 3 {
        return false;
    }

    let eps_sq = BOUNDARY_EPSILON_DEG * BOUNDARY_EPSILON_DEG;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = &vertices[i];
        let b = &vertices[j];
        if distance_sq_to_segment(point, a, b) <= eps_sq {
            return true;
        }
        // Horizontal edges never cross a horizontal ray
        if (a.lat > point.lat) != (b.lat > point.lat) {
            let x_cross = (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng;
            if point.lng < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ── Convex hull ─────────────────────────────────────────────────────────────

fn cross(o: &Position, a: &Position, b: &Position) -> f64 {
    (a.lng - o.lng) * (b.lat - o.lat) - (a.lat - o.lat) * (b.lng - o.lng)
}

fn dist_sq(a: &Position, b: &Position) -> f64 {
    let (dx, dy) = (b.lng - a.lng, b.lat - a.lat);
    dx * dx + dy * dy
}

/// Gift-wrapping (Jarvis march) hull, counter-clockwise and closed.
///
/// Collinear candidates resolve to the farthest point. The walk is capped at
/// twice the point count; a walk that has not closed by then returns the
/// partial hull gathered so far. Fewer than three distinct points gives an
/// empty hull.
pub fn convex_hull(points: &[Position]) -> Vec<Position> {
    let mut unique: Vec<Position> = Vec::with_capacity(points.len());
    for p in points.iter().filter(|p| p.is_finite()) {
        if !unique.iter().any(|q| dist_sq(p, q) <= f64::EPSILON) {
            unique.push(*p);
        }
    }
    if unique.len() < 3 {
        return Vec::new();
    }
    gift_wrap(&unique, 2 * unique.len())
}

/// Jarvis walk over distinct points, giving up after `max_iterations` steps.
fn gift_wrap(unique: &[Position], max_iterations: usize) -> Vec<Position> {
    let start = unique
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.lng
                .total_cmp(&b.lng)
                .then_with(|| a.lat.total_cmp(&b.lat))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut hull = Vec::with_capacity(unique.len() + 1);
    let mut current = start;
    for _ in 0..max_iterations {
        hull.push(unique[current]);
        let mut candidate = (current + 1) % unique.len();
        for (i, p) in unique.iter().enumerate() {
            if i == current {
                continue;
            }
            let turn = cross(&unique[current], &unique[candidate], p);
            let farther = dist_sq(&unique[current], p) > dist_sq(&unique[current], &unique[candidate]);
            if turn < 0.0 || (turn == 0.0 && farther) {
                candidate = i;
            }
        }
        current = candidate;
        if current == start {
            hull.push(unique[start]);
            return hull;
        }
    }

    log::warn!(
        "convex hull did not close after {max_iterations} steps, returning partial hull"
    );
    if hull.len() >= 3 {
        hull.push(hull[0]);
        hull
    } else {
        Vec::new()
    }
}

// ── Shadow projection ───────────────────────────────────────────────────────

/// Limits applied when turning a building into a shadow polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowLimits {
    /// Altitude floor (degrees) for the tangent in `height / tan(altitude)`.
    pub min_altitude_deg: f64,
    pub max_length_m: f64,
    /// Shadows shorter than this are not produced.
    pub min_drawable_m: f64,
}

impl Default for ShadowLimits {
    fn default() -> Self {
        Self {
            min_altitude_deg: 0.1,
            max_length_m: 1500.0,
            min_drawable_m: 0.0,
        }
    }
}

/// Ground shadow length in metres for an object of `height_m`.
///
/// Zero for non-positive or non-finite heights.
pub fn shadow_length(height_m: f64, sun: &SunPosition, limits: &ShadowLimits) -> f64 {
    if !(height_m.is_finite() && height_m > 0.0) {
        return 0.0;
    }
    let tan_floor = limits.min_altitude_deg.to_radians().tan();
    let tan_alt = sun.altitude.tan().max(tan_floor);
    (height_m / tan_alt).min(limits.max_length_m)
}

/// Metric displacement (east, north) of a shadow tip: away from the sun.
pub fn shadow_offset(length_m: f64, sun: &SunPosition) -> (f64, f64) {
    (-length_m * sun.azimuth.sin(), -length_m * sun.azimuth.cos())
}

fn translated_ring(ring: &[Position], length_m: f64, sun: &SunPosition) -> Vec<Position> {
    let (east, north) = shadow_offset(length_m, sun);
    ring.iter().map(|p| p.offset_meters(east, north)).collect()
}

fn projection_length(
    ring: &[Position],
    height_m: f64,
    sun: &SunPosition,
    limits: &ShadowLimits,
) -> Option<f64> {
    debug_assert!(
        ring.iter().all(Position::is_finite) && !height_m.is_nan(),
        "shadow projection fed non-finite geometry"
    );
    if open_vertices(ring).len() < 3 {
        return None;
    }
    let length = shadow_length(height_m, sun, limits);
    if length <= 0.0 || length < limits.min_drawable_m {
        return None;
    }
    Some(length)
}

/// Ribbon shadow: the sunward chain of the footprint stitched to the
/// translated leeward chain, closed.
///
/// The footprint is split at its two silhouette vertices (extreme lateral
/// offset across the shadow direction). For a convex footprint the ring is
/// exactly the area swept from footprint to tip. A concave footprint keeps
/// the stitched ring only when it is simple and holds every swept edge;
/// otherwise the result is the hull projection. Empty when the footprint is
/// degenerate or the shadow is shorter than `limits.min_drawable_m`.
pub fn project_ribbon(
    ring: &[Position],
    height_m: f64,
    sun: &SunPosition,
    limits: &ShadowLimits,
) -> Vec<Position> {
    let Some(length) = projection_length(ring, height_m, sun, limits) else {
        return Vec::new();
    };
    let vertices = open_vertices(ring);
    let n = vertices.len();
    let (east, north) = shadow_offset(length, sun);
    let (dx, dy) = (east / length, north / length);

    let origin = vertices[0];
    let local: Vec<(f64, f64)> = vertices.iter().map(|v| origin.delta_meters(v)).collect();
    let lateral = |i: usize| local[i].0 * dy - local[i].1 * dx;
    let along = |i: usize| local[i].0 * dx + local[i].1 * dy;

    let mut lo = 0;
    let mut hi = 0;
    for i in 1..n {
        if lateral(i) < lateral(lo) {
            lo = i;
        }
        if lateral(i) > lateral(hi) {
            hi = i;
        }
    }
    if lateral(hi) - lateral(lo) < 1e-9 {
        // Footprint is a sliver along the shadow direction
        return project_hull(ring, height_m, sun, limits);
    }

    let chain = |from: usize, to: usize| -> Vec<usize> {
        let mut out = vec![from];
        let mut i = from;
        while i != to {
            i = (i + 1) % n;
            out.push(i);
        }
        out
    };
    let mean_along = |c: &[usize]| c.iter().map(|&i| along(i)).sum::<f64>() / c.len() as f64;
    let first = chain(lo, hi);
    let second = chain(hi, lo);
    let (front, back) = if mean_along(&first) <= mean_along(&second) {
        (first, second)
    } else {
        (second, first)
    };

    let mut polygon = Vec::with_capacity(front.len() + back.len() + 1);
    polygon.extend(front.iter().map(|&i| vertices[i]));
    polygon.extend(back.iter().map(|&i| vertices[i].offset_meters(east, north)));
    polygon.push(vertices[front[0]]);

    if is_convex(&local) || ring_holds_sweep(&polygon, vertices, east, north) {
        polygon
    } else {
        log::debug!("ribbon stitch misses part of a concave footprint's sweep, using hull");
        project_hull(ring, height_m, sun, limits)
    }
}

/// Turns smaller than this (m²) count as straight.
const TURN_EPSILON_M2: f64 = 1e-3;
/// Distance (m) within which a point counts as lying on a segment.
const ON_SEGMENT_M: f64 = 1e-3;

type Local = (f64, f64);

fn turn(o: Local, a: Local, b: Local) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

fn is_convex(local: &[Local]) -> bool {
    let n = local.len();
    let (mut left, mut right) = (false, false);
    for i in 0..n {
        let t = turn(local[i], local[(i + 1) % n], local[(i + 2) % n]);
        left |= t > TURN_EPSILON_M2;
        right |= t < -TURN_EPSILON_M2;
    }
    !(left && right)
}

/// Signed distance class of `p` from line `ab`: -1, 0 (on it) or 1.
fn side(a: Local, b: Local, p: Local) -> i8 {
    let len = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt();
    if len <= f64::EPSILON {
        return 0;
    }
    let d = turn(a, b, p) / len;
    if d > ON_SEGMENT_M {
        1
    } else if d < -ON_SEGMENT_M {
        -1
    } else {
        0
    }
}

/// Segments cross at a single interior point of both.
fn crosses(a: Local, b: Local, c: Local, d: Local) -> bool {
    side(c, d, a) * side(c, d, b) < 0 && side(a, b, c) * side(a, b, d) < 0
}

fn near_segment(p: Local, a: Local, b: Local) -> bool {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f64::EPSILON {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (ex, ey) = (a.0 + t * dx - p.0, a.1 + t * dy - p.1);
    ex * ex + ey * ey <= ON_SEGMENT_M * ON_SEGMENT_M
}

fn inside_local(p: Local, ring: &[Local]) -> bool {
    let mut inside = false;
    for edge in ring.windows(2) {
        let (a, b) = (edge[0], edge[1]);
        if near_segment(p, a, b) {
            return true;
        }
        if (a.1 > p.1) != (b.1 > p.1) && p.0 < (b.0 - a.0) * (p.1 - a.1) / (b.1 - a.1) + a.0 {
            inside = !inside;
        }
    }
    inside
}

/// Whether the closed ring `polygon` is simple and contains the footprint,
/// its translated copy and every vertex's sweep between them.
fn ring_holds_sweep(polygon: &[Position], vertices: &[Position], east: f64, north: f64) -> bool {
    // Equirectangular about one origin keeps straight edges straight
    let origin = vertices[0];
    let lng_scale = lng_degrees_to_meters(1.0, origin.lat);
    let to_local = |p: &Position| -> Local {
        (
            (p.lng - origin.lng) * lng_scale,
            lat_degrees_to_meters(p.lat - origin.lat),
        )
    };
    let ring: Vec<Local> = polygon.iter().map(to_local).collect();
    let edges = ring.len() - 1;
    for i in 0..edges {
        for j in i + 2..edges {
            if i == 0 && j == edges - 1 {
                continue;
            }
            if crosses(ring[i], ring[i + 1], ring[j], ring[j + 1]) {
                return false;
            }
        }
    }

    let base: Vec<Local> = vertices.iter().map(to_local).collect();
    let moved: Vec<Local> = vertices
        .iter()
        .map(|v| to_local(&v.offset_meters(east, north)))
        .collect();
    let n = vertices.len();
    let segments = (0..n).flat_map(|i| {
        let k = (i + 1) % n;
        [(base[i], base[k]), (moved[i], moved[k]), (base[i], moved[i])]
    });
    for (a, b) in segments {
        let mid = (0.5 * (a.0 + b.0), 0.5 * (a.1 + b.1));
        if ![a, mid, b].iter().all(|&p| inside_local(p, &ring)) {
            return false;
        }
        if ring.windows(2).any(|e| crosses(a, b, e[0], e[1])) {
            return false;
        }
    }
    true
}

/// Convex hull of footprint and translated footprint vertices.
pub fn project_hull(
    ring: &[Position],
    height_m: f64,
    sun: &SunPosition,
    limits: &ShadowLimits,
) -> Vec<Position> {
    let Some(length) = projection_length(ring, height_m, sun, limits) else {
        return Vec::new();
    };
    let vertices = open_vertices(ring);
    let mut points = vertices.to_vec();
    points.extend(translated_ring(vertices, length, sun));
    convex_hull(&points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lng: f64, lat: f64, size_m: f64) -> Vec<Position> {
        let sw = Position::new(lng, lat);
        vec![
            sw,
            sw.offset_meters(size_m, 0.0),
            sw.offset_meters(size_m, size_m),
            sw.offset_meters(0.0, size_m),
            sw,
        ]
    }

    #[test]
    fn test_point_in_polygon_inside_outside_vertex() {
        let ring = square(13.4, 52.5, 20.0);
        let inside = ring[0].offset_meters(10.0, 10.0);
        assert!(is_point_in_polygon(&inside, &ring));
        assert!(!is_point_in_polygon(&Position::new(14.0, 53.0), &ring));
        assert!(is_point_in_polygon(&ring[2], &ring));
        // Midpoint of an edge
        let edge_mid = Position::new(
            0.5 * (ring[0].lng + ring[1].lng),
            0.5 * (ring[0].lat + ring[1].lat),
        );
        assert!(is_point_in_polygon(&edge_mid, &ring));
    }

    #[test]
    fn test_point_in_polygon_open_ring_and_degenerate() {
        let ring = square(0.0, 0.0, 50.0);
        let open = &ring[..4];
        let inside = ring[0].offset_meters(25.0, 25.0);
        assert!(is_point_in_polygon(&inside, open));
        assert!(!is_point_in_polygon(&inside, &ring[..2]));
        assert!(!is_point_in_polygon(&inside, &[]));
    }

    #[test]
    fn test_point_in_concave_polygon() {
        // U shape opening north
        let ring = vec![
            Position::new(0.0, 0.0),
            Position::new(3.0, 0.0),
            Position::new(3.0, 3.0),
            Position::new(2.0, 3.0),
            Position::new(2.0, 1.0),
            Position::new(1.0, 1.0),
            Position::new(1.0, 3.0),
            Position::new(0.0, 3.0),
        ];
        assert!(is_point_in_polygon(&Position::new(0.5, 2.0), &ring));
        assert!(!is_point_in_polygon(&Position::new(1.5, 2.0), &ring));
    }

    #[test]
    fn test_lng_conversion_at_pole_is_zero() {
        assert_eq!(meters_to_lng_degrees(100.0, 90.0), 0.0);
        let p = Position::new(10.0, 90.0).offset_meters(500.0, 0.0);
        assert_eq!(p.lng, 10.0);
    }

    #[test]
    fn test_meter_round_trip() {
        let a = Position::new(2.35, 48.85);
        let b = a.offset_meters(30.0, -40.0);
        assert!((a.distance_meters(&b) - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_shadow_length_monotonic_and_capped() {
        let limits = ShadowLimits::default();
        let mut previous = f64::INFINITY;
        for alt in [0.0, 0.5, 2.0, 10.0, 30.0, 45.0, 60.0, 80.0, 89.9] {
            let sun = SunPosition::from_degrees(alt, 180.0);
            let len = shadow_length(20.0, &sun, &limits);
            assert!(len <= previous, "length grew at altitude {alt}");
            assert!(len <= limits.max_length_m);
            previous = len;
        }
        let low = SunPosition::from_degrees(-0.5, 90.0);
        assert_eq!(shadow_length(20.0, &low, &limits), limits.max_length_m);
        assert_eq!(shadow_length(-3.0, &low, &limits), 0.0);
    }

    #[test]
    fn test_ribbon_midday_low_building() {
        let ring = square(13.4, 52.5, 10.0);
        let sun = SunPosition::from_degrees(45.0, 180.0);
        let poly = project_ribbon(&ring, 10.0, &sun, &ShadowLimits::default());
        assert_eq!(poly.first(), poly.last());

        // Shadow reaches ~10 m due north of the footprint's north edge
        let (max_east, max_north) = poly
            .iter()
            .map(|p| ring[0].delta_meters(p))
            .fold((f64::MIN, f64::MIN), |(e, n), (x, y)| (e.max(x), n.max(y)));
        assert!((max_north - 20.0).abs() < 0.01, "north = {max_north}");
        assert!((max_east - 10.0).abs() < 0.01, "east = {max_east}");
        assert!(is_point_in_polygon(&ring[0].offset_meters(5.0, 15.0), &poly));
        assert!(!is_point_in_polygon(&ring[0].offset_meters(5.0, 21.0), &poly));
        assert!(!is_point_in_polygon(&ring[0].offset_meters(5.0, -1.0), &poly));
    }

    #[test]
    fn test_ribbon_covers_band_between_footprint_and_tip() {
        let ring = square(13.4, 52.5, 10.0);
        let sun = SunPosition::from_degrees(20.0, 200.0);
        let poly = project_ribbon(&ring, 30.0, &sun, &ShadowLimits::default());
        let length = shadow_length(30.0, &sun, &ShadowLimits::default());
        let (east, north) = shadow_offset(length, &sun);
        // Halfway between the footprint centre and its shifted copy
        let mid = ring[0].offset_meters(5.0 + 0.5 * east, 5.0 + 0.5 * north);
        assert!(length > 50.0);
        assert!(is_point_in_polygon(&mid, &poly));
    }

    #[test]
    fn test_ribbon_follows_concave_leeward_outline() {
        // U shape opening north, sun from the south
        let sw = Position::new(13.4, 52.5);
        let ring: Vec<Position> = [
            (0.0, 0.0),
            (30.0, 0.0),
            (30.0, 30.0),
            (20.0, 30.0),
            (20.0, 10.0),
            (10.0, 10.0),
            (10.0, 30.0),
            (0.0, 30.0),
        ]
        .iter()
        .map(|&(e, n)| sw.offset_meters(e, n))
        .collect();
        let sun = SunPosition::from_degrees(45.0, 180.0);
        let poly = project_ribbon(&ring, 5.0, &sun, &ShadowLimits::default());
        // The notch stays open past the 5 m shadow of its floor
        assert!(!is_point_in_polygon(&sw.offset_meters(15.0, 25.0), &poly));
        assert!(is_point_in_polygon(&sw.offset_meters(15.0, 12.0), &poly));
        let hull = project_hull(&ring, 5.0, &sun, &ShadowLimits::default());
        assert!(is_point_in_polygon(&sw.offset_meters(15.0, 25.0), &hull));
    }

    /// Footprint from metric `(east, north)` corners about `sw`.
    fn outline(sw: Position, corners: &[(f64, f64)]) -> Vec<Position> {
        corners.iter().map(|&(e, n)| sw.offset_meters(e, n)).collect()
    }

    /// Grid cells swept by the footprint on its way to the tip that the
    /// shadow polygon leaves out.
    fn uncovered_sweep(footprint: &[Position], height: f64, sun: &SunPosition) -> Vec<(f64, f64)> {
        let limits = ShadowLimits::default();
        let poly = project_ribbon(footprint, height, sun, &limits);
        let length = shadow_length(height, sun, &limits);
        let (east, north) = shadow_offset(length, sun);
        let sw = footprint[0];
        let mut missed = Vec::new();
        let reach = 32.0 + length;
        let mut x = -reach + 0.37;
        while x < reach {
            let mut y = -reach + 0.41;
            while y < reach {
                let p = sw.offset_meters(x, y);
                let swept = (0..=100).any(|k| {
                    let t = f64::from(k) / 100.0;
                    is_point_in_polygon(&p.offset_meters(-t * east, -t * north), footprint)
                });
                if swept && !is_point_in_polygon(&p, &poly) {
                    missed.push((x, y));
                }
                y += 1.0;
            }
            x += 1.0;
        }
        missed
    }

    const L_SHAPE: [(f64, f64); 6] = [
        (0.0, 0.0),
        (30.0, 0.0),
        (30.0, 10.0),
        (10.0, 10.0),
        (10.0, 30.0),
        (0.0, 30.0),
    ];

    #[test]
    fn test_ribbon_covers_l_shape_at_oblique_sun() {
        let ring = outline(Position::new(13.4, 52.5), &L_SHAPE);
        for height in [5.0, 30.0] {
            let sun = SunPosition::from_degrees(30.0, 135.0);
            let missed = uncovered_sweep(&ring, height, &sun);
            assert!(missed.is_empty(), "h = {height}: {} cells missed, e.g. {:?}", missed.len(), missed.first());
        }
        // Inside the footprint itself
        let sun = SunPosition::from_degrees(30.0, 135.0);
        let poly = project_ribbon(&ring, 5.0, &sun, &ShadowLimits::default());
        assert!(is_point_in_polygon(&ring[0].offset_meters(4.4, 16.4), &poly));
    }

    #[test]
    fn test_ribbon_covers_u_opening_towards_sun() {
        // U opening south
        let ring = outline(
            Position::new(13.4, 52.5),
            &[
                (0.0, 0.0),
                (10.0, 0.0),
                (10.0, 20.0),
                (20.0, 20.0),
                (20.0, 0.0),
                (30.0, 0.0),
                (30.0, 30.0),
                (0.0, 30.0),
            ],
        );
        for azimuth in [180.0, 205.0, 250.0] {
            let sun = SunPosition::from_degrees(30.0, azimuth);
            let missed = uncovered_sweep(&ring, 5.0, &sun);
            assert!(missed.is_empty(), "az = {azimuth}: {} cells missed", missed.len());
        }
    }

    #[test]
    fn test_ribbon_covers_convex_footprint_sweep() {
        let ring = outline(
            Position::new(13.4, 52.5),
            &[(0.0, 0.0), (20.0, -5.0), (28.0, 12.0), (8.0, 22.0)],
        );
        for azimuth in [0.0, 95.0, 200.0, 310.0] {
            let sun = SunPosition::from_degrees(35.0, azimuth);
            assert!(uncovered_sweep(&ring, 12.0, &sun).is_empty(), "az = {azimuth}");
        }
    }

    #[test]
    fn test_ribbon_near_zenith_is_empty() {
        let ring = square(13.4, 52.5, 10.0);
        let sun = SunPosition::from_degrees(89.0, 180.0);
        let limits = ShadowLimits {
            min_drawable_m: 1.0,
            ..ShadowLimits::default()
        };
        assert!(project_ribbon(&ring, 50.0, &sun, &limits).is_empty());
    }

    #[test]
    fn test_ribbon_respects_length_cap() {
        let ring = square(0.0, 45.0, 10.0);
        let limits = ShadowLimits::default();
        for alt in [-0.8, 0.05, 1.0, 5.0] {
            let sun = SunPosition::from_degrees(alt, 237.0);
            let poly = project_ribbon(&ring, 300.0, &sun, &limits);
            for p in &poly {
                let nearest = ring
                    .iter()
                    .map(|v| v.distance_meters(p))
                    .fold(f64::INFINITY, f64::min);
                assert!(nearest <= limits.max_length_m + 0.5, "{nearest} m at {alt}°");
            }
        }
    }

    #[test]
    fn test_ribbon_degenerate_footprint() {
        let sun = SunPosition::from_degrees(30.0, 90.0);
        let line = vec![Position::new(0.0, 0.0), Position::new(0.001, 0.0)];
        assert!(project_ribbon(&line, 10.0, &sun, &ShadowLimits::default()).is_empty());
        let ring = square(0.0, 0.0, 10.0);
        assert!(project_ribbon(&ring, 0.0, &sun, &ShadowLimits::default()).is_empty());
    }

    #[test]
    fn test_convex_hull_square_with_interior_and_collinear_points() {
        let points = vec![
            Position::new(0.0, 0.0),
            Position::new(1.0, 0.0),
            Position::new(2.0, 0.0),
            Position::new(2.0, 2.0),
            Position::new(0.0, 2.0),
            Position::new(1.0, 1.0),
            Position::new(0.0, 0.0),
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull.first(), hull.last());
        let vertices = open_vertices(&hull);
        assert_eq!(vertices.len(), 4);
        assert!(!vertices.contains(&Position::new(1.0, 1.0)));
        assert!(!vertices.contains(&Position::new(1.0, 0.0)));
    }

    #[test]
    fn test_convex_hull_degenerate_inputs() {
        assert!(convex_hull(&[]).is_empty());
        let same = vec![Position::new(1.0, 1.0); 5];
        assert!(convex_hull(&same).is_empty());
        let line = vec![
            Position::new(0.0, 0.0),
            Position::new(1.0, 1.0),
            Position::new(2.0, 2.0),
        ];
        // Must terminate; a collinear set has no area
        let hull = convex_hull(&line);
        assert!(hull.len() <= 2 * line.len() + 1);
    }

    #[test]
    fn test_gift_wrap_returns_partial_hull_at_step_cap() {
        let points = vec![
            Position::new(0.0, 0.0),
            Position::new(2.0, -1.0),
            Position::new(4.0, 0.0),
            Position::new(3.0, 3.0),
            Position::new(1.0, 3.0),
        ];
        assert_eq!(open_vertices(&gift_wrap(&points, 10)).len(), 5);

        let partial = gift_wrap(&points, 3);
        assert_eq!(partial.len(), 4);
        assert_eq!(partial.first(), partial.last());
        assert_eq!(partial[0], Position::new(0.0, 0.0));

        assert!(gift_wrap(&points, 2).is_empty());
    }

    #[test]
    fn test_hull_projection_covers_ribbon() {
        let ring = square(13.4, 52.5, 12.0);
        let sun = SunPosition::from_degrees(20.0, 135.0);
        let hull = project_hull(&ring, 15.0, &sun, &ShadowLimits::default());
        let ribbon = project_ribbon(&ring, 15.0, &sun, &ShadowLimits::default());
        assert!(!hull.is_empty());
        for p in open_vertices(&ribbon) {
            assert!(is_point_in_polygon(p, &hull));
        }
    }

    #[test]
    fn test_bbox_ops() {
        let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let b = BoundingBox::new(0.5, 0.5, 2.0, 2.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&BoundingBox::new(3.0, 3.0, 4.0, 4.0)));
        assert!(!a.intersects(&BoundingBox::empty()));
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(0.0, 0.0, 2.0, 2.0));
        assert!(u.contains_box(&a));
        assert_eq!(BoundingBox::empty().union(&a), a);
        assert!(a.is_close_to(&BoundingBox::new(0.0005, 0.0, 1.0, 1.0), 0.0008));
        assert!(!a.is_close_to(&BoundingBox::new(0.001, 0.0, 1.0, 1.0), 0.0008));
        let padded = a.padded(0.1);
        assert!((padded.min_lng + 0.1).abs() < 1e-12);
        assert!((padded.max_lat - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_bbox_union_at_antimeridian_is_plain() {
        let east = BoundingBox::new(179.5, 0.0, 180.0, 1.0);
        let west = BoundingBox::new(-180.0, 0.0, -179.5, 1.0);
        let u = east.union(&west);
        assert_eq!(u.min_lng, -180.0);
        assert_eq!(u.max_lng, 180.0);
    }
}
