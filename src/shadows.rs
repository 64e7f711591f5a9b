//! Per-building ground shadows for one sun position and viewport.
//!
//! Buildings outside the padded viewport are culled before projection, shadows
//! shorter than a screen pixel are never generated, and overlapping shadows are
//! attenuated through a coarse density grid so clusters do not render as solid
//! black. The last frame is kept and reused while sun, viewport and building
//! set stay within tolerance.

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::Array2;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::config::{ProjectionMethod, ShadowConfig};
use crate::ephemeris::SunPosition;
use crate::geometry::{project_hull, project_ribbon, ring_centroid, BoundingBox, Position, ShadowLimits};
use crate::model::Building;

/// Ground resolution of a 256 px Web Mercator tile at zoom 0, metres/pixel.
const EQUATOR_METERS_PER_PIXEL: f64 = 156_543.033_92;

/// Building id → shadow ring. An empty ring means "evaluated, no shadow".
pub type ShadowMap = HashMap<String, Vec<Position>>;

/// One shadow ready for rendering: the polygon drawn with the building
/// footprint as a hole.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowDrawable {
    pub building_id: String,
    pub polygon: Vec<Position>,
    pub hole: Vec<Position>,
    pub opacity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowFrame {
    /// An entry for every building passed in, culled ones included.
    pub polygons: ShadowMap,
    pub drawables: Vec<ShadowDrawable>,
    /// Opacity before overlap attenuation.
    pub base_opacity: f64,
    /// Highest shadow count in any density cell.
    pub peak_density: u32,
}

impl ShadowFrame {
    fn empty_for(buildings: &[Building]) -> Self {
        Self {
            polygons: buildings
                .iter()
                .map(|b| (b.id().to_string(), Vec::new()))
                .collect(),
            ..Self::default()
        }
    }

    /// Shadow ring for a building, `None` if the building was not evaluated.
    pub fn polygon(&self, building_id: &str) -> Option<&[Position]> {
        self.polygons.get(building_id).map(Vec::as_slice)
    }

    pub fn is_dark(&self) -> bool {
        self.drawables.is_empty()
    }
}

// ── Opacity ─────────────────────────────────────────────────────────────────

/// Piecewise-linear shadow opacity over apparent altitude in degrees.
pub fn shadow_opacity(altitude_deg: f64, config: &ShadowConfig) -> f64 {
    let c = config;
    if altitude_deg <= c.fade_in_start_deg || altitude_deg >= c.fade_out_end_deg {
        0.0
    } else if altitude_deg < c.fade_in_end_deg {
        c.max_opacity * (altitude_deg - c.fade_in_start_deg) / (c.fade_in_end_deg - c.fade_in_start_deg)
    } else if altitude_deg <= c.fade_out_start_deg {
        c.max_opacity
    } else {
        c.max_opacity * (c.fade_out_end_deg - altitude_deg) / (c.fade_out_end_deg - c.fade_out_start_deg)
    }
}

/// Web Mercator ground resolution for 256 px tiles.
pub fn meters_per_pixel(zoom: f64, latitude_deg: f64) -> f64 {
    EQUATOR_METERS_PER_PIXEL * latitude_deg.to_radians().cos().abs() / 2f64.powf(zoom)
}

// ── Density grid ────────────────────────────────────────────────────────────

/// Shadow counts per viewport cell. Points outside the viewport land in the
/// nearest edge cell.
struct DensityGrid {
    counts: Array2<u32>,
    bounds: BoundingBox,
}

impl DensityGrid {
    fn new(bounds: BoundingBox, cells: usize) -> Self {
        let cells = cells.max(1);
        Self {
            counts: Array2::zeros((cells, cells)),
            bounds,
        }
    }

    fn cell(&self, p: &Position) -> (usize, usize) {
        let (rows, cols) = self.counts.dim();
        let index = |v: f64, lo: f64, span: f64, n: usize| -> usize {
            if span <= 0.0 || !v.is_finite() {
                return 0;
            }
            (((v - lo) / span * n as f64).floor().max(0.0) as usize).min(n - 1)
        };
        (
            index(p.lat, self.bounds.min_lat, self.bounds.height(), rows),
            index(p.lng, self.bounds.min_lng, self.bounds.width(), cols),
        )
    }

    /// Count a shadow at `p`, returning how many were there before it.
    fn record(&mut self, p: &Position) -> u32 {
        let cell = self.cell(p);
        let prior = self.counts[cell];
        self.counts[cell] += 1;
        prior
    }

    fn peak(&self) -> u32 {
        self.counts.max().copied().unwrap_or(0)
    }
}

// ── Frame computation ───────────────────────────────────────────────────────

fn project_building(
    building: &Building,
    sun: &SunPosition,
    limits: &ShadowLimits,
    method: ProjectionMethod,
) -> Vec<Position> {
    let sane = building.height().is_finite() && building.footprint().iter().all(Position::is_finite);
    debug_assert!(sane, "building {} has non-finite geometry", building.id());
    if !sane {
        log::error!("building {} has non-finite geometry, skipping its shadow", building.id());
        return Vec::new();
    }
    match method {
        ProjectionMethod::Ribbon => project_ribbon(building.footprint(), building.height(), sun, limits),
        ProjectionMethod::ConvexHull => project_hull(building.footprint(), building.height(), sun, limits),
    }
}

/// Compute a full shadow frame without consulting any cache.
pub fn compute_frame(
    config: &ShadowConfig,
    buildings: &[Building],
    sun: &SunPosition,
    viewport: &BoundingBox,
    zoom: f64,
) -> ShadowFrame {
    if sun.is_below(config.night_threshold_deg) {
        return ShadowFrame::empty_for(buildings);
    }
    let base_opacity = shadow_opacity(sun.altitude_deg(), config);
    if base_opacity < config.negligible_opacity {
        return ShadowFrame::empty_for(buildings);
    }

    let region = viewport.padded(config.viewport_padding);
    let limits = ShadowLimits {
        min_altitude_deg: config.min_altitude_for_length_deg,
        max_length_m: config.max_shadow_length_m,
        min_drawable_m: meters_per_pixel(zoom, viewport.center().lat) * config.min_drawable_pixels,
    };

    let visible: Vec<&Building> = buildings
        .iter()
        .filter(|b| b.bbox().intersects(&region))
        .collect();
    let projected: Vec<Vec<Position>> = visible
        .par_iter()
        .map(|b| project_building(b, sun, &limits, config.method))
        .collect();

    let mut frame = ShadowFrame::empty_for(buildings);
    frame.base_opacity = base_opacity;
    let floor = config.min_overlap_opacity.min(base_opacity);
    let mut grid = DensityGrid::new(*viewport, config.density_grid_cells);

    for (building, polygon) in visible.iter().zip(projected) {
        let Some(centroid) = ring_centroid(&polygon) else {
            continue;
        };
        let prior = grid.record(&centroid);
        let opacity = (base_opacity / (1.0 + f64::from(prior))).max(floor);
        frame.drawables.push(ShadowDrawable {
            building_id: building.id().to_string(),
            polygon: polygon.clone(),
            hole: building.footprint().to_vec(),
            opacity,
        });
        frame.polygons.insert(building.id().to_string(), polygon);
    }
    frame.peak_density = grid.peak();

    log::debug!(
        "shadow frame: {} buildings, {} visible, {} drawn, peak density {}",
        buildings.len(),
        visible.len(),
        frame.drawables.len(),
        frame.peak_density
    );
    frame
}

// ── Engine with reuse ───────────────────────────────────────────────────────

/// Zoom levels closer than this share a sub-pixel cutoff.
const ZOOM_TOLERANCE: f64 = 1e-3;

struct CachedFrame {
    sun: SunPosition,
    viewport: BoundingBox,
    zoom: f64,
    buildings: Arc<[Building]>,
    frame: Arc<ShadowFrame>,
}

/// Shadow engine holding the last computed frame.
pub struct ShadowEngine {
    config: ShadowConfig,
    last: Option<CachedFrame>,
}

impl ShadowEngine {
    pub fn new(config: ShadowConfig) -> Self {
        Self { config, last: None }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Shadows for `buildings` under `sun`, reusing the previous frame when
    /// the sun moved less than the configured tolerance, the viewport edges
    /// moved less than `bounds_tolerance_deg`, the zoom is unchanged and
    /// `buildings` is the very same collection.
    pub fn compute_shadows(
        &mut self,
        buildings: &Arc<[Building]>,
        sun: SunPosition,
        viewport: &BoundingBox,
        zoom: f64,
    ) -> Arc<ShadowFrame> {
        if let Some(frame) = self.reusable(buildings, &sun, viewport, zoom) {
            log::debug!("shadow frame reused");
            return frame;
        }
        let frame = Arc::new(compute_frame(&self.config, buildings, &sun, viewport, zoom));
        self.last = Some(CachedFrame {
            sun,
            viewport: *viewport,
            zoom,
            buildings: Arc::clone(buildings),
            frame: Arc::clone(&frame),
        });
        frame
    }

    /// The frame `compute_shadows` would return without recomputing, if any.
    pub fn reusable(
        &self,
        buildings: &Arc<[Building]>,
        sun: &SunPosition,
        viewport: &BoundingBox,
        zoom: f64,
    ) -> Option<Arc<ShadowFrame>> {
        let last = self.last.as_ref()?;
        let c = &self.config;
        let matches = Arc::ptr_eq(&last.buildings, buildings)
            && last.sun.is_close_to(sun, c.sun_altitude_tolerance_rad, c.sun_azimuth_tolerance_rad)
            && last.viewport.is_close_to(viewport, c.bounds_tolerance_deg)
            && (last.zoom - zoom).abs() < ZOOM_TOLERANCE;
        matches.then(|| Arc::clone(&last.frame))
    }

    pub fn last_frame(&self) -> Option<Arc<ShadowFrame>> {
        self.last.as_ref().map(|l| Arc::clone(&l.frame))
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: Position = Position::new(13.4, 52.5);

    fn block(id: &str, east_m: f64, north_m: f64, size_m: f64, height: f64) -> Building {
        let sw = ORIGIN.offset_meters(east_m, north_m);
        let ring = [
            sw,
            sw.offset_meters(size_m, 0.0),
            sw.offset_meters(size_m, size_m),
            sw.offset_meters(0.0, size_m),
        ];
        Building::new(id, &ring, height)
    }

    fn viewport() -> BoundingBox {
        BoundingBox::around(ORIGIN, 200.0)
    }

    fn buildings(list: Vec<Building>) -> Arc<[Building]> {
        list.into()
    }

    #[test]
    fn test_opacity_curve() {
        let cfg = ShadowConfig::default();
        assert_eq!(shadow_opacity(-5.0, &cfg), 0.0);
        assert_eq!(shadow_opacity(0.0, &cfg), 0.0);
        assert!((shadow_opacity(4.0, &cfg) - cfg.max_opacity / 2.0).abs() < 1e-12);
        assert_eq!(shadow_opacity(45.0, &cfg), cfg.max_opacity);
        assert!((shadow_opacity(80.0, &cfg) - cfg.max_opacity / 2.0).abs() < 1e-12);
        assert_eq!(shadow_opacity(90.0, &cfg), 0.0);
    }

    #[test]
    fn test_meters_per_pixel() {
        assert!((meters_per_pixel(0.0, 0.0) - EQUATOR_METERS_PER_PIXEL).abs() < 1e-6);
        assert!((meters_per_pixel(1.0, 60.0) - EQUATOR_METERS_PER_PIXEL / 4.0).abs() < 1e-3);
    }

    #[test]
    fn test_night_yields_empty_entries() {
        let set = buildings(vec![block("a", 0.0, 0.0, 10.0, 20.0), block("b", 50.0, 0.0, 10.0, 20.0)]);
        let sun = SunPosition::from_degrees(-3.0, 270.0);
        let frame = compute_frame(&ShadowConfig::default(), &set, &sun, &viewport(), 17.0);
        assert_eq!(frame.polygons.len(), 2);
        assert!(frame.polygons.values().all(Vec::is_empty));
        assert!(frame.is_dark());
    }

    #[test]
    fn test_culls_outside_viewport() {
        let set = buildings(vec![
            block("near", 0.0, 0.0, 10.0, 20.0),
            block("far", 5_000.0, 5_000.0, 10.0, 20.0),
        ]);
        let sun = SunPosition::from_degrees(30.0, 200.0);
        let frame = compute_frame(&ShadowConfig::default(), &set, &sun, &viewport(), 17.0);
        assert!(!frame.polygon("near").unwrap().is_empty());
        assert!(frame.polygon("far").unwrap().is_empty());
        assert_eq!(frame.polygon("missing"), None);
        assert_eq!(frame.drawables.len(), 1);
        assert_eq!(frame.drawables[0].hole, set[0].footprint());
    }

    #[test]
    fn test_near_zenith_is_sub_pixel() {
        let set = buildings(vec![block("tower", 0.0, 0.0, 10.0, 50.0)]);
        let sun = SunPosition::from_degrees(89.0, 180.0);
        let frame = compute_frame(&ShadowConfig::default(), &set, &sun, &viewport(), 16.0);
        assert!(frame.polygon("tower").unwrap().is_empty());
    }

    #[test]
    fn test_overlap_attenuation() {
        let set = buildings(vec![
            block("a", 0.0, 0.0, 10.0, 10.0),
            block("b", 0.0, 0.0, 10.0, 10.0),
            block("c", 0.0, 0.0, 10.0, 10.0),
        ]);
        let cfg = ShadowConfig::default();
        let sun = SunPosition::from_degrees(45.0, 180.0);
        let frame = compute_frame(&cfg, &set, &sun, &viewport(), 17.0);
        let opacities: Vec<f64> = frame.drawables.iter().map(|d| d.opacity).collect();
        assert_eq!(opacities.len(), 3);
        assert!((opacities[0] - cfg.max_opacity).abs() < 1e-12);
        assert!((opacities[1] - cfg.max_opacity / 2.0).abs() < 1e-12);
        assert!((opacities[2] - cfg.max_opacity / 3.0).abs() < 1e-12);
        assert_eq!(frame.peak_density, 3);
    }

    #[test]
    fn test_overlap_attenuation_floor() {
        let set = buildings((0..10).map(|i| block(&format!("b{i}"), 0.0, 0.0, 10.0, 10.0)).collect());
        let cfg = ShadowConfig::default();
        let sun = SunPosition::from_degrees(45.0, 180.0);
        let frame = compute_frame(&cfg, &set, &sun, &viewport(), 17.0);
        assert!(frame.drawables.iter().all(|d| d.opacity >= cfg.min_overlap_opacity));
        assert_eq!(frame.drawables.last().unwrap().opacity, cfg.min_overlap_opacity);
    }

    #[test]
    fn test_hull_method_produces_closed_ring() {
        let cfg = ShadowConfig {
            method: ProjectionMethod::ConvexHull,
            ..ShadowConfig::default()
        };
        let set = buildings(vec![block("a", 0.0, 0.0, 10.0, 15.0)]);
        let sun = SunPosition::from_degrees(30.0, 120.0);
        let frame = compute_frame(&cfg, &set, &sun, &viewport(), 17.0);
        let ring = frame.polygon("a").unwrap();
        assert!(ring.len() >= 5);
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn test_engine_reuses_frame_within_tolerance() {
        let set = buildings(vec![block("a", 0.0, 0.0, 10.0, 15.0)]);
        let mut engine = ShadowEngine::new(ShadowConfig::default());
        let sun = SunPosition::from_degrees(30.0, 150.0);
        let first = engine.compute_shadows(&set, sun, &viewport(), 17.0);

        let nudged = SunPosition::new(sun.altitude + 0.005, sun.azimuth + 0.02);
        let second = engine.compute_shadows(&set, nudged, &viewport(), 17.0);
        assert!(Arc::ptr_eq(&first, &second));

        let moved = SunPosition::new(sun.altitude + 0.05, sun.azimuth);
        let third = engine.compute_shadows(&set, moved, &viewport(), 17.0);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_engine_recomputes_for_new_collection_or_viewport() {
        let set = buildings(vec![block("a", 0.0, 0.0, 10.0, 15.0)]);
        let mut engine = ShadowEngine::new(ShadowConfig::default());
        let sun = SunPosition::from_degrees(30.0, 150.0);
        let first = engine.compute_shadows(&set, sun, &viewport(), 17.0);

        // Same contents, different collection
        let copy: Arc<[Building]> = set.iter().cloned().collect::<Vec<_>>().into();
        let second = engine.compute_shadows(&copy, sun, &viewport(), 17.0);
        assert!(!Arc::ptr_eq(&first, &second));

        let shifted = BoundingBox::around(ORIGIN.offset_meters(500.0, 0.0), 200.0);
        let third = engine.compute_shadows(&copy, sun, &shifted, 17.0);
        assert!(!Arc::ptr_eq(&second, &third));

        engine.invalidate();
        assert!(engine.last_frame().is_none());
    }

    #[test]
    fn test_engine_recomputes_for_new_zoom() {
        // 0.5 m tall: drawable at zoom 19, sub-pixel at zoom 14
        let set = buildings(vec![block("kerb", 0.0, 0.0, 4.0, 0.5)]);
        let mut engine = ShadowEngine::new(ShadowConfig::default());
        let sun = SunPosition::from_degrees(40.0, 180.0);
        let near = engine.compute_shadows(&set, sun, &viewport(), 19.0);
        assert!(!near.polygon("kerb").unwrap().is_empty());

        let far = engine.compute_shadows(&set, sun, &viewport(), 14.0);
        assert!(!Arc::ptr_eq(&near, &far));
        assert!(far.polygon("kerb").unwrap().is_empty());

        let again = engine.compute_shadows(&set, sun, &viewport(), 14.0);
        assert!(Arc::ptr_eq(&far, &again));
    }
}
