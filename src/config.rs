//! Engine tunables.
//!
//! Every threshold the shadow, occlusion and terrain passes rely on lives here
//! so a host can load a partial JSON document and override only what it needs.

use serde::{Deserialize, Serialize};

use crate::ephemeris::NIGHT_THRESHOLD_DEG;
use crate::error::{EngineError, EngineResult};

/// How a building footprint is extruded into its ground shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMethod {
    /// Sunward half of the footprint stitched to the translated leeward half.
    Ribbon,
    /// Gift-wrapped hull of footprint and translated vertices. Overestimates
    /// area for concave or rotated footprints.
    ConvexHull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub method: ProjectionMethod,
    /// Upper bound on a single shadow's length in metres.
    pub max_shadow_length_m: f64,
    /// Altitude floor (degrees) used in `height / tan(altitude)`.
    pub min_altitude_for_length_deg: f64,
    /// Apparent altitude at or below which no shadows are drawn.
    pub night_threshold_deg: f64,
    // Piecewise-linear opacity curve over altitude in degrees:
    // 0 below `fade_in_start_deg`, ramp to `max_opacity` at `fade_in_end_deg`,
    // plateau until `fade_out_start_deg`, ramp to 0 at `fade_out_end_deg`.
    pub fade_in_start_deg: f64,
    pub fade_in_end_deg: f64,
    pub fade_out_start_deg: f64,
    pub fade_out_end_deg: f64,
    pub max_opacity: f64,
    /// Opacities below this are treated as invisible and skip projection.
    pub negligible_opacity: f64,
    /// Fraction of the viewport span added on each side before culling.
    pub viewport_padding: f64,
    /// Cells per axis of the overlap density grid.
    pub density_grid_cells: usize,
    /// Lower bound for density-attenuated opacity.
    pub min_overlap_opacity: f64,
    /// Shadows shorter than this many screen pixels are not generated.
    pub min_drawable_pixels: f64,
    pub sun_altitude_tolerance_rad: f64,
    pub sun_azimuth_tolerance_rad: f64,
    pub bounds_tolerance_deg: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            method: ProjectionMethod::Ribbon,
            max_shadow_length_m: 1500.0,
            min_altitude_for_length_deg: 0.1,
            night_threshold_deg: NIGHT_THRESHOLD_DEG,
            fade_in_start_deg: 0.0,
            fade_in_end_deg: 8.0,
            fade_out_start_deg: 70.0,
            fade_out_end_deg: 90.0,
            max_opacity: 0.28,
            negligible_opacity: 0.005,
            viewport_padding: 0.15,
            density_grid_cells: 28,
            min_overlap_opacity: 0.06,
            min_drawable_pixels: 1.0,
            sun_altitude_tolerance_rad: 0.01,
            sun_azimuth_tolerance_rad: 0.035,
            bounds_tolerance_deg: 0.0008,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionConfig {
    /// Radius of the probe ring around a place with no host building.
    pub probe_radius_m: f64,
    /// Probe ring radius for a place sitting inside a building footprint.
    pub host_probe_radius_m: f64,
    /// Number of ring probes; 0 samples the centre only.
    pub probe_count: usize,
    /// Probe ring radius used for the edge-correction samples.
    pub tight_probe_radius_m: f64,
    pub edge_correction: bool,
    pub edge_probe_offset_m: f64,
    /// Cardinal edge samples (out of 4) that must be shadowed to flip a place.
    pub edge_min_shadowed: usize,
    /// Allowance added to a blocker's half diagonal in the angular test.
    pub lateral_allowance_m: f64,
    pub terrain_margin_deg: f64,
    /// Terrain checks are skipped entirely above this many visible places.
    pub max_places_for_terrain: usize,
    /// Horizon cache misses serviced per redraw.
    pub max_new_horizon_queries: usize,
    pub consensus: bool,
    pub consensus_radius_m: f64,
    pub consensus_fraction: f64,
    pub consensus_min_neighbors: usize,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            probe_radius_m: 1.5,
            host_probe_radius_m: 0.6,
            probe_count: 8,
            tight_probe_radius_m: 0.5,
            edge_correction: true,
            edge_probe_offset_m: 2.5,
            edge_min_shadowed: 3,
            lateral_allowance_m: 2.0,
            terrain_margin_deg: 0.5,
            max_places_for_terrain: 150,
            max_new_horizon_queries: 24,
            consensus: true,
            consensus_radius_m: 10.0,
            consensus_fraction: 0.66,
            consensus_min_neighbors: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Zoom level at which elevation tiles are requested.
    pub zoom: u8,
    pub hi_dpi: bool,
    pub tile_cache_capacity: usize,
    pub initial_step_m: f64,
    pub step_growth: f64,
    pub max_step_m: f64,
    pub max_distance_m: f64,
    /// Ray marching stops once the running maximum exceeds this angle.
    pub early_exit_angle_deg: f64,
    /// Quantum for horizon cache keys (degrees of latitude / longitude).
    pub position_quantum_deg: f64,
    /// Width of an azimuth sector in horizon cache keys.
    pub azimuth_sector_deg: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            zoom: 12,
            hi_dpi: false,
            tile_cache_capacity: 64,
            initial_step_m: 25.0,
            step_growth: 1.5,
            max_step_m: 400.0,
            max_distance_m: 12_000.0,
            early_exit_angle_deg: 60.0,
            position_quantum_deg: 1e-4,
            azimuth_sector_deg: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Buildings are dropped when the map is zoomed out below this level.
    pub min_building_zoom: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_building_zoom: 15.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub shadows: ShadowConfig,
    pub occlusion: OcclusionConfig,
    pub terrain: TerrainConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON document and validate the result.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let s = &self.shadows;
        positive("shadows.max_shadow_length_m", s.max_shadow_length_m)?;
        positive(
            "shadows.min_altitude_for_length_deg",
            s.min_altitude_for_length_deg,
        )?;
        if !(s.fade_in_start_deg <= s.fade_in_end_deg
            && s.fade_in_end_deg <= s.fade_out_start_deg
            && s.fade_out_start_deg <= s.fade_out_end_deg)
        {
            return Err(EngineError::InvalidConfig(
                "shadow opacity knots must be non-decreasing".into(),
            ));
        }
        fraction("shadows.max_opacity", s.max_opacity)?;
        if s.density_grid_cells == 0 {
            return Err(EngineError::InvalidConfig(
                "shadows.density_grid_cells must be at least 1".into(),
            ));
        }
        if s.viewport_padding < 0.0 {
            return Err(EngineError::InvalidConfig(
                "shadows.viewport_padding must not be negative".into(),
            ));
        }

        let o = &self.occlusion;
        positive("occlusion.edge_probe_offset_m", o.edge_probe_offset_m)?;
        positive("occlusion.consensus_radius_m", o.consensus_radius_m)?;
        fraction("occlusion.consensus_fraction", o.consensus_fraction)?;
        if o.edge_min_shadowed > 4 {
            return Err(EngineError::InvalidConfig(
                "occlusion.edge_min_shadowed cannot exceed 4".into(),
            ));
        }

        let t = &self.terrain;
        if t.tile_cache_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "terrain.tile_cache_capacity must be at least 1".into(),
            ));
        }
        if t.zoom > MAX_TERRAIN_ZOOM {
            return Err(EngineError::InvalidConfig(format!(
                "terrain.zoom must be at most {MAX_TERRAIN_ZOOM}, got {}",
                t.zoom
            )));
        }
        positive("terrain.initial_step_m", t.initial_step_m)?;
        positive("terrain.max_step_m", t.max_step_m)?;
        positive("terrain.max_distance_m", t.max_distance_m)?;
        positive("terrain.position_quantum_deg", t.position_quantum_deg)?;
        positive("terrain.azimuth_sector_deg", t.azimuth_sector_deg)?;
        if t.step_growth < 1.0 {
            return Err(EngineError::InvalidConfig(
                "terrain.step_growth must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Deepest zoom served by terrain tile sources.
pub const MAX_TERRAIN_ZOOM: u8 = 22;

fn positive(name: &str, value: f64) -> EngineResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

fn fraction(name: &str, value: f64) -> EngineResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(format!(
            "{name} must lie in (0, 1], got {value}"
        )))
    }
}
