//! Sunlit / shadowed classification of places.
//!
//! Checks run cheapest-conclusive first: night, distant terrain, then nearby
//! buildings (shadow polygon containment, or an angular test when no polygon
//! is available), an edge correction for places right at a shadow boundary,
//! and finally neighbour consensus across the whole set.

use std::collections::HashMap;
use std::f64::consts::TAU;

use chrono::{DateTime, Utc};

use crate::config::{OcclusionConfig, ShadowConfig};
use crate::consensus::smooth_states;
use crate::ephemeris::{sun_position, SunPosition};
use crate::geometry::{is_point_in_polygon, open_vertices, shadow_length, BoundingBox, Position, ShadowLimits};
use crate::model::{Building, Place};
use crate::shadows::ShadowMap;
use crate::terrain::{Horizon, TerrainLookup};

/// Slack (metres) added around blocker candidate boxes.
const CANDIDATE_SLACK_M: f64 = 1.0;

/// How many horizon cache misses may still be serviced in this redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonBudget {
    enabled: bool,
    remaining: usize,
}

impl HorizonBudget {
    /// Budget for a redraw over `visible_places` places. Terrain is skipped
    /// outright when too many places are visible.
    pub fn for_redraw(visible_places: usize, config: &OcclusionConfig) -> Self {
        Self {
            enabled: visible_places <= config.max_places_for_terrain,
            remaining: config.max_new_horizon_queries,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            enabled: true,
            remaining: usize::MAX,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Terrain access for one redraw pass.
pub struct TerrainGate<'a> {
    pub lookup: &'a mut dyn TerrainLookup,
    pub budget: HorizonBudget,
}

pub struct OcclusionEvaluator {
    config: OcclusionConfig,
    limits: ShadowLimits,
    night_threshold_deg: f64,
}

impl OcclusionEvaluator {
    pub fn new(config: OcclusionConfig, shadows: &ShadowConfig) -> Self {
        Self {
            config,
            limits: ShadowLimits {
                min_altitude_deg: shadows.min_altitude_for_length_deg,
                max_length_m: shadows.max_shadow_length_m,
                min_drawable_m: 0.0,
            },
            night_threshold_deg: shadows.night_threshold_deg,
        }
    }

    pub fn config(&self) -> &OcclusionConfig {
        &self.config
    }

    /// First building whose footprint contains `point`.
    pub fn host_building<'b>(&self, point: &Position, buildings: &'b [Building]) -> Option<&'b Building> {
        buildings
            .iter()
            .filter(|b| b.bbox().contains(point))
            .find(|b| is_point_in_polygon(point, b.footprint()))
    }

    /// Whether `place` receives direct sun.
    ///
    /// `sun` must be the sun position at the place itself. `shadows` is the
    /// shadow engine's polygon map; buildings missing from it, or with an
    /// empty ring, fall back to the angular test.
    pub fn is_sunlit(
        &self,
        place: &Place,
        buildings: &[Building],
        sun: &SunPosition,
        shadows: Option<&ShadowMap>,
        terrain: Option<&mut TerrainGate<'_>>,
    ) -> bool {
        if sun.is_below(self.night_threshold_deg) {
            return false;
        }
        if let Some(gate) = terrain {
            if self.terrain_blocks(&place.position, sun, gate) {
                return false;
            }
        }

        let host = self.host_building(&place.position, buildings);
        let radius = if host.is_some() {
            self.config.host_probe_radius_m
        } else {
            self.config.probe_radius_m
        };
        if self.is_shadowed_at(&place.position, radius, host, buildings, sun, shadows) {
            return false;
        }

        if self.config.edge_correction {
            let d = self.config.edge_probe_offset_m;
            let shadowed = [(0.0, d), (d, 0.0), (0.0, -d), (-d, 0.0)]
                .iter()
                .map(|&(east, north)| place.position.offset_meters(east, north))
                .filter(|p| {
                    self.is_shadowed_at(p, self.config.tight_probe_radius_m, host, buildings, sun, shadows)
                })
                .count();
            if shadowed >= self.config.edge_min_shadowed {
                return false;
            }
        }
        true
    }

    /// Classify every place at `instant`, then apply neighbour consensus.
    pub fn evaluate_places(
        &self,
        places: &[&Place],
        buildings: &[Building],
        instant: &DateTime<Utc>,
        shadows: Option<&ShadowMap>,
        terrain: Option<&mut dyn TerrainLookup>,
    ) -> HashMap<String, bool> {
        let budget = HorizonBudget::for_redraw(places.len(), &self.config);
        let mut gate = terrain.map(|lookup| TerrainGate { lookup, budget });

        let states: Vec<bool> = places
            .iter()
            .map(|place| {
                let sun = sun_position(instant, place.position.lat, place.position.lng);
                self.is_sunlit(place, buildings, &sun, shadows, gate.as_mut())
            })
            .collect();
        let smoothed = smooth_states(places, &states, &self.config);

        let flipped = states.iter().zip(&smoothed).filter(|(a, b)| a != b).count();
        log::debug!(
            "occlusion: {} places, {} sunlit, {} flipped by consensus",
            places.len(),
            smoothed.iter().filter(|s| **s).count(),
            flipped
        );

        places
            .iter()
            .zip(smoothed)
            .map(|(place, state)| (place.id.clone(), state))
            .collect()
    }

    fn terrain_blocks(&self, point: &Position, sun: &SunPosition, gate: &mut TerrainGate<'_>) -> bool {
        if !gate.budget.is_enabled() {
            return false;
        }
        let (lat, lng) = (point.lat, point.lng);
        let horizon = match gate.lookup.cached_horizon(lat, lng, sun.azimuth) {
            Some(hit) => hit,
            None if gate.budget.try_consume() => gate.lookup.horizon_angle(lat, lng, sun.azimuth),
            None => return false,
        };
        match horizon {
            Horizon::Angle(angle) => sun.altitude < angle + self.config.terrain_margin_deg.to_radians(),
            Horizon::Unknown => false,
        }
    }

    /// Shadow test at a point against every building except `host`.
    fn is_shadowed_at(
        &self,
        point: &Position,
        probe_radius_m: f64,
        host: Option<&Building>,
        buildings: &[Building],
        sun: &SunPosition,
        shadows: Option<&ShadowMap>,
    ) -> bool {
        let probes = probe_ring(point, probe_radius_m, self.config.probe_count);
        buildings
            .iter()
            .filter(|b| host.map_or(true, |h| h.id() != b.id()))
            .filter(|b| self.may_shade(b, point, sun, probe_radius_m))
            .any(|b| self.building_shades(b, point, &probes, sun, shadows))
    }

    /// Cheap box test: can this building's shadow reach `point` at all?
    fn may_shade(&self, building: &Building, point: &Position, sun: &SunPosition, probe_radius_m: f64) -> bool {
        let reach = shadow_length(building.height(), sun, &self.limits);
        if reach <= 0.0 {
            return false;
        }
        let region: BoundingBox = building
            .bbox()
            .expanded_by_meters(reach + probe_radius_m + CANDIDATE_SLACK_M);
        region.contains(point)
    }

    fn building_shades(
        &self,
        building: &Building,
        point: &Position,
        probes: &[Position],
        sun: &SunPosition,
        shadows: Option<&ShadowMap>,
    ) -> bool {
        let ring = shadows
            .and_then(|map| map.get(building.id()))
            .filter(|ring| open_vertices(ring).len() >= 3);
        match ring {
            Some(ring) => {
                if is_point_in_polygon(point, ring) {
                    return true;
                }
                let inside = probes.iter().filter(|p| is_point_in_polygon(p, ring)).count();
                !probes.is_empty() && inside * 2 > probes.len()
            }
            None => self.angular_blocks(building, point, sun),
        }
    }

    /// Does the building, seen from `point`, stand taller than the sun?
    ///
    /// The building must lie sunward of the point, within its half diagonal
    /// (plus an allowance) of the line towards the sun.
    fn angular_blocks(&self, building: &Building, point: &Position, sun: &SunPosition) -> bool {
        if !(building.height() > 0.0) {
            return false;
        }
        let (east, north) = point.delta_meters(&building.center());
        let (sin_az, cos_az) = sun.azimuth.sin_cos();
        let along = east * sin_az + north * cos_az;
        if along <= 0.0 {
            return false;
        }
        let lateral = (east * cos_az - north * sin_az).abs();
        if lateral > building.half_diagonal_m() + self.config.lateral_allowance_m {
            return false;
        }
        (building.height() / along).atan() > sun.altitude
    }
}

/// `count` points evenly spaced on a circle of `radius_m` around `center`.
fn probe_ring(center: &Position, radius_m: f64, count: usize) -> Vec<Position> {
    if count == 0 || radius_m <= 0.0 {
        return Vec::new();
    }
    (0..count)
        .map(|k| {
            let theta = TAU * k as f64 / count as f64;
            center.offset_meters(radius_m * theta.sin(), radius_m * theta.cos())
        })
        .collect()
}
