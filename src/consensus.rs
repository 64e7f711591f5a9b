//! Local consensus smoothing of per-place sunlit states.
//!
//! Tightly clustered places of the same kind that disagree with most of their
//! neighbours are forced to the majority state. This is a display heuristic to
//! stop icons in a cluster from flickering; it is not a physical correction.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::config::OcclusionConfig;
use crate::geometry::{meters_to_lat_degrees, meters_to_lng_degrees, Position};
use crate::model::Place;

/// Uniform grid over positions with cells at least `radius_m` wide, so all
/// neighbours within the radius sit in the 3 × 3 block around a cell.
pub struct PlaceGrid {
    cell_lat_deg: f64,
    cell_lng_deg: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl PlaceGrid {
    pub fn build(positions: &[Position], radius_m: f64) -> Self {
        let max_abs_lat = positions
            .iter()
            .map(|p| p.lat.abs())
            .fold(0.0_f64, f64::max);
        let cell_lat_deg = meters_to_lat_degrees(radius_m).max(f64::MIN_POSITIVE);
        let cell_lng_deg = match meters_to_lng_degrees(radius_m, max_abs_lat) {
            d if d > 0.0 => d,
            _ => 360.0,
        };

        let mut grid = Self {
            cell_lat_deg,
            cell_lng_deg,
            cells: HashMap::new(),
        };
        for (i, p) in positions.iter().enumerate() {
            let cell = grid.cell(p);
            grid.cells.entry(cell).or_default().push(i);
        }
        grid
    }

    fn cell(&self, p: &Position) -> (i64, i64) {
        (
            (p.lat / self.cell_lat_deg).floor() as i64,
            (p.lng / self.cell_lng_deg).floor() as i64,
        )
    }

    /// Indices within `radius_m` of `positions[index]`, excluding itself.
    pub fn neighbors(&self, positions: &[Position], index: usize, radius_m: f64) -> Vec<usize> {
        let origin = &positions[index];
        let (row, col) = self.cell(origin);
        let mut found = Vec::new();
        for dr in -1..=1 {
            for dc in -1..=1 {
                let Some(members) = self.cells.get(&(row + dr, col + dc)) else {
                    continue;
                };
                found.extend(members.iter().copied().filter(|&j| {
                    j != index && origin.distance_meters(&positions[j]) <= radius_m
                }));
            }
        }
        found
    }
}

/// Apply neighbour consensus to `states` (parallel to `places`).
///
/// Every decision reads the unsmoothed input, so the result does not depend
/// on iteration order.
pub fn smooth_states(places: &[&Place], states: &[bool], config: &OcclusionConfig) -> Vec<bool> {
    debug_assert_eq!(places.len(), states.len());
    if !config.consensus || places.len() < 2 {
        return states.to_vec();
    }
    let positions: Vec<Position> = places.iter().map(|p| p.position).collect();
    let grid = PlaceGrid::build(&positions, config.consensus_radius_m);
    let min_neighbors = config.consensus_min_neighbors.max(1);

    (0..places.len())
        .into_par_iter()
        .map(|i| {
            let neighbors: Vec<usize> = grid
                .neighbors(&positions, i, config.consensus_radius_m)
                .into_iter()
                .filter(|&j| places[j].kind == places[i].kind)
                .collect();
            if neighbors.len() < min_neighbors {
                return states[i];
            }
            let sunlit = neighbors.iter().filter(|&&j| states[j]).count();
            let total = neighbors.len() as f64;
            if sunlit as f64 / total >= config.consensus_fraction {
                true
            } else if (neighbors.len() - sunlit) as f64 / total >= config.consensus_fraction {
                false
            } else {
                states[i]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlaceKind;

    fn place(id: &str, east_m: f64, north_m: f64, kind: PlaceKind) -> Place {
        let p = Position::new(-0.1276, 51.5072).offset_meters(east_m, north_m);
        Place::new(id, id, p, kind)
    }

    #[test]
    fn test_grid_neighbors() {
        let positions: Vec<Position> = [(0.0, 0.0), (6.0, 0.0), (0.0, 9.0), (30.0, 0.0)]
            .iter()
            .map(|&(e, n)| Position::new(2.0, 41.0).offset_meters(e, n))
            .collect();
        let grid = PlaceGrid::build(&positions, 10.0);
        let mut n = grid.neighbors(&positions, 0, 10.0);
        n.sort_unstable();
        assert_eq!(n, vec![1, 2]);
        assert!(grid.neighbors(&positions, 3, 10.0).is_empty());
    }

    #[test]
    fn test_outlier_flips_to_majority() {
        let places = [
            place("a", 0.0, 0.0, PlaceKind::Eatery),
            place("b", 3.0, 0.0, PlaceKind::Eatery),
            place("c", 0.0, 3.0, PlaceKind::Eatery),
            place("d", 3.0, 3.0, PlaceKind::Eatery),
        ];
        let refs: Vec<&Place> = places.iter().collect();
        let states = [false, false, false, true];
        let smoothed = smooth_states(&refs, &states, &OcclusionConfig::default());
        assert_eq!(smoothed, vec![false; 4]);
    }

    #[test]
    fn test_other_kinds_do_not_vote() {
        let places = [
            place("a", 0.0, 0.0, PlaceKind::Pub),
            place("b", 3.0, 0.0, PlaceKind::Pub),
            place("c", 0.0, 3.0, PlaceKind::Pub),
            place("park", 3.0, 3.0, PlaceKind::Park),
        ];
        let refs: Vec<&Place> = places.iter().collect();
        let states = [false, false, false, true];
        let smoothed = smooth_states(&refs, &states, &OcclusionConfig::default());
        assert_eq!(smoothed, vec![false, false, false, true]);
    }

    #[test]
    fn test_split_vote_and_sparse_neighbours_keep_state() {
        let places = [
            place("a", 0.0, 0.0, PlaceKind::Eatery),
            place("b", 3.0, 0.0, PlaceKind::Eatery),
            place("c", 0.0, 3.0, PlaceKind::Eatery),
            place("far", 200.0, 0.0, PlaceKind::Eatery),
        ];
        let refs: Vec<&Place> = places.iter().collect();
        // a sees one sunlit and one shadowed neighbour: 50% is not a majority
        let states = [true, true, false, false];
        let smoothed = smooth_states(&refs, &states, &OcclusionConfig::default());
        assert!(smoothed[0]);
        assert!(!smoothed[3]);
    }

    #[test]
    fn test_disabled_consensus_is_identity() {
        let places = [
            place("a", 0.0, 0.0, PlaceKind::Eatery),
            place("b", 1.0, 0.0, PlaceKind::Eatery),
            place("c", 2.0, 0.0, PlaceKind::Eatery),
        ];
        let refs: Vec<&Place> = places.iter().collect();
        let cfg = OcclusionConfig {
            consensus: false,
            ..OcclusionConfig::default()
        };
        assert_eq!(smooth_states(&refs, &[true, false, false], &cfg), vec![true, false, false]);
    }
}
