//! Buildings and places as handed over by the map data layer.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::geometry::{close_ring, open_vertices, ring_centroid, BoundingBox, Position};

pub const DEFAULT_BUILDING_HEIGHT_M: f64 = 10.0;
pub const METERS_PER_LEVEL: f64 = 3.0;

/// Building height from tagged height, else level count, else the default.
pub fn estimate_height(height_m: Option<f64>, levels: Option<f64>) -> f64 {
    let usable = |v: &f64| v.is_finite() && *v > 0.0;
    height_m
        .filter(usable)
        .or_else(|| levels.filter(usable).map(|l| l * METERS_PER_LEVEL))
        .unwrap_or(DEFAULT_BUILDING_HEIGHT_M)
}

/// Immutable building footprint. Equality and hashing use the id only.
#[derive(Debug, Clone)]
pub struct Building {
    id: String,
    footprint: Vec<Position>,
    height_m: f64,
    bbox: BoundingBox,
    center: Position,
    half_diagonal_m: f64,
}

impl Building {
    /// The ring is closed if it is open. Degenerate rings are accepted and
    /// simply never cast a shadow.
    pub fn new(id: impl Into<String>, footprint: &[Position], height_m: f64) -> Self {
        let footprint = close_ring(footprint);
        let bbox = BoundingBox::from_points(&footprint);
        let center = ring_centroid(&footprint).unwrap_or_else(|| bbox.center());
        let half_diagonal_m = if bbox.is_empty() {
            0.0
        } else {
            0.5 * Position::new(bbox.min_lng, bbox.min_lat)
                .distance_meters(&Position::new(bbox.max_lng, bbox.max_lat))
        };
        Self {
            id: id.into(),
            footprint,
            height_m,
            bbox,
            center,
            half_diagonal_m,
        }
    }

    pub fn from_record(record: &BuildingRecord) -> Self {
        let ring: Vec<Position> = record
            .footprint
            .iter()
            .map(|[lng, lat]| Position::new(*lng, *lat))
            .collect();
        Self::new(
            record.id.clone(),
            &ring,
            estimate_height(record.height, record.levels),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Closed ring (first == last).
    pub fn footprint(&self) -> &[Position] {
        &self.footprint
    }

    pub fn height(&self) -> f64 {
        self.height_m
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn center(&self) -> Position {
        self.center
    }

    /// Half the bounding-box diagonal in metres.
    pub fn half_diagonal_m(&self) -> f64 {
        self.half_diagonal_m
    }

    pub fn is_degenerate(&self) -> bool {
        open_vertices(&self.footprint).len() < 3
    }
}

impl PartialEq for Building {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Building {}

impl Hash for Building {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Category of a point of interest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceKind {
    Eatery,
    Pub,
    Park,
    Other(String),
}

impl fmt::Display for PlaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceKind::Eatery => f.write_str("eatery"),
            PlaceKind::Pub => f.write_str("pub"),
            PlaceKind::Park => f.write_str("park"),
            PlaceKind::Other(tag) => f.write_str(tag),
        }
    }
}

impl From<&str> for PlaceKind {
    fn from(tag: &str) -> Self {
        match tag {
            "eatery" | "restaurant" | "cafe" => PlaceKind::Eatery,
            "pub" | "bar" | "biergarten" => PlaceKind::Pub,
            "park" => PlaceKind::Park,
            other => PlaceKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutdoorSeating {
    /// `None` when the data source does not say.
    pub available: Option<bool>,
    pub seats: Option<u32>,
    pub covered: Option<bool>,
}

/// Point of interest. Equality uses the id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub position: Position,
    pub kind: PlaceKind,
    #[serde(default)]
    pub seating: Option<OutdoorSeating>,
}

impl Place {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        position: Position,
        kind: PlaceKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position,
            kind,
            seating: None,
        }
    }

    pub fn with_seating(mut self, seating: OutdoorSeating) -> Self {
        self.seating = Some(seating);
        self
    }
}

impl PartialEq for Place {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Place {}

impl Hash for Place {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Building as delivered by the upstream data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub id: String,
    /// `[lng, lat]` pairs, open or closed.
    pub footprint: Vec<[f64; 2]>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub levels: Option<f64>,
}

/// Buildings from a JSON array of `BuildingRecord`s.
pub fn parse_buildings(json: &str) -> EngineResult<Vec<Building>> {
    let records: Vec<BuildingRecord> = serde_json::from_str(json)?;
    Ok(records.iter().map(Building::from_record).collect())
}

/// Places from a JSON array.
pub fn parse_places(json: &str) -> EngineResult<Vec<Place>> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_estimate_height() {
        assert_eq!(estimate_height(Some(24.0), Some(2.0)), 24.0);
        assert_eq!(estimate_height(None, Some(4.0)), 12.0);
        assert_eq!(estimate_height(Some(-1.0), None), DEFAULT_BUILDING_HEIGHT_M);
        assert_eq!(estimate_height(Some(f64::NAN), Some(0.0)), DEFAULT_BUILDING_HEIGHT_M);
    }

    #[test]
    fn test_building_closes_ring_and_caches_bbox() {
        let ring = [
            Position::new(0.0, 0.0),
            Position::new(0.001, 0.0),
            Position::new(0.001, 0.001),
        ];
        let b = Building::new("way/1", &ring, 12.0);
        assert_eq!(b.footprint().len(), 4);
        assert_eq!(b.footprint().first(), b.footprint().last());
        assert_eq!(*b.bbox(), BoundingBox::new(0.0, 0.0, 0.001, 0.001));
        assert!(!b.is_degenerate());
        assert!(b.half_diagonal_m() > 70.0 && b.half_diagonal_m() < 90.0);
    }

    #[test]
    fn test_identity_by_id() {
        let a = Building::new("way/7", &[Position::new(0.0, 0.0)], 5.0);
        let b = Building::new("way/7", &[Position::new(1.0, 1.0)], 50.0);
        assert_eq!(a, b);
        let set: HashSet<Building> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        let p = Place::new("node/1", "Cafe", Position::new(0.0, 0.0), PlaceKind::Eatery);
        let q = Place::new("node/1", "Renamed", Position::new(1.0, 0.0), PlaceKind::Pub);
        assert_eq!(p, q);
    }

    #[test]
    fn test_record_deserialisation() {
        let record: BuildingRecord = serde_json::from_str(
            r#"{"id": "way/42", "footprint": [[0.0, 0.0], [0.0001, 0.0], [0.0001, 0.0001]], "levels": 5}"#,
        )
        .unwrap();
        let b = Building::from_record(&record);
        assert_eq!(b.id(), "way/42");
        assert_eq!(b.height(), 15.0);

        let place: Place = serde_json::from_str(
            r#"{"id": "node/9", "name": "Garden", "position": {"lng": 1.0, "lat": 2.0}, "kind": "park"}"#,
        )
        .unwrap();
        assert_eq!(place.kind, PlaceKind::Park);
        assert!(place.seating.is_none());
    }

    #[test]
    fn test_parse_batches() {
        let buildings = parse_buildings(
            r#"[{"id": "a", "footprint": [[0, 0], [0.0001, 0], [0.0001, 0.0001]], "height": 7.5},
                {"id": "b", "footprint": [[1, 1], [1.0001, 1], [1.0001, 1.0001]]}]"#,
        )
        .unwrap();
        assert_eq!(buildings.len(), 2);
        assert_eq!(buildings[0].height(), 7.5);
        assert_eq!(buildings[1].height(), DEFAULT_BUILDING_HEIGHT_M);
        assert!(parse_places("[]").unwrap().is_empty());
        assert!(parse_places("{").is_err());
    }

    #[test]
    fn test_place_kind_from_tag() {
        assert_eq!(PlaceKind::from("biergarten"), PlaceKind::Pub);
        assert_eq!(PlaceKind::from("kiosk"), PlaceKind::Other("kiosk".into()));
        assert_eq!(PlaceKind::Other("kiosk".into()).to_string(), "kiosk");
    }
}
