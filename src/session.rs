//! Session state and the viewport/time coordinator.
//!
//! A `SunSession` owns everything that lives between redraws: the loaded
//! buildings and places, the shadow engine's last frame, the last sunlit
//! map, terrain caches and the fetch generation counter. Redraws are
//! single-flight through a `RedrawGate`; fetch results are applied only
//! while their ticket is still the newest one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::ephemeris::{sun_position, SunPosition};
use crate::error::EngineResult;
use crate::geometry::BoundingBox;
use crate::model::{Building, Place};
use crate::occlusion::OcclusionEvaluator;
use crate::shadows::{ShadowEngine, ShadowFrame};
use crate::terrain::{ElevationProvider, HorizonService, TerrainLookup};

/// Read-only camera snapshot for one redraw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub bounds: BoundingBox,
    pub zoom: f64,
}

impl Viewport {
    pub fn new(bounds: BoundingBox, zoom: f64) -> Self {
        Self { bounds, zoom }
    }
}

/// Generation stamp captured when a data fetch is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket(u64);

impl FetchTicket {
    pub fn generation(&self) -> u64 {
        self.0
    }

    /// Rebuild a ticket handed across the Python boundary as a plain integer.
    #[cfg(feature = "python")]
    pub(crate) fn from_generation(generation: u64) -> Self {
        Self(generation)
    }
}

// ── Redraw gate ─────────────────────────────────────────────────────────────

/// Single-flight flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct RedrawGate {
    busy: Arc<AtomicBool>,
}

impl RedrawGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another redraw holds the gate; the request is dropped,
    /// not queued.
    pub fn try_begin(&self) -> Option<RedrawPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RedrawPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Holds the gate until dropped.
#[derive(Debug)]
pub struct RedrawPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for RedrawPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Result of one redraw pass.
#[derive(Debug, Clone)]
pub struct RedrawOutput {
    /// Sun at the viewport centre.
    pub sun: SunPosition,
    pub shadows: Arc<ShadowFrame>,
    /// Place id → sunlit, for places inside the viewport.
    pub sunlit: Arc<HashMap<String, bool>>,
    pub occlusion_reused: bool,
}

struct OcclusionSnapshot {
    frame: Arc<ShadowFrame>,
    places_revision: u64,
    /// Sorted ids of the places that were inside the viewport.
    visible: Vec<String>,
    sun: SunPosition,
    sunlit: Arc<HashMap<String, bool>>,
}

type Horizons = HorizonService<Box<dyn ElevationProvider>>;

pub struct SunSession {
    config: EngineConfig,
    buildings: HashMap<String, Building>,
    /// Sorted by id; replaced (new identity) on every building change.
    building_set: Arc<[Building]>,
    places: HashMap<String, Place>,
    places_revision: u64,
    shadows: ShadowEngine,
    occlusion: OcclusionEvaluator,
    horizons: Option<Horizons>,
    loaded: Option<BoundingBox>,
    generation: u64,
    last_occlusion: Option<OcclusionSnapshot>,
    gate: RedrawGate,
    disposed: bool,
}

impl SunSession {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            shadows: ShadowEngine::new(config.shadows.clone()),
            occlusion: OcclusionEvaluator::new(config.occlusion.clone(), &config.shadows),
            config,
            buildings: HashMap::new(),
            building_set: Arc::from(Vec::new()),
            places: HashMap::new(),
            places_revision: 0,
            horizons: None,
            loaded: None,
            generation: 0,
            last_occlusion: None,
            gate: RedrawGate::new(),
            disposed: false,
        })
    }

    /// Enable terrain occlusion backed by `provider`.
    pub fn with_terrain<P: ElevationProvider + 'static>(mut self, provider: P) -> Self {
        let provider: Box<dyn ElevationProvider> = Box::new(provider);
        self.horizons = Some(HorizonService::new(provider, self.config.terrain.clone()));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buildings(&self) -> &Arc<[Building]> {
        &self.building_set
    }

    pub fn place(&self, id: &str) -> Option<&Place> {
        self.places.get(id)
    }

    pub fn place_count(&self) -> usize {
        self.places.len()
    }

    pub fn horizon_cache_len(&self) -> usize {
        self.horizons.as_ref().map_or(0, HorizonService::cached_len)
    }

    pub fn redraw_gate(&self) -> RedrawGate {
        self.gate.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ── Data fetches ────────────────────────────────────────────────────────

    /// Stamp a new fetch; every earlier ticket becomes stale.
    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.generation += 1;
        FetchTicket(self.generation)
    }

    pub fn is_current(&self, ticket: FetchTicket) -> bool {
        !self.disposed && ticket.0 == self.generation
    }

    /// Merge a completed fetch covering `bounds`. Returns `false` (and
    /// changes nothing) when the ticket has been superseded or the session
    /// is disposed.
    pub fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        bounds: BoundingBox,
        buildings: Vec<Building>,
        places: Vec<Place>,
    ) -> bool {
        if !self.is_current(ticket) {
            log::warn!(
                "dropping stale fetch result (generation {}, current {})",
                ticket.0,
                self.generation
            );
            return false;
        }
        log::debug!(
            "applying fetch {}: {} buildings, {} places",
            ticket.0,
            buildings.len(),
            places.len()
        );
        self.merge_buildings(buildings);
        self.merge_places(places);
        self.loaded = Some(match self.loaded {
            Some(loaded) => loaded.union(&bounds),
            None => bounds,
        });
        true
    }

    /// Insert or replace buildings by id.
    pub fn merge_buildings(&mut self, buildings: Vec<Building>) {
        if buildings.is_empty() {
            return;
        }
        for building in buildings {
            self.buildings.insert(building.id().to_string(), building);
        }
        self.rebuild_building_set();
    }

    /// Add places not seen before; known ids keep their first record.
    pub fn merge_places(&mut self, places: Vec<Place>) {
        let before = self.places.len();
        for place in places {
            self.places.entry(place.id.clone()).or_insert(place);
        }
        if self.places.len() != before {
            self.places_revision += 1;
        }
    }

    pub fn clear_buildings(&mut self) {
        if self.buildings.is_empty() {
            return;
        }
        self.buildings.clear();
        self.rebuild_building_set();
    }

    pub fn clear_places(&mut self) {
        if !self.places.is_empty() {
            self.places.clear();
            self.places_revision += 1;
        }
    }

    /// Drop buildings once zoomed out past the visibility threshold.
    /// Returns whether anything was cleared.
    pub fn apply_zoom(&mut self, zoom: f64) -> bool {
        if zoom >= self.config.session.min_building_zoom || self.buildings.is_empty() {
            return false;
        }
        log::debug!(
            "zoom {zoom:.1} below {:.1}, clearing {} buildings",
            self.config.session.min_building_zoom,
            self.buildings.len()
        );
        self.clear_buildings();
        self.loaded = None;
        true
    }

    /// Whether the viewport reaches outside every region fetched so far.
    pub fn needs_fetch(&self, viewport: &Viewport) -> bool {
        if self.disposed {
            return false;
        }
        self.loaded
            .map_or(true, |loaded| !loaded.contains_box(&viewport.bounds))
    }

    fn rebuild_building_set(&mut self) {
        let mut set: Vec<Building> = self.buildings.values().cloned().collect();
        set.sort_by(|a, b| a.id().cmp(b.id()));
        self.building_set = set.into();
    }

    // ── Redraw ──────────────────────────────────────────────────────────────

    /// Shadows and sunlit states for `viewport` at `instant`.
    ///
    /// Returns `None` when the session is disposed or another redraw holds
    /// the gate.
    pub fn redraw(&mut self, viewport: &Viewport, instant: &DateTime<Utc>) -> Option<RedrawOutput> {
        if self.disposed {
            return None;
        }
        let Some(_permit) = self.gate.try_begin() else {
            log::debug!("redraw already in progress, request dropped");
            return None;
        };

        let center = viewport.bounds.center();
        let sun = sun_position(instant, center.lat, center.lng);
        let frame = self
            .shadows
            .compute_shadows(&self.building_set, sun, &viewport.bounds, viewport.zoom);

        let mut visible: Vec<&Place> = self
            .places
            .values()
            .filter(|p| viewport.bounds.contains(&p.position))
            .collect();
        visible.sort_by(|a, b| a.id.cmp(&b.id));
        let visible_ids: Vec<String> = visible.iter().map(|p| p.id.clone()).collect();

        if let Some(sunlit) = self.reusable_occlusion(&frame, &sun, &visible_ids) {
            return Some(RedrawOutput {
                sun,
                shadows: frame,
                sunlit,
                occlusion_reused: true,
            });
        }

        let terrain = self
            .horizons
            .as_mut()
            .map(|h| h as &mut dyn TerrainLookup);
        let sunlit = Arc::new(self.occlusion.evaluate_places(
            &visible,
            &self.building_set,
            instant,
            Some(&frame.polygons),
            terrain,
        ));

        self.last_occlusion = Some(OcclusionSnapshot {
            frame: Arc::clone(&frame),
            places_revision: self.places_revision,
            visible: visible_ids,
            sun,
            sunlit: Arc::clone(&sunlit),
        });
        Some(RedrawOutput {
            sun,
            shadows: frame,
            sunlit,
            occlusion_reused: false,
        })
    }

    fn reusable_occlusion(
        &self,
        frame: &Arc<ShadowFrame>,
        sun: &SunPosition,
        visible: &[String],
    ) -> Option<Arc<HashMap<String, bool>>> {
        let last = self.last_occlusion.as_ref()?;
        let c = &self.config.shadows;
        let same = Arc::ptr_eq(&last.frame, frame)
            && last.places_revision == self.places_revision
            && last.visible == visible
            && last.sun.is_close_to(sun, c.sun_altitude_tolerance_rad, c.sun_azimuth_tolerance_rad);
        same.then(|| Arc::clone(&last.sunlit))
    }

    /// Release all session state. Later fetches and redraws are ignored.
    pub fn dispose(&mut self) {
        self.buildings.clear();
        self.building_set = Arc::from(Vec::new());
        self.places.clear();
        self.places_revision += 1;
        self.shadows.invalidate();
        self.last_occlusion = None;
        if let Some(horizons) = self.horizons.as_mut() {
            horizons.clear();
        }
        self.loaded = None;
        self.generation += 1;
        self.disposed = true;
        log::info!("sun session disposed");
    }
}
