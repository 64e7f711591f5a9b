//! Terrain horizon service.
//!
//! Elevation comes from RGB-encoded terrain tiles (`-10000 + (R·65536 + G·256 + B)·0.1`)
//! held in an insertion-ordered tile cache. Horizon angles are found by ray
//! marching outward along a bearing with geometrically growing steps and are
//! memoised per quantised (lat, lng, azimuth sector).

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView3};
use ndarray_stats::QuantileExt;

use crate::config::TerrainConfig;
use crate::error::{EngineError, EngineResult};
use crate::geometry::Position;

/// Web Mercator latitude limit.
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

// ── Tiles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub hi_dpi: bool,
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)?;
        if self.hi_dpi {
            f.write_str("@2x")?;
        }
        Ok(())
    }
}

impl TileKey {
    /// Tile containing a point, plus the point's fractional offset within
    /// the tile (`0..1` on both axes, y growing southward).
    pub fn containing(lat: f64, lng: f64, zoom: u8, hi_dpi: bool) -> (TileKey, f64, f64) {
        let n = f64::from(1u32 << zoom.min(31));
        let lat_rad = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let x = (lng + 180.0) / 360.0 * n;
        let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;

        let xi = x.floor().clamp(0.0, n - 1.0);
        let yi = y.floor().clamp(0.0, n - 1.0);
        let key = TileKey {
            zoom,
            x: xi as u32,
            y: yi as u32,
            hi_dpi,
        };
        (key, (x - xi).clamp(0.0, 1.0), (y - yi).clamp(0.0, 1.0))
    }
}

/// Decode one terrain-RGB pixel to metres.
pub fn decode_terrain_rgb(r: u8, g: u8, b: u8) -> f32 {
    let raw = f64::from(r) * 65_536.0 + f64::from(g) * 256.0 + f64::from(b);
    (-10_000.0 + raw * 0.1) as f32
}

/// Decoded elevation raster (rows run north to south).
#[derive(Debug, Clone)]
pub struct ElevationTile {
    elevations: Array2<f32>,
}

impl ElevationTile {
    pub fn new(elevations: Array2<f32>) -> Self {
        Self { elevations }
    }

    /// Decode an `rows × cols × channels` RGB(A) raster.
    pub fn from_rgb(key: TileKey, rgb: ArrayView3<u8>) -> EngineResult<Self> {
        let (rows, cols, channels) = rgb.dim();
        if rows == 0 || cols == 0 || channels < 3 {
            return Err(EngineError::MalformedTile {
                key,
                reason: format!("expected rows × cols × 3 pixels, got {rows} × {cols} × {channels}"),
            });
        }
        let elevations = Array2::from_shape_fn((rows, cols), |(r, c)| {
            decode_terrain_rgb(rgb[[r, c, 0]], rgb[[r, c, 1]], rgb[[r, c, 2]])
        });
        Ok(Self { elevations })
    }

    pub fn elevations(&self) -> &Array2<f32> {
        &self.elevations
    }

    /// Lowest and highest non-NaN elevation.
    pub fn elevation_range(&self) -> (f32, f32) {
        (
            *self.elevations.min_skipnan(),
            *self.elevations.max_skipnan(),
        )
    }

    /// Bilinear sample at a fractional tile offset. Pixel centres sit at
    /// half-pixel positions; samples clamp at the tile edge.
    pub fn sample(&self, fx: f64, fy: f64) -> f64 {
        let (rows, cols) = self.elevations.dim();
        let px = (fx * cols as f64 - 0.5).clamp(0.0, (cols - 1) as f64);
        let py = (fy * rows as f64 - 0.5).clamp(0.0, (rows - 1) as f64);
        let (x0, y0) = (px.floor() as usize, py.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(cols - 1), (y0 + 1).min(rows - 1));
        let (tx, ty) = (px - x0 as f64, py - y0 as f64);

        let e = |r: usize, c: usize| f64::from(self.elevations[[r, c]]);
        let top = e(y0, x0) * (1.0 - tx) + e(y0, x1) * tx;
        let bottom = e(y1, x0) * (1.0 - tx) + e(y1, x1) * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

/// Raw terrain tile supplier (network, disk, or test fixture).
pub trait TileSource: Send {
    /// RGB(A) pixels as `rows × cols × channels`.
    fn fetch_tile(&mut self, key: TileKey) -> EngineResult<Array3<u8>>;
}

#[derive(Debug, Clone)]
pub enum CachedTile {
    Ready(Arc<ElevationTile>),
    /// Fetch or decode failed; remembered so the tile is not requested again.
    Unavailable,
}

/// Fixed-capacity tile cache evicting the oldest *inserted* key.
///
/// Hits do not refresh an entry's position, so this is insertion-order
/// eviction rather than true LRU.
#[derive(Debug)]
pub struct TileCache {
    capacity: usize,
    entries: HashMap<TileKey, CachedTile>,
    order: VecDeque<TileKey>,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &TileKey) -> Option<&CachedTile> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: TileKey, tile: CachedTile) {
        if self.entries.insert(key, tile).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                log::debug!("evicted terrain tile {oldest}");
            }
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

// ── Elevation sampling ──────────────────────────────────────────────────────

/// Point elevation lookup. `None` means no data; callers must not treat it
/// as blocking.
pub trait ElevationProvider: Send {
    fn sample_elevation(&mut self, lat: f64, lng: f64) -> Option<f64>;

    /// Drop any cached raster data.
    fn clear(&mut self) {}
}

impl<P: ElevationProvider + ?Sized> ElevationProvider for Box<P> {
    fn sample_elevation(&mut self, lat: f64, lng: f64) -> Option<f64> {
        (**self).sample_elevation(lat, lng)
    }

    fn clear(&mut self) {
        (**self).clear();
    }
}

/// Elevation sampled from terrain tiles at a fixed zoom.
pub struct TileElevationProvider<S: TileSource> {
    source: S,
    cache: TileCache,
    zoom: u8,
    hi_dpi: bool,
}

impl<S: TileSource> TileElevationProvider<S> {
    pub fn new(source: S, config: &TerrainConfig) -> Self {
        Self {
            source,
            cache: TileCache::new(config.tile_cache_capacity),
            zoom: config.zoom,
            hi_dpi: config.hi_dpi,
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    fn tile(&mut self, key: TileKey) -> CachedTile {
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let entry = match self
            .source
            .fetch_tile(key)
            .and_then(|rgb| ElevationTile::from_rgb(key, rgb.view()))
        {
            Ok(tile) => {
                let (lo, hi) = tile.elevation_range();
                log::debug!("decoded terrain tile {key}: {lo:.1}..{hi:.1} m");
                CachedTile::Ready(Arc::new(tile))
            }
            Err(err) => {
                log::debug!("terrain tile unavailable: {err}");
                CachedTile::Unavailable
            }
        };
        self.cache.insert(key, entry.clone());
        entry
    }
}

impl<S: TileSource> ElevationProvider for TileElevationProvider<S> {
    fn sample_elevation(&mut self, lat: f64, lng: f64) -> Option<f64> {
        let (key, fx, fy) = TileKey::containing(lat, lng, self.zoom, self.hi_dpi);
        match self.tile(key) {
            CachedTile::Ready(tile) => {
                let elevation = tile.sample(fx, fy);
                elevation.is_finite().then_some(elevation)
            }
            CachedTile::Unavailable => None,
        }
    }

    fn clear(&mut self) {
        self.cache.clear();
    }
}

// ── Horizon ─────────────────────────────────────────────────────────────────

/// Outcome of a horizon query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Horizon {
    /// Maximum terrain elevation angle along the bearing, radians.
    Angle(f64),
    /// No elevation data at the origin or along the ray.
    Unknown,
}

/// Narrow terrain interface consumed by the occlusion pass.
pub trait TerrainLookup {
    /// Memoised result, without touching the elevation source.
    fn cached_horizon(&self, lat: f64, lng: f64, azimuth: f64) -> Option<Horizon>;

    /// Compute (and memoise) the horizon along `azimuth` (radians, N, CW).
    fn horizon_angle(&mut self, lat: f64, lng: f64, azimuth: f64) -> Horizon;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HorizonKey {
    lat: i64,
    lng: i64,
    sector: u32,
}

pub struct HorizonService<P: ElevationProvider> {
    provider: P,
    config: TerrainConfig,
    cache: HashMap<HorizonKey, Horizon>,
}

impl<P: ElevationProvider> HorizonService<P> {
    pub fn new(provider: P, config: TerrainConfig) -> Self {
        Self {
            provider,
            config,
            cache: HashMap::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop memoised horizons and cached tiles.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.provider.clear();
    }

    fn key(&self, lat: f64, lng: f64, azimuth: f64) -> HorizonKey {
        let q = self.config.position_quantum_deg;
        let sectors = (360.0 / self.config.azimuth_sector_deg).ceil().max(1.0) as u32;
        let sector = (azimuth.to_degrees().rem_euclid(360.0) / self.config.azimuth_sector_deg)
            .floor() as u32
            % sectors;
        HorizonKey {
            lat: (lat / q).round() as i64,
            lng: (lng / q).round() as i64,
            sector,
        }
    }

    /// March outward along the bearing tracking the steepest elevation angle.
    fn march(&mut self, lat: f64, lng: f64, azimuth: f64) -> Horizon {
        let Some(origin_elevation) = self.provider.sample_elevation(lat, lng) else {
            return Horizon::Unknown;
        };
        let origin = Position::new(lng, lat);
        let (sin_az, cos_az) = azimuth.sin_cos();
        let early_exit = self.config.early_exit_angle_deg.to_radians();

        let mut best: Option<f64> = None;
        let mut step = self.config.initial_step_m;
        let mut distance = step;
        while distance <= self.config.max_distance_m {
            let p = origin.offset_meters(distance * sin_az, distance * cos_az);
            if let Some(elevation) = self.provider.sample_elevation(p.lat, p.lng) {
                let angle = ((elevation - origin_elevation) / distance).atan();
                let running = best.map_or(angle, |b| b.max(angle));
                best = Some(running);
                if running > early_exit {
                    break;
                }
            }
            step = (step * self.config.step_growth).min(self.config.max_step_m);
            distance += step;
        }
        best.map_or(Horizon::Unknown, Horizon::Angle)
    }
}

impl<P: ElevationProvider> TerrainLookup for HorizonService<P> {
    fn cached_horizon(&self, lat: f64, lng: f64, azimuth: f64) -> Option<Horizon> {
        self.cache.get(&self.key(lat, lng, azimuth)).copied()
    }

    fn horizon_angle(&mut self, lat: f64, lng: f64, azimuth: f64) -> Horizon {
        let key = self.key(lat, lng, azimuth);
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }
        let horizon = self.march(lat, lng, azimuth);
        self.cache.insert(key, horizon);
        horizon
    }
}
