//! Python surface.
//!
//! Plain functions for one-off queries plus a `Session` class wrapping
//! `SunSession`. Rings cross the boundary as `N × 2` float64 arrays of
//! `(lng, lat)`; instants as POSIX timestamps in seconds.

use std::collections::HashMap;
use std::sync::{Mutex, TryLockError};

use chrono::{DateTime, TimeZone, Utc};
use ndarray::{Array2, Array3};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::EngineConfig;
use crate::ephemeris::{self, SunPosition};
use crate::error::{EngineError, EngineResult};
use crate::geometry::{self, BoundingBox, Position, ShadowLimits};
use crate::model::{parse_buildings, parse_places};
use crate::session::{FetchTicket, RedrawGate, RedrawOutput, SunSession, Viewport};
use crate::terrain::{TileElevationProvider, TileKey, TileSource};

fn engine_err(err: EngineError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn instant_from_timestamp(timestamp: f64) -> PyResult<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return Err(PyValueError::new_err("timestamp must be finite"));
    }
    let secs = timestamp.floor();
    let nanos = (((timestamp - secs) * 1e9).round() as u32).min(999_999_999);
    Utc.timestamp_opt(secs as i64, nanos)
        .single()
        .ok_or_else(|| PyValueError::new_err(format!("timestamp {timestamp} is out of range")))
}

fn ring_from_array(ring: &PyReadonlyArray2<f64>) -> PyResult<Vec<Position>> {
    let view = ring.as_array();
    if view.ncols() != 2 {
        return Err(PyValueError::new_err(format!(
            "ring must have shape (N, 2), got {:?}",
            view.shape()
        )));
    }
    Ok(view
        .rows()
        .into_iter()
        .map(|row| Position::new(row[0], row[1]))
        .collect())
}

fn ring_to_array(ring: &[Position]) -> Array2<f64> {
    Array2::from_shape_fn((ring.len(), 2), |(i, j)| {
        if j == 0 {
            ring[i].lng
        } else {
            ring[i].lat
        }
    })
}

fn bounds_from_tuple((min_lng, min_lat, max_lng, max_lat): (f64, f64, f64, f64)) -> BoundingBox {
    BoundingBox::new(min_lng, min_lat, max_lng, max_lat)
}

// ── Functions ───────────────────────────────────────────────────────────────

#[pyfunction]
/// Apparent sun position as `(altitude_deg, azimuth_deg)`.
///
/// Azimuth is measured clockwise from true north.
pub fn sun_position(timestamp: f64, lat: f64, lng: f64) -> PyResult<(f64, f64)> {
    let instant = instant_from_timestamp(timestamp)?;
    let sun = ephemeris::sun_position(&instant, lat, lng);
    Ok((sun.altitude_deg(), sun.azimuth_deg()))
}

#[pyfunction]
/// Boundary-inclusive point-in-polygon test.
pub fn point_in_polygon(lng: f64, lat: f64, ring: PyReadonlyArray2<f64>) -> PyResult<bool> {
    let ring = ring_from_array(&ring)?;
    Ok(geometry::is_point_in_polygon(&Position::new(lng, lat), &ring))
}

#[pyfunction]
#[pyo3(signature = (height_m, altitude_deg, max_length_m=1500.0))]
/// Ground shadow length in metres.
pub fn shadow_length(height_m: f64, altitude_deg: f64, max_length_m: f64) -> f64 {
    let limits = ShadowLimits {
        max_length_m,
        ..ShadowLimits::default()
    };
    geometry::shadow_length(height_m, &SunPosition::from_degrees(altitude_deg, 0.0), &limits)
}

#[pyfunction]
#[pyo3(signature = (ring, height_m, altitude_deg, azimuth_deg, method="ribbon", min_drawable_m=0.0))]
/// Shadow polygon of one footprint as an `N × 2` array (empty when there is
/// no drawable shadow).
///
/// `method` is `"ribbon"` or `"convex_hull"`.
pub fn project_shadow<'py>(
    py: Python<'py>,
    ring: PyReadonlyArray2<'py, f64>,
    height_m: f64,
    altitude_deg: f64,
    azimuth_deg: f64,
    method: &str,
    min_drawable_m: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let footprint = ring_from_array(&ring)?;
    let sun = SunPosition::from_degrees(altitude_deg, azimuth_deg);
    let limits = ShadowLimits {
        min_drawable_m,
        ..ShadowLimits::default()
    };
    let polygon = match method {
        "ribbon" => geometry::project_ribbon(&footprint, height_m, &sun, &limits),
        "convex_hull" => geometry::project_hull(&footprint, height_m, &sun, &limits),
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown projection method '{other}', expected 'ribbon' or 'convex_hull'"
            )))
        }
    };
    Ok(ring_to_array(&polygon).into_pyarray(py))
}

// ── Terrain tiles from Python ───────────────────────────────────────────────

/// Calls `fetch(zoom, x, y, hi_dpi)`, which returns an `H × W × 3` uint8
/// array, or `None` when the tile is unavailable.
struct PyTileSource {
    fetch: Py<PyAny>,
}

impl TileSource for PyTileSource {
    fn fetch_tile(&mut self, key: TileKey) -> EngineResult<Array3<u8>> {
        let failed = |reason: String| EngineError::TileFetch { key, reason };
        Python::with_gil(|py| {
            let tile = self
                .fetch
                .call1(py, (key.zoom, key.x, key.y, key.hi_dpi))
                .map_err(|e| failed(e.to_string()))?;
            if tile.is_none(py) {
                return Err(failed("source returned None".into()));
            }
            let pixels = tile
                .bind(py)
                .extract::<PyReadonlyArray3<u8>>()
                .map_err(|e| failed(e.to_string()))?;
            Ok(pixels.as_array().to_owned())
        })
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

#[pyclass(name = "RedrawResult")]
/// Output of one `Session.redraw` call.
pub struct PyRedrawResult {
    output: RedrawOutput,
}

#[pymethods]
impl PyRedrawResult {
    #[getter]
    fn sun_altitude_deg(&self) -> f64 {
        self.output.sun.altitude_deg()
    }

    #[getter]
    fn sun_azimuth_deg(&self) -> f64 {
        self.output.sun.azimuth_deg()
    }

    #[getter]
    fn occlusion_reused(&self) -> bool {
        self.output.occlusion_reused
    }

    /// Place id → sunlit.
    #[getter]
    fn sunlit(&self) -> HashMap<String, bool> {
        (*self.output.sunlit).clone()
    }

    /// Building id → shadow ring, for buildings with a drawable shadow.
    fn shadow_polygons<'py>(&self, py: Python<'py>) -> HashMap<String, Bound<'py, PyArray2<f64>>> {
        self.output
            .shadows
            .polygons
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(id, ring)| (id.clone(), ring_to_array(ring).into_pyarray(py)))
            .collect()
    }

    /// `(building_id, polygon, hole, opacity)` per shadow, in draw order.
    fn drawables<'py>(
        &self,
        py: Python<'py>,
    ) -> Vec<(String, Bound<'py, PyArray2<f64>>, Bound<'py, PyArray2<f64>>, f64)> {
        self.output
            .shadows
            .drawables
            .iter()
            .map(|d| {
                (
                    d.building_id.clone(),
                    ring_to_array(&d.polygon).into_pyarray(py),
                    ring_to_array(&d.hole).into_pyarray(py),
                    d.opacity,
                )
            })
            .collect()
    }
}

#[pyclass(name = "Session")]
/// Shadow and sunlit-state session over a map viewport.
///
/// Fetch results are applied only with the newest ticket from
/// `begin_fetch`. `redraw` runs without the GIL and returns `None` when
/// another redraw is still running.
pub struct PySession {
    inner: Mutex<SunSession>,
    gate: RedrawGate,
}

impl PySession {
    /// Run `f` on the session with the GIL released while waiting for the
    /// lock, since a running redraw may need the GIL to fetch terrain tiles.
    fn with_session<T, F>(&self, py: Python<'_>, f: F) -> PyResult<T>
    where
        T: Send,
        F: FnOnce(&mut SunSession) -> T + Send,
    {
        py.allow_threads(|| {
            let mut session = self
                .inner
                .lock()
                .map_err(|_| PyRuntimeError::new_err("session state is poisoned"))?;
            Ok(f(&mut session))
        })
    }
}

#[pymethods]
impl PySession {
    #[new]
    #[pyo3(signature = (config_json=None, terrain_tiles=None))]
    pub fn new(config_json: Option<&str>, terrain_tiles: Option<Py<PyAny>>) -> PyResult<Self> {
        let config = match config_json {
            Some(text) => EngineConfig::from_json(text).map_err(engine_err)?,
            None => EngineConfig::default(),
        };
        let terrain_config = config.terrain.clone();
        let mut session = SunSession::new(config).map_err(engine_err)?;
        if let Some(fetch) = terrain_tiles {
            let provider = TileElevationProvider::new(PyTileSource { fetch }, &terrain_config);
            session = session.with_terrain(provider);
        }
        let gate = session.redraw_gate();
        Ok(Self {
            inner: Mutex::new(session),
            gate,
        })
    }

    /// Start a data fetch; returns its ticket.
    pub fn begin_fetch(&self, py: Python<'_>) -> PyResult<u64> {
        self.with_session(py, |s| s.begin_fetch().generation())
    }

    /// Apply a fetch result. `buildings_json` is a JSON array of
    /// `{id, footprint: [[lng, lat], ...], height?, levels?}`;
    /// `places_json` a JSON array of places. Returns `False` when the
    /// ticket is stale.
    pub fn apply_fetch(
        &self,
        py: Python<'_>,
        ticket: u64,
        bounds: (f64, f64, f64, f64),
        buildings_json: &str,
        places_json: &str,
    ) -> PyResult<bool> {
        let buildings = parse_buildings(buildings_json).map_err(engine_err)?;
        let places = parse_places(places_json).map_err(engine_err)?;
        let bounds = bounds_from_tuple(bounds);
        self.with_session(py, move |s| {
            s.apply_fetch(FetchTicket::from_generation(ticket), bounds, buildings, places)
        })
    }

    pub fn apply_zoom(&self, py: Python<'_>, zoom: f64) -> PyResult<bool> {
        self.with_session(py, |s| s.apply_zoom(zoom))
    }

    pub fn needs_fetch(&self, py: Python<'_>, bounds: (f64, f64, f64, f64), zoom: f64) -> PyResult<bool> {
        let viewport = Viewport::new(bounds_from_tuple(bounds), zoom);
        self.with_session(py, |s| s.needs_fetch(&viewport))
    }

    pub fn clear_places(&self, py: Python<'_>) -> PyResult<()> {
        self.with_session(py, |s| s.clear_places())
    }

    pub fn redraw(
        &self,
        py: Python,
        bounds: (f64, f64, f64, f64),
        zoom: f64,
        timestamp: f64,
    ) -> PyResult<Option<PyRedrawResult>> {
        let instant = instant_from_timestamp(timestamp)?;
        let viewport = Viewport::new(bounds_from_tuple(bounds), zoom);
        let output = py.allow_threads(|| match self.inner.try_lock() {
            Ok(mut session) => Ok(session.redraw(&viewport, &instant)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(_)) => Err(PyRuntimeError::new_err("session state is poisoned")),
        })?;
        Ok(output.map(|output| PyRedrawResult { output }))
    }

    #[getter]
    pub fn is_redrawing(&self) -> bool {
        self.gate.is_busy()
    }

    #[getter]
    pub fn building_count(&self, py: Python<'_>) -> PyResult<usize> {
        self.with_session(py, |s| s.buildings().len())
    }

    #[getter]
    pub fn place_count(&self, py: Python<'_>) -> PyResult<usize> {
        self.with_session(py, |s| s.place_count())
    }

    pub fn dispose(&self, py: Python<'_>) -> PyResult<()> {
        self.with_session(py, |s| s.dispose())
    }
}
