//! Solar geometry and building shadow engine.
//!
//! Computes apparent sun positions, per-building ground shadows for a map
//! viewport, and whether points of interest sit in sun or shade given
//! nearby buildings and distant terrain. `SunSession` ties these together
//! with reuse of previous results while the sun and camera barely move.

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod config;
pub mod consensus;
pub mod ephemeris;
pub mod error;
pub mod geometry;
pub mod model;
pub mod occlusion;
pub mod session;
pub mod shadows;
pub mod terrain;

#[cfg(feature = "python")]
mod bindings;

pub use config::{EngineConfig, OcclusionConfig, ProjectionMethod, SessionConfig, ShadowConfig, TerrainConfig};
pub use ephemeris::{sun_position, SunPosition, NIGHT_THRESHOLD_DEG};
pub use error::{EngineError, EngineResult};
pub use geometry::{BoundingBox, Position};
pub use model::{Building, BuildingRecord, OutdoorSeating, Place, PlaceKind};
pub use occlusion::OcclusionEvaluator;
pub use session::{FetchTicket, RedrawGate, RedrawOutput, SunSession, Viewport};
pub use shadows::{ShadowEngine, ShadowFrame, ShadowMap};
pub use terrain::{ElevationProvider, Horizon, HorizonService, TerrainLookup, TileElevationProvider, TileSource};

#[cfg(feature = "python")]
#[pymodule]
fn sunshade(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    register_solar_module(py_module)?;
    register_session_module(py_module)?;

    py_module.add("__doc__", "Sun position, building shadows and sunlit places.")?;

    Ok(())
}

#[cfg(feature = "python")]
fn register_solar_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "solar")?;
    submodule.add("__doc__", "Sun position and single-footprint shadow geometry.")?;
    submodule.add_function(wrap_pyfunction!(bindings::sun_position, &submodule)?)?;
    submodule.add_function(wrap_pyfunction!(bindings::point_in_polygon, &submodule)?)?;
    submodule.add_function(wrap_pyfunction!(bindings::shadow_length, &submodule)?)?;
    submodule.add_function(wrap_pyfunction!(bindings::project_shadow, &submodule)?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_session_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "session")?;
    submodule.add("__doc__", "Viewport session with shadow and sunlit-state caching.")?;
    submodule.add_class::<bindings::PySession>()?;
    submodule.add_class::<bindings::PyRedrawResult>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
