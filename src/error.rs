//! Error type shared by configuration loading, record parsing and the terrain
//! tile pipeline.
//!
//! Geometry and shadow code never returns errors: degenerate input yields an
//! empty result instead.

use thiserror::Error;

use crate::terrain::TileKey;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("terrain tile {key} is malformed: {reason}")]
    MalformedTile { key: TileKey, reason: String },

    #[error("terrain tile {key} could not be fetched: {reason}")]
    TileFetch { key: TileKey, reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
