//! Error types for the development engine
//!
//! Only catalog I/O, configuration and explicit decode calls surface errors.
//! The mipmap cache degrades to a dead-image placeholder instead, and the
//! develop orchestrator reports skipped history items as diagnostics.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("image {0} not found in catalog")]
    ImageNotFound(u32),

    #[error("module `{0}` is not installed")]
    ModuleMissing(String),

    #[error("module `{module}` cannot migrate parameters from version {from} to {to}")]
    Migration { module: String, from: u32, to: u32 },

    #[error("module `{module}` expects {expected} parameter bytes, got {actual}")]
    ParamsSize {
        module: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("develop session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
