//! Non-destructive RAW development engine
//!
//! - `cache`: tiered mipmap cache (thumbnails, preview, full) with a JPEG
//!   disk backend
//! - `develop`: history stacks, processing modules, the pixelpipe and the
//!   per-image develop session
//! - `state`: the SQLite catalog and the image record cache
//! - `raw`: source decoding and pixel helpers
//! - `context`: the process-wide services tying them together

pub mod cache;
pub mod color;
pub mod config;
pub mod context;
pub mod develop;
pub mod error;
pub mod jobs;
pub mod raw;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use context::Context;
pub use error::{EngineError, Result};
