//! State management module
//!
//! This module handles all persisted state:
//! - Shared data structures (data.rs)
//! - Database connections and queries (library.rs)
//! - In-memory image records with write-back (image_cache.rs)

pub mod data;
pub mod image_cache;
pub mod library;

pub use data::{ImageFlags, ImageRecord};
pub use image_cache::{ImageCache, WriteMode};
pub use library::{Catalog, Library, Preset};
