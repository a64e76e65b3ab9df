//! Per-image metadata record
//!
//! This is the data model that flows between the catalog and the caches.
//! The decode-derived fields (white balance, color matrix, CFA) are filled
//! in when the full-resolution buffer is first generated.

use crate::color;
use crate::raw::{CfaPattern, Orientation};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Persisted image flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageFlags(pub u32);

impl ImageFlags {
    /// Auto-presets were applied once; never apply them again.
    pub const AUTO_PRESETS_APPLIED: ImageFlags = ImageFlags(1 << 0);

    pub fn contains(self, other: ImageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: ImageFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// A single image in the library
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Unique database ID
    pub id: u32,
    /// Filename only (e.g., "DSC_0001.NEF")
    pub filename: String,
    /// Full path to the source file
    pub path: PathBuf,
    /// Decoded size before orientation (0 until first decode)
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
    pub maker: String,
    pub model: String,
    pub flags: ImageFlags,
    /// Number of active history items
    pub history_end: u32,
    pub imported_at: DateTime<Utc>,
    pub change_timestamp: Option<DateTime<Utc>>,
    /// White balance multipliers [R, G, B, G2]
    pub wb_coeffs: [f32; 4],
    /// Camera RGB → sRGB (row-major)
    pub color_matrix: [f32; 9],
    pub cfa: Option<CfaPattern>,
}

impl ImageRecord {
    pub fn new(id: u32, path: PathBuf) -> Self {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        ImageRecord {
            id,
            filename,
            path,
            width: 0,
            height: 0,
            orientation: Orientation::NORMAL,
            maker: String::new(),
            model: String::new(),
            flags: ImageFlags::default(),
            history_end: 0,
            imported_at: Utc::now(),
            change_timestamp: None,
            wb_coeffs: [1.0; 4],
            color_matrix: color::IDENTITY,
            cfa: None,
        }
    }

    /// Size after orientation is applied
    pub fn oriented_size(&self) -> (u32, u32) {
        self.orientation.oriented_size(self.width, self.height)
    }
}
