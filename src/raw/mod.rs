//! Source decoding and pixel-level helpers
//!
//! Everything here is a pure function of its inputs: decode a file, pull
//! an embedded preview, demosaic a mosaic, resample or rotate a buffer.

pub mod demosaic;
pub mod downsample;
pub mod loader;
pub mod thumbnail;

pub use loader::{decode, load_raw_data, DecodedImage};

/// 2x2 Bayer pattern: color index (0 = R, 1 = G, 2 = B) at
/// (0,0), (0,1), (1,0), (1,1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfaPattern(pub [u8; 4]);

impl CfaPattern {
    pub const RGGB: CfaPattern = CfaPattern([0, 1, 1, 2]);
    pub const BGGR: CfaPattern = CfaPattern([2, 1, 1, 0]);
    pub const GRBG: CfaPattern = CfaPattern([1, 0, 2, 1]);
    pub const GBRG: CfaPattern = CfaPattern([1, 2, 0, 1]);

    #[inline]
    pub fn color_at(&self, row: usize, col: usize) -> usize {
        self.0[(row & 1) * 2 + (col & 1)] as usize
    }
}

/// EXIF orientation tag (1-8, 0 = unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orientation(pub u16);

impl Orientation {
    pub const NORMAL: Orientation = Orientation(1);
    pub const ROTATE_90: Orientation = Orientation(6);
    pub const ROTATE_180: Orientation = Orientation(3);
    pub const ROTATE_270: Orientation = Orientation(8);

    /// True when width and height trade places.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self.0, 5..=8)
    }

    pub fn oriented_size(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }
}
