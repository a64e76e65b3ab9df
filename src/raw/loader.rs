//! Source file loader
//!
//! RAW files are decoded with rawloader into a normalized CFA mosaic (not
//! the embedded JPEG). Files the `image` crate understands (JPEG, PNG,
//! TIFF...) are decoded to linear RGBA. White balance and the color matrix
//! are extracted here but applied later by the pixelpipe input stage.

use super::{CfaPattern, Orientation};
use crate::cache::PixelFormat;
use crate::color;
use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use tokio::task;

/// Decoded source buffer plus the metadata needed to develop it
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// `MosaicF32` (one sample per pixel) or `RgbaF32`
    pub format: PixelFormat,
    /// Normalized to 0.0-1.0 (black level subtracted for RAW)
    pub pixels: Vec<f32>,
    pub cfa: Option<CfaPattern>,
    /// White balance multipliers [R, G, B, G2], normalized so green = 1.0
    pub wb_coeffs: [f32; 4],
    /// Camera RGB → sRGB (row-major)
    pub color_matrix: [f32; 9],
    pub orientation: Orientation,
    pub maker: String,
    pub model: String,
}

/// Load a source file on the blocking pool.
pub async fn load_raw_data(path: PathBuf) -> Result<DecodedImage> {
    // Spawn blocking because decoding is CPU-intensive
    let display = path.clone();
    task::spawn_blocking(move || decode(&path))
        .await
        .map_err(|e| EngineError::Decode {
            path: display,
            reason: format!("task join error: {}", e),
        })?
}

/// Decode a source file synchronously.
pub fn decode(path: &Path) -> Result<DecodedImage> {
    if !path.exists() {
        return Err(decode_error(path, "file not found"));
    }
    if image::ImageFormat::from_path(path).is_ok() {
        decode_with_image(path)
    } else {
        decode_raw(path)
    }
}

fn decode_error(path: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::Decode {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn decode_raw(path: &Path) -> Result<DecodedImage> {
    let mut decoder = rawloader::RawLoader::new();
    let raw_image = decoder
        .decode_file(path)
        .map_err(|e| decode_error(path, format!("{:?}", e)))?;

    // Crops are [top, right, bottom, left]
    let [top, right, bottom, left] = raw_image.crops;
    let full_w = raw_image.width;
    let full_h = raw_image.height;
    let cpp = raw_image.cpp.max(1);
    if left + right >= full_w || top + bottom >= full_h {
        return Err(decode_error(path, "crop exceeds sensor size"));
    }
    let width = full_w - left - right;
    let height = full_h - top - bottom;

    let black = raw_image.blacklevels[0] as f32;
    let white = (raw_image.whitelevels[0] as f32).max(black + 1.0);
    let range = white - black;

    let sample = |row: usize, col: usize, c: usize| -> f32 {
        let idx = ((row + top) * full_w + (col + left)) * cpp + c;
        match &raw_image.data {
            rawloader::RawImageData::Integer(values) => {
                ((values[idx] as f32 - black) / range).max(0.0)
            }
            rawloader::RawImageData::Float(values) => values[idx].max(0.0),
        }
    };

    let (format, pixels, cfa) = if cpp == 1 {
        let cfa = bayer_pattern(&raw_image.cfa, top, left)
            .ok_or_else(|| decode_error(path, "unsupported CFA layout"))?;
        let mut pixels = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                pixels.push(sample(row, col, 0));
            }
        }
        (PixelFormat::MosaicF32, pixels, Some(cfa))
    } else {
        // Linear RGB (e.g. demosaiced DNG)
        let mut pixels = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            for col in 0..width {
                for c in 0..3 {
                    pixels.push(sample(row, col, c.min(cpp - 1)));
                }
                pixels.push(1.0);
            }
        }
        (PixelFormat::RgbaF32, pixels, None)
    };

    let wb_coeffs = normalize_wb(raw_image.wb_coeffs);

    let xyz = &raw_image.xyz_to_cam;
    let xyz_to_cam = [
        xyz[0][0], xyz[0][1], xyz[0][2],
        xyz[1][0], xyz[1][1], xyz[1][2],
        xyz[2][0], xyz[2][1], xyz[2][2],
    ];
    let color_matrix = color::calculate_cam_to_srgb_matrix(xyz_to_cam);

    tracing::info!(
        "📷 Loaded RAW data: {}x{} {} {} (wb {:.3}/{:.3}/{:.3})",
        width,
        height,
        raw_image.clean_make,
        raw_image.clean_model,
        wb_coeffs[0],
        wb_coeffs[1],
        wb_coeffs[2]
    );

    Ok(DecodedImage {
        width: width as u32,
        height: height as u32,
        format,
        pixels,
        cfa,
        wb_coeffs,
        color_matrix,
        orientation: Orientation(raw_image.orientation.to_u16()),
        maker: raw_image.clean_make.clone(),
        model: raw_image.clean_model.clone(),
    })
}

/// Reduce the sensor CFA to a 2x2 Bayer pattern at the crop origin.
/// Returns `None` for layouts with a longer period (X-Trans).
fn bayer_pattern(cfa: &rawloader::CFA, top: usize, left: usize) -> Option<CfaPattern> {
    let color = |row: usize, col: usize| -> u8 {
        match cfa.color_at(row + top, col + left) {
            0 => 0,
            2 => 2,
            // Second green and emerald both count as green
            _ => 1,
        }
    };
    for row in 0..6 {
        for col in 0..6 {
            if color(row, col) != color(row % 2, col % 2) {
                return None;
            }
        }
    }
    Some(CfaPattern([color(0, 0), color(0, 1), color(1, 0), color(1, 1)]))
}

/// Normalize white balance (divide by green to make green = 1.0)
fn normalize_wb(coeffs: [f32; 4]) -> [f32; 4] {
    let valid = |v: f32| v.is_finite() && v > 0.0;
    if !valid(coeffs[0]) || !valid(coeffs[1]) || !valid(coeffs[2]) {
        tracing::warn!("⚠️  No white balance data found, using neutral [1.0, 1.0, 1.0, 1.0]");
        return [1.0; 4];
    }
    let g_ref = coeffs[1];
    let g2 = if valid(coeffs[3]) { coeffs[3] } else { coeffs[1] };
    [coeffs[0] / g_ref, 1.0, coeffs[2] / g_ref, g2 / g_ref]
}

fn decode_with_image(path: &Path) -> Result<DecodedImage> {
    let img = image::open(path)?;
    let rgba = img.to_rgba32f();
    let (width, height) = rgba.dimensions();
    let pixels: Vec<f32> = rgba
        .into_raw()
        .chunks_exact(4)
        .flat_map(|px| {
            [
                color::srgb_to_linear(px[0]),
                color::srgb_to_linear(px[1]),
                color::srgb_to_linear(px[2]),
                px[3],
            ]
        })
        .collect();

    tracing::debug!("🖼️  Loaded image: {}x{} from {}", width, height, path.display());

    Ok(DecodedImage {
        width,
        height,
        format: PixelFormat::RgbaF32,
        pixels,
        cfa: None,
        wb_coeffs: [1.0; 4],
        color_matrix: color::IDENTITY,
        orientation: Orientation::NORMAL,
        maker: String::new(),
        model: String::new(),
    })
}
