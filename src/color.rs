//! Color space conversion utilities
//!
//! This module handles conversion between different color spaces:
//! - Camera RGB (sensor-native color space)
//! - XYZ (device-independent color space)
//! - sRGB (standard display color space)

use cgmath::{Matrix3, SquareMatrix};

/// Standard sRGB to XYZ conversion matrix (D65 white point, row-major)
/// Source: IEC 61966-2-1:1999 (sRGB standard)
const SRGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_453, 0.357_580, 0.180_423],
    [0.212_671, 0.715_160, 0.072_169],
    [0.019_334, 0.119_193, 0.950_227],
];

/// Rec. 709 luminance weights
pub const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub const IDENTITY: [f32; 9] = [
    1.0, 0.0, 0.0,
    0.0, 1.0, 0.0,
    0.0, 0.0, 1.0,
];

/// Build a cgmath matrix from a row-major array (cgmath is column-major).
fn from_rows(m: [[f32; 3]; 3]) -> Matrix3<f32> {
    Matrix3::new(
        m[0][0], m[1][0], m[2][0],
        m[0][1], m[1][1], m[2][1],
        m[0][2], m[1][2], m[2][2],
    )
}

fn to_flat_rows(m: &Matrix3<f32>) -> [f32; 9] {
    [
        m[0][0], m[1][0], m[2][0],
        m[0][1], m[1][1], m[2][1],
        m[0][2], m[1][2], m[2][2],
    ]
}

/// Calculate the camera-to-sRGB color conversion matrix
///
/// # Arguments
/// * `xyz_to_cam` - The camera's XYZ to camera RGB matrix (row-major, from RAW metadata)
///
/// # Algorithm
/// 1. cam_from_srgb = xyz_to_cam × SRGB_TO_XYZ
/// 2. Normalize each row to sum to 1 so white stays white after white balance
/// 3. Invert to get cam_to_srgb
///
/// Falls back to identity for missing, singular or absurd matrices.
pub fn calculate_cam_to_srgb_matrix(xyz_to_cam: [f32; 9]) -> [f32; 9] {
    if xyz_to_cam.iter().all(|&v| v == 0.0) || is_identity_matrix(&xyz_to_cam) {
        return IDENTITY;
    }

    // Camera matrices are often scaled by 10000 in RAW metadata
    let scale = if xyz_to_cam.iter().any(|&x| x.abs() > 10.0) { 1.0 / 10000.0 } else { 1.0 };
    let rows = [
        [xyz_to_cam[0] * scale, xyz_to_cam[1] * scale, xyz_to_cam[2] * scale],
        [xyz_to_cam[3] * scale, xyz_to_cam[4] * scale, xyz_to_cam[5] * scale],
        [xyz_to_cam[6] * scale, xyz_to_cam[7] * scale, xyz_to_cam[8] * scale],
    ];

    let cam_from_srgb = from_rows(rows) * from_rows(SRGB_TO_XYZ);
    let mut flat = to_flat_rows(&cam_from_srgb);
    for row in flat.chunks_exact_mut(3) {
        let sum: f32 = row.iter().sum();
        if sum.abs() < 1e-6 {
            tracing::warn!("⚠️  Degenerate camera matrix row, using identity");
            return IDENTITY;
        }
        row.iter_mut().for_each(|v| *v /= sum);
    }

    let normalized = from_rows([
        [flat[0], flat[1], flat[2]],
        [flat[3], flat[4], flat[5]],
        [flat[6], flat[7], flat[8]],
    ]);
    let Some(cam_to_srgb) = normalized.invert() else {
        tracing::warn!("⚠️  Failed to invert camera matrix, using identity");
        return IDENTITY;
    };

    let result = to_flat_rows(&cam_to_srgb);
    if result.iter().any(|&x| !x.is_finite() || x.abs() > 10.0) {
        tracing::warn!("⚠️  Camera matrix has extreme values, using identity");
        return IDENTITY;
    }
    result
}

/// Check if a color matrix is the identity matrix (no conversion)
pub fn is_identity_matrix(matrix: &[f32; 9]) -> bool {
    const EPSILON: f32 = 0.001;
    matrix.iter().zip(IDENTITY.iter()).all(|(a, b)| (a - b).abs() < EPSILON)
}

/// Apply a row-major 3x3 matrix to an RGB triple.
#[inline]
pub fn apply_matrix(m: &[f32; 9], rgb: [f32; 3]) -> [f32; 3] {
    [
        m[0] * rgb[0] + m[1] * rgb[1] + m[2] * rgb[2],
        m[3] * rgb[0] + m[4] * rgb[1] + m[5] * rgb[2],
        m[6] * rgb[0] + m[7] * rgb[1] + m[8] * rgb[2],
    ]
}

#[inline]
pub fn luminance(rgb: [f32; 3]) -> f32 {
    rgb[0] * LUMA[0] + rgb[1] * LUMA[1] + rgb[2] * LUMA[2]
}

/// sRGB transfer function (linear → display)
#[inline]
pub fn linear_to_srgb(v: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Inverse sRGB transfer function (display → linear)
#[inline]
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_matrix_detection() {
        assert!(is_identity_matrix(&IDENTITY));

        let non_identity = [1.5, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        assert!(!is_identity_matrix(&non_identity));
    }

    #[test]
    fn test_cam_to_srgb_keeps_white() {
        // Canon EOS 5D Mark II xyz_to_cam, scaled by 10000 as found in metadata
        let xyz_to_cam = [
            4716.0, 603.0, -830.0,
            -7798.0, 15474.0, 2480.0,
            -1496.0, 1937.0, 6651.0,
        ];
        let m = calculate_cam_to_srgb_matrix(xyz_to_cam);
        assert!(!is_identity_matrix(&m));

        // Rows of the inverse of a row-normalized matrix sum to 1
        let white = apply_matrix(&m, [1.0, 1.0, 1.0]);
        for c in white {
            assert!((c - 1.0).abs() < 1e-3, "white drifted to {:?}", white);
        }
    }

    #[test]
    fn test_missing_matrix_is_identity() {
        assert_eq!(calculate_cam_to_srgb_matrix([0.0; 9]), IDENTITY);
        assert_eq!(calculate_cam_to_srgb_matrix(IDENTITY), IDENTITY);
    }

    #[test]
    fn test_transfer_functions_invert() {
        for v in [0.0, 0.002, 0.18, 0.5, 1.0] {
            assert!((srgb_to_linear(linear_to_srgb(v)) - v).abs() < 1e-4);
        }
        assert!((luminance([1.0, 1.0, 1.0]) - 1.0).abs() < 1e-6);
    }
}
