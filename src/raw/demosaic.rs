//! Bayer demosaicing
//!
//! Both functions take a normalized single-channel mosaic and produce
//! interleaved RGBA f32 with white balance applied per sample.

use super::CfaPattern;

/// Bilinear interpolation over the 3x3 neighbourhood.
pub fn demosaic_bilinear(mosaic: &[f32], width: usize, height: usize, cfa: CfaPattern, wb: [f32; 4]) -> Vec<f32> {
    let mut out = vec![0.0f32; width * height * 4];
    if width == 0 || height == 0 {
        return out;
    }

    for y in 0..height {
        for x in 0..width {
            let own = cfa.color_at(y, x);
            let mut sum = [0.0f32; 3];
            let mut count = [0u32; 3];

            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(height - 1);
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let c = cfa.color_at(ny, nx);
                    sum[c] += mosaic[ny * width + nx] * wb[c];
                    count[c] += 1;
                }
            }

            let px = &mut out[(y * width + x) * 4..(y * width + x) * 4 + 4];
            for c in 0..3 {
                px[c] = if c == own {
                    mosaic[y * width + x] * wb[c]
                } else if count[c] > 0 {
                    sum[c] / count[c] as f32
                } else {
                    0.0
                };
            }
            px[3] = 1.0;
        }
    }
    out
}

/// Collapse each 2x2 block into one pixel. Output is `width/2 x height/2`.
pub fn half_size(mosaic: &[f32], width: usize, height: usize, cfa: CfaPattern, wb: [f32; 4]) -> (Vec<f32>, usize, usize) {
    let out_w = width / 2;
    let out_h = height / 2;
    let mut out = vec![0.0f32; out_w * out_h * 4];

    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut sum = [0.0f32; 3];
            let mut count = [0u32; 3];
            for dy in 0..2 {
                for dx in 0..2 {
                    let (y, x) = (oy * 2 + dy, ox * 2 + dx);
                    let c = cfa.color_at(y, x);
                    sum[c] += mosaic[y * width + x] * wb[c];
                    count[c] += 1;
                }
            }
            let px = &mut out[(oy * out_w + ox) * 4..(oy * out_w + ox) * 4 + 4];
            for c in 0..3 {
                px[c] = if count[c] > 0 { sum[c] / count[c] as f32 } else { 0.0 };
            }
            px[3] = 1.0;
        }
    }
    (out, out_w, out_h)
}
