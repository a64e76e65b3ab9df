//! Resampling and orientation of interleaved RGBA buffers

use super::Orientation;
use image::imageops::FilterType;
use image::RgbaImage;

/// Largest size with the same aspect ratio that fits in `max_w x max_h`.
/// Never upscales; never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = (max_w as f64 / width as f64).min(max_h as f64 / height as f64).min(1.0);
    (
        ((width as f64 * scale).round() as u32).clamp(1, max_w.max(1)),
        ((height as f64 * scale).round() as u32).clamp(1, max_h.max(1)),
    )
}

/// Area-average RGBA f32 resampling ("clip and zoom").
pub fn resize_rgba_f32(src: &[f32], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<f32> {
    if sw == dw && sh == dh {
        return src.to_vec();
    }
    let mut out = vec![0.0f32; dw * dh * 4];
    if sw == 0 || sh == 0 {
        return out;
    }

    let span = |d: usize, dst: usize, source: usize| -> (usize, usize) {
        let start = d * source / dst;
        let end = ((d + 1) * source).div_ceil(dst).max(start + 1).min(source);
        (start, end)
    };

    for dy in 0..dh {
        let (y0, y1) = span(dy, dh, sh);
        for dx in 0..dw {
            let (x0, x1) = span(dx, dw, sw);
            let mut acc = [0.0f32; 4];
            for sy in y0..y1 {
                for sx in x0..x1 {
                    let i = (sy * sw + sx) * 4;
                    for c in 0..4 {
                        acc[c] += src[i + c];
                    }
                }
            }
            let n = ((y1 - y0) * (x1 - x0)) as f32;
            let o = (dy * dw + dx) * 4;
            for c in 0..4 {
                out[o + c] = acc[c] / n;
            }
        }
    }
    out
}

/// High quality RGBA8 resampling.
pub fn resize_rgba8(src: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if src.dimensions() == (width, height) {
        return src.clone();
    }
    image::imageops::resize(src, width, height, FilterType::Triangle)
}

/// Apply an EXIF orientation to an interleaved buffer with `channels`
/// values per pixel. Returns the new buffer and its dimensions.
pub fn orient<T: Copy>(src: &[T], width: usize, height: usize, channels: usize, orientation: Orientation) -> (Vec<T>, usize, usize) {
    if !matches!(orientation.0, 2..=8) {
        return (src.to_vec(), width, height);
    }
    let (ow, oh) = if orientation.swaps_dimensions() { (height, width) } else { (width, height) };
    let mut out = Vec::with_capacity(src.len());

    for oy in 0..oh {
        for ox in 0..ow {
            let (ix, iy) = match orientation.0 {
                2 => (width - 1 - ox, oy),
                3 => (width - 1 - ox, height - 1 - oy),
                4 => (ox, height - 1 - oy),
                5 => (oy, ox),
                6 => (oy, height - 1 - ox),
                7 => (width - 1 - oy, height - 1 - ox),
                _ => (width - 1 - oy, ox),
            };
            let i = (iy * width + ix) * channels;
            out.extend_from_slice(&src[i..i + channels]);
        }
    }
    (out, ow, oh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(600, 400, 256, 256), (256, 171));
        assert_eq!(fit_within(400, 600, 256, 256), (171, 256));
        assert_eq!(fit_within(100, 50, 256, 256), (100, 50));
        assert_eq!(fit_within(10000, 1, 256, 256), (256, 1));
    }

    #[test]
    fn test_resize_averages() {
        // 2x1 image, black and white, collapses to mid grey
        let src = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let out = resize_rgba_f32(&src, 2, 1, 1, 1);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_resize_non_integer_ratio() {
        let src = vec![0.25f32; 7 * 5 * 4];
        let out = resize_rgba_f32(&src, 7, 5, 3, 2);
        assert_eq!(out.len(), 3 * 2 * 4);
        assert!(out.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_orient_rotate_90() {
        // 3x2 single channel:
        // 1 2 3
        // 4 5 6
        let src = [1, 2, 3, 4, 5, 6];
        let (out, w, h) = orient(&src, 3, 2, 1, Orientation::ROTATE_90);
        assert_eq!((w, h), (2, 3));
        // Rotated clockwise:
        // 4 1
        // 5 2
        // 6 3
        assert_eq!(out, vec![4, 1, 5, 2, 6, 3]);

        let (out, _, _) = orient(&src, 3, 2, 1, Orientation::ROTATE_270);
        assert_eq!(out, vec![3, 6, 2, 5, 1, 4]);

        let (out, _, _) = orient(&src, 3, 2, 1, Orientation::ROTATE_180);
        assert_eq!(out, vec![6, 5, 4, 3, 2, 1]);

        let (out, _, _) = orient(&src, 3, 2, 1, Orientation::NORMAL);
        assert_eq!(out, src.to_vec());
    }
}
