//! Embedded preview extraction
//!
//! Most RAW files carry one or more JPEG previews. Pulling one out is far
//! cheaper than decoding and developing the sensor data, so the mipmap cache
//! tries this first for unedited images.

use image::{ImageFormat, RgbaImage};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const JPEG_START: [u8; 2] = [0xFF, 0xD8];
const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// Makers whose embedded previews are known to be unusable (wrong
/// orientation or cropped differently from the sensor data).
const UNRELIABLE_MAKERS: &[&str] = &["Phase One"];

pub fn maker_has_reliable_preview(maker: &str) -> bool {
    !UNRELIABLE_MAKERS.iter().any(|m| maker.eq_ignore_ascii_case(m))
}

/// Decode the best embedded JPEG of a source file.
///
/// Search tiers:
/// 1. First 256KB, previews larger than 50KB
/// 2. First 512KB, previews larger than 30KB
/// 3. First 5MB, previews larger than 10KB
/// 4. Whole file, every preview, largest first
pub fn load_embedded_thumbnail(path: &Path) -> Option<RgbaImage> {
    const TIERS: [(usize, usize); 3] = [(256 * 1024, 50_000), (512 * 1024, 30_000), (5 * 1024 * 1024, 10_000)];

    for (tier, (max_bytes, min_size)) in TIERS.iter().enumerate() {
        if let Some(img) = extract_jpeg_from_raw(path, *max_bytes, *min_size).and_then(|jpeg| decode_jpeg(&jpeg)) {
            tracing::debug!("📸 Embedded preview {}x{} (tier {})", img.width(), img.height(), tier + 1);
            return Some(img);
        }
    }

    let mut data = Vec::new();
    File::open(path).ok()?.read_to_end(&mut data).ok()?;
    let mut candidates = find_all_jpegs(&data);
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    let found = candidates.into_iter().find_map(decode_jpeg);
    if let Some(img) = &found {
        tracing::debug!("📸 Embedded preview {}x{} (full scan)", img.width(), img.height());
    }
    found
}

fn decode_jpeg(data: &[u8]) -> Option<RgbaImage> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .ok()
        .map(|img| img.to_rgba8())
}

/// Read up to `max_bytes` of the file and return the first JPEG larger than `min_size`
fn extract_jpeg_from_raw(raw_path: &Path, max_bytes: usize, min_size: usize) -> Option<Vec<u8>> {
    let file = File::open(raw_path).ok()?;
    let mut data = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut data).ok()?;
    extract_jpeg_from_data(&data, min_size).map(|slice| slice.to_vec())
}

/// Extract JPEG from already-loaded data
fn extract_jpeg_from_data(data: &[u8], min_size: usize) -> Option<&[u8]> {
    // Only look at the first few start markers
    let starts = data
        .windows(2)
        .enumerate()
        .filter(|(_, w)| *w == JPEG_START)
        .map(|(i, _)| i)
        .take(6);

    for start in starts {
        if let Some(end_offset) = data[start..].windows(2).position(|w| w == JPEG_END) {
            let end = start + end_offset + 1;
            if end - start + 1 > min_size {
                return Some(&data[start..=end]);
            }
        }
    }
    None
}

/// Every start/end marker pair in `data`
fn find_all_jpegs(data: &[u8]) -> Vec<&[u8]> {
    let mut found = Vec::new();
    for (i, window) in data.windows(2).enumerate() {
        if window != JPEG_START {
            continue;
        }
        if let Some(end_offset) = data[i..].windows(2).position(|w| w == JPEG_END) {
            found.push(&data[i..=i + end_offset + 1]);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scratch_dir, write_jpeg};

    #[test]
    fn test_extract_from_padded_container() {
        let dir = scratch_dir("embedded");
        let jpeg_path = write_jpeg(&dir, "inner.jpg", 64, 48, [10, 200, 30]);
        let jpeg = std::fs::read(&jpeg_path).unwrap();

        // Fake RAW container: header, preview, trailing sensor garbage
        let mut container = vec![0x49, 0x49, 0x2A, 0x00];
        container.extend(std::iter::repeat(0x11).take(1000));
        container.extend_from_slice(&jpeg);
        container.extend(std::iter::repeat(0x22).take(1000));
        let raw_path = dir.join("fake.nef");
        std::fs::write(&raw_path, &container).unwrap();

        let img = load_embedded_thumbnail(&raw_path).unwrap();
        assert_eq!(img.dimensions(), (64, 48));
    }

    #[test]
    fn test_no_preview() {
        let dir = scratch_dir("embedded-none");
        let raw_path = dir.join("empty.nef");
        std::fs::write(&raw_path, vec![0u8; 4096]).unwrap();
        assert!(load_embedded_thumbnail(&raw_path).is_none());
    }

    #[test]
    fn test_extract_respects_min_size() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        assert!(extract_jpeg_from_data(&data, 100).is_none());
        assert_eq!(extract_jpeg_from_data(&data, 3).unwrap().len(), 7);
    }

    #[test]
    fn test_unreliable_makers() {
        assert!(!maker_has_reliable_preview("Phase One"));
        assert!(maker_has_reliable_preview("Nikon"));
    }
}
