//! Disk backing for thumbnail levels
//!
//! Layout: `<cache-dir>/<root>.d/<level>/<image-id>.jpg`, where `<root>` is
//! `mipmaps-<hash of the catalog path>` so two catalogs never share files.
//! A missing file only means "not cached yet".

use super::descriptor::MipLevel;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use siphasher::sip128::{Hasher128, SipHasher13};
use std::fs;
use std::hash::Hasher;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Root name used when the catalog lives in memory.
pub const MEMORY_ROOT_NAME: &str = "mipmaps-memory";

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// RGBA8 pixels loaded from disk.
#[derive(Debug, Clone)]
pub struct DiskThumbnail {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug)]
pub struct DiskCache {
    root: Option<PathBuf>,
    quality: u8,
}

impl DiskCache {
    /// A disk cache under `cache_dir`, or a disabled one when `enabled` is false.
    pub fn new(cache_dir: &Path, catalog_path: Option<&Path>, enabled: bool, quality: u8) -> Self {
        let root = enabled.then(|| cache_dir.join(format!("{}.d", Self::root_name(catalog_path))));
        if let Some(root) = &root {
            tracing::debug!("📁 Thumbnail disk cache at {}", root.display());
        }
        DiskCache {
            root,
            quality: quality.clamp(10, 100),
        }
    }

    pub fn disabled() -> Self {
        DiskCache { root: None, quality: 90 }
    }

    /// Cache root file name for a catalog.
    pub fn root_name(catalog_path: Option<&Path>) -> String {
        let Some(path) = catalog_path else {
            return MEMORY_ROOT_NAME.to_string();
        };
        let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut hasher = SipHasher13::new();
        hasher.write(absolute.to_string_lossy().as_bytes());
        format!("mipmaps-{:032x}", hasher.finish128().as_u128())
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn path(&self, image_id: u32, level: MipLevel) -> Option<PathBuf> {
        if !level.is_thumbnail() {
            return None;
        }
        let root = self.root.as_ref()?;
        Some(root.join(level.index().to_string()).join(format!("{}.jpg", image_id)))
    }

    pub fn exists(&self, image_id: u32, level: MipLevel) -> bool {
        self.path(image_id, level).map(|p| p.exists()).unwrap_or(false)
    }

    /// Load a serialized thumbnail, deleting it when it is not a valid
    /// JPEG or exceeds the bounds of `level`.
    pub fn load(&self, image_id: u32, level: MipLevel) -> Option<DiskThumbnail> {
        let path = self.path(image_id, level)?;
        let bytes = fs::read(&path).ok()?;

        let reject = |reason: &str| {
            tracing::warn!("⚠️  Discarding cached thumbnail {}: {}", path.display(), reason);
            let _ = fs::remove_file(&path);
            None
        };

        if !bytes.starts_with(&JPEG_MAGIC) {
            return reject("bad magic");
        }
        let decoded = match image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg) {
            Ok(img) => img.to_rgba8(),
            Err(e) => return reject(&format!("decode failed: {}", e)),
        };
        let (max_w, max_h) = level.max_size()?;
        if decoded.width() == 0 || decoded.height() == 0 || decoded.width() > max_w || decoded.height() > max_h {
            return reject("dimensions out of range");
        }

        Some(DiskThumbnail {
            width: decoded.width(),
            height: decoded.height(),
            pixels: decoded.into_raw(),
        })
    }

    /// Write an RGBA8 thumbnail unless a copy already exists.
    pub fn store(&self, image_id: u32, level: MipLevel, width: u32, height: u32, rgba: &[u8]) -> crate::Result<bool> {
        let Some(path) = self.path(image_id, level) else {
            return Ok(false);
        };
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rgb: Vec<u8> = rgba.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect();
        let Some(rgb) = RgbImage::from_raw(width, height, rgb) else {
            return Ok(false);
        };

        let result = fs::File::create(&path).map_err(crate::EngineError::from).and_then(|file| {
            let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), self.quality);
            encoder.encode_image(&rgb).map_err(crate::EngineError::from)
        });
        if let Err(e) = result {
            // Never leave a truncated file behind.
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(true)
    }

    pub fn remove(&self, image_id: u32, level: MipLevel) {
        if let Some(path) = self.path(image_id, level) {
            let _ = fs::remove_file(path);
        }
    }

    pub fn remove_all(&self, image_id: u32) {
        for level in MipLevel::THUMBNAILS {
            self.remove(image_id, level);
        }
    }

    /// Copy every serialized level of `from` to `to`.
    pub fn copy(&self, from: u32, to: u32) -> usize {
        let mut copied = 0;
        for level in MipLevel::THUMBNAILS {
            let (Some(src), Some(dst)) = (self.path(from, level), self.path(to, level)) else {
                continue;
            };
            if src.exists() && !dst.exists() && fs::copy(&src, &dst).is_ok() {
                copied += 1;
            }
        }
        copied
    }

    /// Delete files whose image id `keep` rejects, plus anything that is
    /// not a `<id>.jpg` file. Returns the number of deleted files.
    pub fn purge_orphans(&self, keep: impl Fn(u32) -> bool) -> usize {
        let Some(root) = &self.root else {
            return 0;
        };
        let mut removed = 0;
        for entry in WalkDir::new(root).min_depth(2).max_depth(2).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let id = path
                .extension()
                .filter(|ext| *ext == "jpg")
                .and_then(|_| path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok());
            let orphan = match id {
                Some(id) => !keep(id),
                None => true,
            };
            if orphan && fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("🧹 Purged {} orphaned thumbnails from {}", removed, root.display());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scratch_dir;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 255 / width) as u8, (y * 255 / height) as u8, 128, 255]);
            }
        }
        data
    }

    #[test]
    fn test_root_name_per_catalog() {
        assert_eq!(DiskCache::root_name(None), MEMORY_ROOT_NAME);
        let a = DiskCache::root_name(Some(Path::new("/tmp/a/library.db")));
        let b = DiskCache::root_name(Some(Path::new("/tmp/b/library.db")));
        assert!(a.starts_with("mipmaps-"));
        assert_ne!(a, b);
        assert_eq!(a, DiskCache::root_name(Some(Path::new("/tmp/a/library.db"))));
    }

    #[test]
    fn test_path_layout() {
        let cache = DiskCache::new(Path::new("/cache"), None, true, 90);
        assert_eq!(
            cache.path(42, MipLevel::Thumb256),
            Some(PathBuf::from("/cache/mipmaps-memory.d/1/42.jpg"))
        );
        assert_eq!(cache.path(42, MipLevel::Preview), None);
        assert_eq!(DiskCache::disabled().path(42, MipLevel::Thumb256), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = scratch_dir("disk-store");
        let cache = DiskCache::new(&dir, None, true, 95);
        let pixels = gradient(64, 32);
        assert!(cache.store(7, MipLevel::Thumb128, 64, 32, &pixels).unwrap());
        // Existing files are not rewritten.
        assert!(!cache.store(7, MipLevel::Thumb128, 64, 32, &pixels).unwrap());

        let loaded = cache.load(7, MipLevel::Thumb128).unwrap();
        assert_eq!((loaded.width, loaded.height), (64, 32));
        let diff = (loaded.pixels[4 * 40] as i32 - pixels[4 * 40] as i32).abs();
        assert!(diff < 16, "JPEG drift too large: {}", diff);
    }

    #[test]
    fn test_load_rejects_oversized_and_corrupt() {
        let dir = scratch_dir("disk-reject");
        let cache = DiskCache::new(&dir, None, true, 90);

        // A 256-wide image stored in the 128 slot is out of bounds.
        let path = cache.path(1, MipLevel::Thumb128).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(256, 16, image::Rgb([200, 100, 50]))
            .save_with_format(&path, ImageFormat::Jpeg)
            .unwrap();
        assert!(cache.load(1, MipLevel::Thumb128).is_none());
        assert!(!path.exists());

        let corrupt = cache.path(2, MipLevel::Thumb128).unwrap();
        fs::write(&corrupt, [0xFF, 0xD8, 0xFF, 0x00, 0x01]).unwrap();
        assert!(cache.load(2, MipLevel::Thumb128).is_none());
        assert!(!corrupt.exists());
    }

    #[test]
    fn test_purge_orphans() {
        let dir = scratch_dir("disk-purge");
        let cache = DiskCache::new(&dir, None, true, 90);
        let pixels = gradient(8, 8);
        cache.store(1, MipLevel::Thumb128, 8, 8, &pixels).unwrap();
        cache.store(2, MipLevel::Thumb128, 8, 8, &pixels).unwrap();
        cache.store(2, MipLevel::Thumb256, 8, 8, &pixels).unwrap();

        assert_eq!(cache.purge_orphans(|id| id == 1), 2);
        assert!(cache.exists(1, MipLevel::Thumb128));
        assert!(!cache.exists(2, MipLevel::Thumb256));
    }
}
