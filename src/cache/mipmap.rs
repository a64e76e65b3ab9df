//! Mipmap cache
//!
//! Produces a pixel buffer for `(image id, level)` on demand. Three bounded
//! caches back it:
//! - thumbnail levels, costed by byte size and written back to disk on
//!   eviction,
//! - the float preview level and the full level, costed 1 each so their
//!   quota is a slot count.
//!
//! A buffer is generated at most once per key: the generation runs inside
//! the bounded cache's allocate callback under the entry's write lock.
//! Failures never surface to callers; they get the dead-image placeholder.

use super::bounded::{Access, BoundedCache, CacheCallbacks, CacheEntry, CacheGuard};
use super::descriptor::{BufferFlags, MipBuffer, MipLevel, PixelData, PixelFormat, PREVIEW_MAX_SIZE};
use super::disk::DiskCache;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::develop::export;
use crate::develop::history::{HistoryStack, HistoryStatus};
use crate::jobs::JobKey;
use crate::raw::demosaic::half_size;
use crate::raw::downsample::{fit_within, orient, resize_rgba8, resize_rgba_f32};
use crate::raw::thumbnail::{load_embedded_thumbnail, maker_has_reliable_preview};
use crate::raw::{self, CfaPattern};
use crate::state::{ImageRecord, WriteMode};
use image::RgbaImage;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// How `acquire` behaves when the buffer is not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Generate synchronously; always returns a buffer (possibly dead).
    Blocking,
    /// Return only what is resident and unlocked right now.
    TestOnly,
    /// Return the nearest resident level, queueing a fetch of the
    /// requested one when it is missing.
    BestEffort,
    /// Queue a background fetch and return nothing.
    Prefetch,
}

/// Cache key: image id in the high bits, level index in the low nibble.
pub fn cache_key(image_id: u32, level: MipLevel) -> u64 {
    (u64::from(image_id) << 4) | u64::from(level.index())
}

fn split_key(key: u64) -> (u32, MipLevel) {
    ((key >> 4) as u32, MipLevel::from_index((key & 0xF) as u32).unwrap_or(MipLevel::Full))
}

/// A locked buffer. The lock is released when the handle is dropped.
pub struct MipmapHandle {
    image_id: u32,
    requested: MipLevel,
    level: MipLevel,
    guard: Option<CacheGuard<MipBuffer>>,
}

impl MipmapHandle {
    fn empty(image_id: u32, requested: MipLevel) -> Self {
        MipmapHandle {
            image_id,
            requested,
            level: requested,
            guard: None,
        }
    }

    fn locked(image_id: u32, requested: MipLevel, level: MipLevel, guard: CacheGuard<MipBuffer>) -> Self {
        MipmapHandle {
            image_id,
            requested,
            level,
            guard: Some(guard),
        }
    }

    pub fn image_id(&self) -> u32 {
        self.image_id
    }

    pub fn requested_level(&self) -> MipLevel {
        self.requested
    }

    /// Level of the buffer actually held; differs from the requested one
    /// for best-effort stand-ins.
    pub fn level(&self) -> MipLevel {
        self.level
    }

    pub fn buffer(&self) -> Option<&MipBuffer> {
        self.guard.as_deref().map(|entry| &entry.data)
    }

    /// Mutable buffer, only for handles acquired with `Access::Write`.
    pub fn buffer_mut(&mut self) -> Option<&mut MipBuffer> {
        self.guard.as_mut()?.entry_mut().map(|entry| &mut entry.data)
    }

    pub fn is_valid(&self) -> bool {
        self.buffer().map(MipBuffer::is_populated).unwrap_or(false)
    }

    pub fn is_dead(&self) -> bool {
        self.buffer().map(MipBuffer::is_dead).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    near_matches: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    standins: AtomicU64,
    disk_loads: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MipmapStats {
    pub requests: u64,
    /// Best-effort requests whose exact level was missing
    pub near_matches: u64,
    /// Requests that returned no buffer
    pub misses: u64,
    /// Buffers generated (allocate callback runs)
    pub fetches: u64,
    /// Best-effort requests answered with another level
    pub standins: u64,
    /// Thumbnails loaded back from disk
    pub disk_loads: u64,
    pub thumbnail_cost: u64,
    pub thumbnail_quota: u64,
    pub preview_slots: usize,
    pub full_slots: usize,
}

pub struct MipmapCache {
    thumbs: BoundedCache<MipBuffer>,
    preview: BoundedCache<MipBuffer>,
    full: BoundedCache<MipBuffer>,
    disk: Arc<DiskCache>,
    counters: Arc<Counters>,
    ctx: Weak<Context>,
}

impl MipmapCache {
    pub fn new(config: &EngineConfig, catalog_path: Option<&Path>, ctx: Weak<Context>) -> Self {
        let disk = Arc::new(DiskCache::new(
            &config.resolved_cache_dir(),
            catalog_path,
            config.disk_backend,
            config.cache_quality(),
        ));
        let counters = Arc::new(Counters::default());

        let thumbs = BoundedCache::new(
            "thumbnails",
            config.thumbnail_quota(),
            Box::new(ThumbnailSource {
                ctx: ctx.clone(),
                disk: Arc::clone(&disk),
                counters: Arc::clone(&counters),
            }),
        );
        let preview = BoundedCache::new(
            "preview",
            config.slot_quota(),
            Box::new(SlotSource {
                ctx: ctx.clone(),
                counters: Arc::clone(&counters),
            }),
        );
        let full = BoundedCache::new(
            "full",
            config.slot_quota(),
            Box::new(SlotSource {
                ctx: ctx.clone(),
                counters: Arc::clone(&counters),
            }),
        );

        MipmapCache {
            thumbs,
            preview,
            full,
            disk,
            counters,
            ctx,
        }
    }

    fn cache_for(&self, level: MipLevel) -> &BoundedCache<MipBuffer> {
        match level {
            MipLevel::Preview => &self.preview,
            MipLevel::Full => &self.full,
            _ => &self.thumbs,
        }
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Lock the buffer for `(image_id, level)`.
    ///
    /// Release by dropping the handle. Never call this for a key the same
    /// thread already holds with a conflicting lock.
    pub fn acquire(&self, image_id: u32, level: MipLevel, mode: AcquireMode, access: Access) -> MipmapHandle {
        bump(&self.counters.requests);
        let cache = self.cache_for(level);
        let key = cache_key(image_id, level);

        match mode {
            AcquireMode::Blocking => MipmapHandle::locked(image_id, level, level, cache.get(key, access)),
            AcquireMode::TestOnly => match cache.test_get(key, access) {
                Some(guard) if guard.data.is_populated() => MipmapHandle::locked(image_id, level, level, guard),
                _ => {
                    bump(&self.counters.misses);
                    MipmapHandle::empty(image_id, level)
                }
            },
            AcquireMode::Prefetch => {
                self.prefetch(image_id, level);
                MipmapHandle::empty(image_id, level)
            }
            AcquireMode::BestEffort if level.is_thumbnail() => self.best_effort(image_id, level, access),
            AcquireMode::BestEffort => match cache.test_get(key, access) {
                Some(guard) if guard.data.is_populated() => MipmapHandle::locked(image_id, level, level, guard),
                _ => {
                    bump(&self.counters.misses);
                    self.prefetch(image_id, level);
                    MipmapHandle::empty(image_id, level)
                }
            },
        }
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(&self, handle: MipmapHandle) {
        drop(handle);
    }

    /// Search smaller levels first (only the requested one may queue a
    /// fetch), then larger ones without fetching.
    fn best_effort(&self, image_id: u32, level: MipLevel, access: Access) -> MipmapHandle {
        let lower = MipLevel::THUMBNAILS.iter().rev().filter(|k| **k <= level);
        for &k in lower {
            if let Some(guard) = self.resident(image_id, k, access) {
                if k != level {
                    bump(&self.counters.standins);
                }
                return MipmapHandle::locked(image_id, level, k, guard);
            }
            if k == level {
                bump(&self.counters.near_matches);
                self.prefetch(image_id, level);
            }
        }

        for &k in MipLevel::THUMBNAILS.iter().filter(|k| **k > level) {
            if let Some(guard) = self.resident(image_id, k, access) {
                bump(&self.counters.standins);
                return MipmapHandle::locked(image_id, level, k, guard);
            }
        }

        bump(&self.counters.misses);
        MipmapHandle::empty(image_id, level)
    }

    fn resident(&self, image_id: u32, level: MipLevel, access: Access) -> Option<CacheGuard<MipBuffer>> {
        self.cache_for(level)
            .test_get(cache_key(image_id, level), access)
            .filter(|guard| guard.data.is_populated())
    }

    pub fn is_resident(&self, image_id: u32, level: MipLevel) -> bool {
        self.cache_for(level).contains(cache_key(image_id, level))
    }

    /// Queue background generation of a buffer that is not resident yet.
    pub fn prefetch(&self, image_id: u32, level: MipLevel) {
        if self.is_resident(image_id, level) {
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let weak = self.ctx.clone();
        let queued = ctx.jobs().submit(Some(JobKey::Mipmap { image_id, level }), move || {
            if let Some(ctx) = weak.upgrade() {
                let handle = ctx.mipmaps().acquire(image_id, level, AcquireMode::Blocking, Access::Read);
                tracing::debug!("📸 Prefetched {} for image {}", handle.level(), image_id);
            }
        });
        if queued {
            tracing::debug!("📸 Queued {} fetch for image {}", level, image_id);
        }
    }

    /// Drop every thumbnail of an image as known-wrong: nothing is written
    /// back and existing disk copies are deleted. Preview and full buffers
    /// depend only on the source file and stay.
    pub fn invalidate(&self, image_id: u32) {
        for level in MipLevel::THUMBNAILS {
            self.thumbs
                .remove_with(cache_key(image_id, level), |buffer| buffer.desc.flags.insert(BufferFlags::INVALIDATE));
        }
        self.disk.remove_all(image_id);
        tracing::debug!("🧹 Invalidated thumbnails of image {}", image_id);
    }

    /// Ordinary removal of every resident level; thumbnails are written
    /// back to disk.
    pub fn evict(&self, image_id: u32) {
        for level in MipLevel::ALL {
            self.cache_for(level).remove(cache_key(image_id, level));
        }
    }

    /// Nearest thumbnail level by L1 distance of the bounds, preferring
    /// larger levels over smaller ones at the same distance.
    pub fn matching_level(&self, width: u32, height: u32) -> MipLevel {
        matching_level(width, height)
    }

    /// Give `to` the thumbnails of `from` through the disk layer. Returns
    /// the number of copied files.
    pub fn copy_thumbnails(&self, from: u32, to: u32) -> usize {
        for level in MipLevel::THUMBNAILS {
            let Some(guard) = self.resident(from, level, Access::Read) else {
                continue;
            };
            let buffer = &guard.data;
            if buffer.is_dead() {
                continue;
            }
            if let Some(rgba) = buffer.rgba8() {
                if let Err(e) = self.disk.store(from, level, buffer.width(), buffer.height(), rgba) {
                    tracing::warn!("⚠️  Failed to write {} of image {}: {}", level, from, e);
                }
            }
        }
        self.invalidate(to);
        self.disk.copy(from, to)
    }

    /// Delete disk thumbnails of images `keep` rejects.
    pub fn purge_orphans(&self, keep: impl Fn(u32) -> bool) -> usize {
        self.disk.purge_orphans(keep)
    }

    /// Evict unlocked thumbnails down to `fill_ratio` of the quota.
    pub fn gc(&self, fill_ratio: f64) -> usize {
        self.thumbs.gc(fill_ratio)
    }

    pub fn stats(&self) -> MipmapStats {
        let c = &self.counters;
        MipmapStats {
            requests: c.requests.load(Ordering::Relaxed),
            near_matches: c.near_matches.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            standins: c.standins.load(Ordering::Relaxed),
            disk_loads: c.disk_loads.load(Ordering::Relaxed),
            thumbnail_cost: self.thumbs.cost(),
            thumbnail_quota: self.thumbs.quota(),
            preview_slots: self.preview.len(),
            full_slots: self.full.len(),
        }
    }

    pub fn print_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            "📊 Mipmap cache: {:.1}/{:.1} MiB thumbnails, {} preview, {} full",
            stats.thumbnail_cost as f64 / (1024.0 * 1024.0),
            stats.thumbnail_quota as f64 / (1024.0 * 1024.0),
            stats.preview_slots,
            stats.full_slots,
        );
        tracing::info!(
            "📊 {} requests, {} near matches, {} misses, {} fetches, {} stand-ins, {} disk loads",
            stats.requests,
            stats.near_matches,
            stats.misses,
            stats.fetches,
            stats.standins,
            stats.disk_loads,
        );
    }

    /// Largest resident thumbnail above `level`, downsampled to its bounds.
    fn downsample_from_larger(&self, image_id: u32, level: MipLevel) -> Option<RgbaImage> {
        let (max_w, max_h) = level.max_size()?;
        for &larger in MipLevel::THUMBNAILS.iter().filter(|k| **k > level) {
            let Some(guard) = self.resident(image_id, larger, Access::Read) else {
                continue;
            };
            let buffer = &guard.data;
            if buffer.is_dead() {
                continue;
            }
            let Some(rgba) = buffer.rgba8() else {
                continue;
            };
            let Some(source) = RgbaImage::from_raw(buffer.width(), buffer.height(), rgba.to_vec()) else {
                continue;
            };
            drop(guard);
            let (w, h) = fit_within(source.width(), source.height(), max_w, max_h);
            tracing::debug!("📸 {} of image {} downsampled from {}", level, image_id, larger);
            return Some(resize_rgba8(&source, w, h));
        }
        None
    }
}

/// See [`MipmapCache::matching_level`].
pub fn matching_level(width: u32, height: u32) -> MipLevel {
    let mut best = MipLevel::Thumb128;
    let mut error = i64::MAX;
    for level in MipLevel::THUMBNAILS {
        let Some((max_w, max_h)) = level.max_size() else {
            continue;
        };
        let new_error = max_w as i64 + max_h as i64 - width as i64 - height as i64;
        if new_error.abs() < error.abs() || (error < 0 && new_error > 0) {
            best = level;
            error = new_error;
        }
    }
    best
}

/// Copy `pixels` into the buffer's own allocation; dead image when the
/// allocation fails.
fn fill_rgba8(buffer: &mut MipBuffer, level: MipLevel, width: u32, height: u32, pixels: &[u8]) {
    if buffer.reserve(width, height, PixelFormat::Rgba8).is_err() {
        tracing::warn!("⚠️  Out of memory for {}x{} {}", width, height, level);
        buffer.set_dead(level);
        return;
    }
    if let PixelData::Rgba8(dst) = &mut buffer.pixels {
        dst.copy_from_slice(pixels);
    }
    buffer.desc.flags.remove(BufferFlags::GENERATE);
}

fn iscale_for(record: Option<&ImageRecord>, width: u32) -> f32 {
    match record {
        Some(record) if record.width > 0 && width > 0 => record.oriented_size().0 as f32 / width as f32,
        _ => 1.0,
    }
}

struct ThumbnailSource {
    ctx: Weak<Context>,
    disk: Arc<DiskCache>,
    counters: Arc<Counters>,
}

impl CacheCallbacks<MipBuffer> for ThumbnailSource {
    fn allocate(&self, key: u64, entry: &mut CacheEntry<MipBuffer>) {
        let (image_id, level) = split_key(key);
        bump(&self.counters.fetches);
        entry.cost = level.thumbnail_cost();
        entry.data = MipBuffer::pending();

        let ctx = self.ctx.upgrade();
        let record = ctx.as_ref().and_then(|ctx| ctx.images().read(image_id).ok());

        if let Some(thumb) = self.disk.load(image_id, level) {
            bump(&self.counters.disk_loads);
            fill_rgba8(&mut entry.data, level, thumb.width, thumb.height, &thumb.pixels);
            entry.data.desc.iscale = iscale_for(record.as_ref(), thumb.width);
            tracing::debug!("📸 {} of image {} loaded from disk", level, image_id);
            return;
        }

        let generated = match (&ctx, &record) {
            (Some(ctx), Some(record)) => generate_thumbnail(ctx, record, level),
            _ => None,
        };
        match generated {
            Some(image) => {
                let (width, height) = image.dimensions();
                fill_rgba8(&mut entry.data, level, width, height, image.as_raw());
                // Generation may have decoded the source and learned its size.
                let record = ctx.as_ref().and_then(|ctx| ctx.images().read(image_id).ok());
                entry.data.desc.iscale = iscale_for(record.as_ref(), width);
            }
            None => {
                tracing::warn!("⚠️  Could not generate {} for image {}, using placeholder", level, image_id);
                entry.data.set_dead(level);
            }
        }
    }

    fn cleanup(&self, key: u64, entry: &mut CacheEntry<MipBuffer>) {
        let (image_id, level) = split_key(key);
        let buffer = &entry.data;
        if buffer.desc.flags.contains(BufferFlags::INVALIDATE) {
            self.disk.remove(image_id, level);
        } else if buffer.is_populated() && !buffer.is_dead() {
            if let Some(rgba) = buffer.rgba8() {
                if let Err(e) = self.disk.store(image_id, level, buffer.width(), buffer.height(), rgba) {
                    tracing::warn!("⚠️  Failed to write back {} of image {}: {}", level, image_id, e);
                }
            }
        }
        entry.data.clear();
    }
}

/// Embedded JPEG, then a larger resident level, then a reduced export.
fn generate_thumbnail(ctx: &Context, record: &ImageRecord, level: MipLevel) -> Option<RgbaImage> {
    let (max_w, max_h) = level.max_size()?;

    if let Some(image) = embedded_thumbnail(ctx, record, level) {
        return Some(image);
    }
    if let Some(image) = ctx.mipmaps().downsample_from_larger(record.id, level) {
        return Some(image);
    }

    let items = match ctx.catalog().history(record.id) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!("⚠️  Failed to read history of image {}: {}", record.id, e);
            return None;
        }
    };
    let history = HistoryStack::from_items(items, record.history_end as usize);
    match export::render(ctx, record.id, max_w, max_h, &history) {
        Ok(rendered) => {
            tracing::debug!("📸 {} of image {} rendered through the pipeline", level, record.id);
            rendered.into_rgba_image()
        }
        Err(e) => {
            tracing::warn!("⚠️  Thumbnail export failed for image {}: {}", record.id, e);
            None
        }
    }
}

fn embedded_thumbnail(ctx: &Context, record: &ImageRecord, level: MipLevel) -> Option<RgbaImage> {
    if level > ctx.config().embedded_thumbnail_max_level || !maker_has_reliable_preview(&record.maker) {
        return None;
    }
    let status = match ctx.catalog().history_hash(record.id) {
        Ok(Some(hash)) => hash.status(),
        Ok(None) if record.history_end == 0 => HistoryStatus::Basic,
        _ => HistoryStatus::Altered,
    };
    if status == HistoryStatus::Altered {
        return None;
    }

    let (max_w, max_h) = level.max_size()?;
    let embedded = load_embedded_thumbnail(&record.path)?;
    let (w, h) = (embedded.width() as usize, embedded.height() as usize);
    let (pixels, w, h) = orient(embedded.as_raw(), w, h, 4, record.orientation);
    let embedded = RgbaImage::from_raw(w as u32, h as u32, pixels)?;

    let (img_w, img_h) = record.oriented_size();
    let (w, h) = embedded.dimensions();
    if embedded_too_small((w, h), (max_w, max_h), (img_w, img_h)) {
        tracing::debug!("📸 Embedded preview of image {} too small for {} ({}x{})", record.id, level, w, h);
        return None;
    }
    let (tw, th) = fit_within(w, h, max_w, max_h);
    Some(resize_rgba8(&embedded, tw, th))
}

/// An embedded preview is rejected when it is smaller than the level in
/// both dimensions and also clearly smaller than the image in both.
fn embedded_too_small((w, h): (u32, u32), (max_w, max_h): (u32, u32), (img_w, img_h): (u32, u32)) -> bool {
    (w < max_w && h < max_h) && (w + 4 < img_w && h + 4 < img_h)
}

/// Allocate callbacks for the preview and full levels.
struct SlotSource {
    ctx: Weak<Context>,
    counters: Arc<Counters>,
}

impl CacheCallbacks<MipBuffer> for SlotSource {
    fn allocate(&self, key: u64, entry: &mut CacheEntry<MipBuffer>) {
        let (image_id, level) = split_key(key);
        bump(&self.counters.fetches);
        entry.cost = 1;
        entry.data = MipBuffer::pending();

        let Some(ctx) = self.ctx.upgrade() else {
            entry.data.set_dead(level);
            return;
        };
        let ok = match level {
            MipLevel::Full => load_full(&ctx, image_id, &mut entry.data),
            _ => load_preview(&ctx, image_id, &mut entry.data),
        };
        if !ok {
            entry.data.set_dead(level);
        }
    }
}

fn load_full(ctx: &Context, image_id: u32, buffer: &mut MipBuffer) -> bool {
    let record = match ctx.images().read(image_id) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("⚠️  Image {} unavailable: {}", image_id, e);
            return false;
        }
    };
    let decoded = match raw::decode(&record.path) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!("⚠️  {}", e);
            return false;
        }
    };

    buffer.set_float(decoded.width, decoded.height, decoded.format, decoded.pixels);
    buffer.desc.iscale = 1.0;
    buffer.desc.flags = BufferFlags::NONE;

    let updated = ctx.images().update(image_id, WriteMode::Safe, |record| {
        record.width = decoded.width;
        record.height = decoded.height;
        record.orientation = decoded.orientation;
        record.wb_coeffs = decoded.wb_coeffs;
        record.color_matrix = decoded.color_matrix;
        record.cfa = decoded.cfa;
        record.maker = decoded.maker;
        record.model = decoded.model;
    });
    if let Err(e) = updated {
        tracing::warn!("⚠️  Failed to store metadata of image {}: {}", image_id, e);
    }
    tracing::debug!("📷 Decoded image {} ({}x{})", image_id, decoded.width, decoded.height);
    true
}

fn load_preview(ctx: &Context, image_id: u32, buffer: &mut MipBuffer) -> bool {
    let full = ctx.mipmaps().acquire(image_id, MipLevel::Full, AcquireMode::Blocking, Access::Read);
    let Some(source) = full.buffer().filter(|b| b.is_populated() && !b.is_dead()) else {
        return false;
    };
    let Some(pixels) = source.float() else {
        return false;
    };
    let (fw, fh) = (source.width() as usize, source.height() as usize);

    let (rgba, hw, hh) = match source.desc.format {
        PixelFormat::MosaicF32 => {
            let cfa = ctx
                .images()
                .read(image_id)
                .ok()
                .and_then(|record| record.cfa)
                .unwrap_or(CfaPattern::RGGB);
            // White balance is left to the pixelpipe input stage.
            half_size(pixels, fw, fh, cfa, [1.0; 4])
        }
        _ => (pixels.to_vec(), fw, fh),
    };
    drop(full);

    let (pw, ph) = fit_within(hw as u32, hh as u32, PREVIEW_MAX_SIZE, PREVIEW_MAX_SIZE);
    let data = resize_rgba_f32(&rgba, hw, hh, pw as usize, ph as usize);
    buffer.set_float(pw, ph, PixelFormat::RgbaF32, data);
    buffer.desc.iscale = fw as f32 / pw.max(1) as f32;
    buffer.desc.flags = BufferFlags::NONE;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEAD_IMAGE_SIZE;
    use crate::testing::TestEnv;
    use std::thread;

    #[test]
    fn test_cache_key_round_trip() {
        let key = cache_key(42, MipLevel::Thumb256);
        assert_eq!(key, (42 << 4) | 1);
        assert_eq!(split_key(key), (42, MipLevel::Thumb256));

        let high = cache_key(1 << 28, MipLevel::Thumb128);
        assert_ne!(high, cache_key(0, MipLevel::Thumb128));
        assert_eq!(split_key(high), (1 << 28, MipLevel::Thumb128));
        assert_eq!(split_key(cache_key(u32::MAX, MipLevel::Full)), (u32::MAX, MipLevel::Full));
    }

    #[test]
    fn test_embedded_size_check() {
        // Smaller than the level and the image in both dimensions.
        assert!(embedded_too_small((160, 120), (512, 512), (6000, 4000)));
        // Covers the image width; a letterboxed preview is still usable.
        assert!(!embedded_too_small((300, 120), (512, 512), (300, 200)));
        // Large enough for the level.
        assert!(!embedded_too_small((512, 340), (512, 512), (6000, 4000)));
        assert!(!embedded_too_small((1600, 1067), (512, 512), (6000, 4000)));
    }

    #[test]
    fn test_matching_level() {
        assert_eq!(matching_level(100, 100), MipLevel::Thumb128);
        assert_eq!(matching_level(256, 256), MipLevel::Thumb256);
        assert_eq!(matching_level(300, 200), MipLevel::Thumb256);
        // Exactly between 256 and 512 in L1: the larger level wins
        assert_eq!(matching_level(384, 384), MipLevel::Thumb512);
        assert_eq!(matching_level(1920, 1080), MipLevel::Thumb2048);
        assert_eq!(matching_level(10000, 10000), MipLevel::Thumb4096);
    }

    #[test]
    fn test_blocking_generates_bounded_thumbnail() {
        let env = TestEnv::new("mip-blocking");
        let id = env.import_png("a.png", 600, 400, [200, 100, 50]);
        let mipmaps = env.ctx.mipmaps();

        let handle = mipmaps.acquire(id, MipLevel::Thumb256, AcquireMode::Blocking, Access::Read);
        let buffer = handle.buffer().unwrap();
        assert!(handle.is_valid());
        assert!(!handle.is_dead());
        assert_eq!((buffer.width(), buffer.height()), (256, 171));
        assert!((buffer.desc.iscale - 600.0 / 256.0).abs() < 1e-3);
        drop(handle);

        // Generated once, through the full level
        assert!(mipmaps.is_resident(id, MipLevel::Full));
        let record = env.ctx.images().read(id).unwrap();
        assert_eq!((record.width, record.height), (600, 400));
    }

    #[test]
    fn test_test_only_never_generates() {
        let env = TestEnv::new("mip-testonly");
        let id = env.import_png("a.png", 64, 64, [1, 2, 3]);
        let mipmaps = env.ctx.mipmaps();

        let handle = mipmaps.acquire(id, MipLevel::Thumb128, AcquireMode::TestOnly, Access::Read);
        assert!(handle.buffer().is_none());
        drop(handle);
        assert!(!mipmaps.is_resident(id, MipLevel::Thumb128));
        assert_eq!(mipmaps.stats().fetches, 0);
        assert_eq!(mipmaps.stats().misses, 1);
    }

    #[test]
    fn test_concurrent_blocking_generates_once() {
        let env = TestEnv::new("mip-concurrent");
        let id = env.import_png("a.png", 300, 200, [10, 20, 30]);
        let ctx = env.ctx.clone();

        let results: Vec<Vec<u8>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let ctx = ctx.clone();
                    scope.spawn(move || {
                        let handle = ctx.mipmaps().acquire(id, MipLevel::Thumb128, AcquireMode::Blocking, Access::Read);
                        handle.buffer().and_then(|b| b.rgba8()).unwrap().to_vec()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        // One thumbnail generation plus the full decode it needed
        assert_eq!(ctx.mipmaps().stats().fetches, 2);
    }

    #[test]
    fn test_missing_source_yields_dead_image() {
        let env = TestEnv::new("mip-dead");
        let id = env.library.import_image(&env.dir.join("missing.nef")).unwrap();
        let mipmaps = env.ctx.mipmaps();

        let handle = mipmaps.acquire(id, MipLevel::Thumb512, AcquireMode::Blocking, Access::Read);
        assert!(handle.is_dead());
        assert_eq!(handle.buffer().unwrap().width(), DEAD_IMAGE_SIZE);
        drop(handle);

        let full = mipmaps.acquire(id, MipLevel::Full, AcquireMode::Blocking, Access::Read);
        assert!(full.is_dead());
        assert!(full.buffer().unwrap().float().is_some());
        drop(full);

        // Dead buffers are never written back
        mipmaps.evict(id);
        assert!(!mipmaps.disk().exists(id, MipLevel::Thumb512));
    }

    #[test]
    fn test_best_effort_scenario() {
        let env = TestEnv::new("mip-scenario");
        let id = env.import_png("a.png", 600, 400, [120, 60, 30]);
        let ctx = &env.ctx;
        let mipmaps = ctx.mipmaps();

        let handle = mipmaps.acquire(id, MipLevel::Thumb256, AcquireMode::BestEffort, Access::Read);
        assert!(handle.buffer().is_none());
        drop(handle);
        assert_eq!(mipmaps.stats().near_matches, 1);
        ctx.jobs().wait_idle();

        let handle = mipmaps.acquire(id, MipLevel::Thumb256, AcquireMode::Blocking, Access::Read);
        let original = handle.buffer().unwrap().clone();
        assert_eq!(original.width(), 256);
        drop(handle);

        mipmaps.evict(id);
        assert!(mipmaps.disk().exists(id, MipLevel::Thumb256));
        let loads = mipmaps.stats().disk_loads;

        let handle = mipmaps.acquire(id, MipLevel::Thumb256, AcquireMode::Blocking, Access::Read);
        let reloaded = handle.buffer().unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (original.width(), original.height()));
        let (a, b) = (original.rgba8().unwrap(), reloaded.rgba8().unwrap());
        let max_diff = a.iter().zip(b).map(|(x, y)| (*x as i32 - *y as i32).abs()).max().unwrap();
        assert!(max_diff <= 8, "JPEG round trip drifted by {}", max_diff);
        drop(handle);

        assert_eq!(mipmaps.stats().disk_loads, loads + 1);
        // Came from disk: the source was not decoded again
        assert!(!mipmaps.is_resident(id, MipLevel::Full));
    }

    #[test]
    fn test_best_effort_prefers_smaller_then_larger() {
        let env = TestEnv::new("mip-standin");
        let id = env.import_png("a.png", 1200, 800, [0, 0, 255]);
        let mipmaps = env.ctx.mipmaps();

        drop(mipmaps.acquire(id, MipLevel::Thumb1024, AcquireMode::Blocking, Access::Read));
        let handle = mipmaps.acquire(id, MipLevel::Thumb256, AcquireMode::BestEffort, Access::Read);
        assert_eq!(handle.level(), MipLevel::Thumb1024);
        assert_eq!(handle.requested_level(), MipLevel::Thumb256);
        drop(handle);
        env.ctx.jobs().wait_idle();

        drop(mipmaps.acquire(id, MipLevel::Thumb128, AcquireMode::Blocking, Access::Read));
        let handle = mipmaps.acquire(id, MipLevel::Thumb512, AcquireMode::BestEffort, Access::Read);
        // 256 may have been prefetched meanwhile; either way a lower level wins
        assert!(handle.level() < MipLevel::Thumb512);
        drop(handle);
        assert!(mipmaps.stats().standins >= 2);
    }

    #[test]
    fn test_invalidate_deletes_disk_copy() {
        let env = TestEnv::new("mip-invalidate");
        let id = env.import_png("a.png", 300, 300, [9, 9, 9]);
        let mipmaps = env.ctx.mipmaps();

        drop(mipmaps.acquire(id, MipLevel::Thumb128, AcquireMode::Blocking, Access::Read));
        mipmaps.evict(id);
        assert!(mipmaps.disk().exists(id, MipLevel::Thumb128));

        drop(mipmaps.acquire(id, MipLevel::Thumb128, AcquireMode::Blocking, Access::Read));
        mipmaps.invalidate(id);
        assert!(!mipmaps.is_resident(id, MipLevel::Thumb128));
        assert!(!mipmaps.disk().exists(id, MipLevel::Thumb128));
    }

    #[test]
    fn test_preview_level() {
        let env = TestEnv::new("mip-preview");
        let id = env.import_png("a.png", 3000, 1000, [255, 255, 255]);
        let mipmaps = env.ctx.mipmaps();

        let handle = mipmaps.acquire(id, MipLevel::Preview, AcquireMode::Blocking, Access::Read);
        let buffer = handle.buffer().unwrap();
        assert_eq!(buffer.desc.format, PixelFormat::RgbaF32);
        assert_eq!((buffer.width(), buffer.height()), (1280, 427));
        assert!((buffer.desc.iscale - 3000.0 / 1280.0).abs() < 1e-3);
        assert!(buffer.float().unwrap().iter().all(|v| (*v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_copy_thumbnails() {
        let env = TestEnv::new("mip-copy");
        let from = env.import_png("a.png", 200, 100, [50, 50, 50]);
        let to = env.import_png("b.png", 200, 100, [250, 0, 0]);
        let mipmaps = env.ctx.mipmaps();

        drop(mipmaps.acquire(from, MipLevel::Thumb128, AcquireMode::Blocking, Access::Read));
        assert_eq!(mipmaps.copy_thumbnails(from, to), 1);
        assert!(mipmaps.disk().exists(to, MipLevel::Thumb128));
        assert_eq!(mipmaps.purge_orphans(|id| id == from), 1);
        assert!(!mipmaps.disk().exists(to, MipLevel::Thumb128));
    }
}
