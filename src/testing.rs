//! Shared fixtures for unit tests

use crate::config::EngineConfig;
use crate::context::Context;
use crate::state::Library;
use image::{ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A fresh, empty directory under the system temp dir.
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("raw-develop-{}-{}-{}", tag, std::process::id(), n));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub(crate) fn write_png(dir: &Path, name: &str, width: u32, height: u32, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb(rgb))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

pub(crate) fn write_jpeg(dir: &Path, name: &str, width: u32, height: u32, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb(rgb))
        .save_with_format(&path, ImageFormat::Jpeg)
        .unwrap();
    path
}

/// Horizontal grey ramp, black on the left and white on the right.
pub(crate) fn write_gradient_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    let image = RgbImage::from_fn(width, height, |x, _| {
        let v = (x * 255 / (width - 1).max(1)) as u8;
        Rgb([v, v, v])
    });
    image.save_with_format(&path, ImageFormat::Png).unwrap();
    path
}

pub(crate) fn test_config(cache_dir: &Path) -> EngineConfig {
    EngineConfig {
        cache_dir: Some(cache_dir.to_path_buf()),
        worker_threads: 2,
        ..EngineConfig::default()
    }
}

/// A context over an in-memory catalog with its disk cache in a scratch dir.
pub(crate) struct TestEnv {
    pub ctx: Arc<Context>,
    pub library: Arc<Library>,
    pub dir: PathBuf,
}

impl TestEnv {
    pub(crate) fn new(tag: &str) -> Self {
        Self::with_config(tag, |_| {})
    }

    pub(crate) fn with_config(tag: &str, adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = scratch_dir(tag);
        let mut config = test_config(&dir.join("cache"));
        adjust(&mut config);
        let library = Arc::new(Library::open_in_memory().unwrap());
        let ctx = Context::new(config, library.clone()).unwrap();
        TestEnv { ctx, library, dir }
    }

    /// Import a flat-colored PNG source.
    pub(crate) fn import_png(&self, name: &str, width: u32, height: u32, rgb: [u8; 3]) -> u32 {
        let path = write_png(&self.dir, name, width, height, rgb);
        self.library.import_image(&path).unwrap()
    }

    pub(crate) fn import_gradient(&self, name: &str, width: u32, height: u32) -> u32 {
        let path = write_gradient_png(&self.dir, name, width, height);
        self.library.import_image(&path).unwrap()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}
