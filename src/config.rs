//! Engine configuration
//!
//! Stored as JSON in the user's config directory:
//! - Linux: ~/.config/raw-develop/engine.json
//! - macOS: ~/Library/Application Support/raw-develop/engine.json
//! - Windows: %APPDATA%\raw-develop\engine.json
//!
//! Every field has a default, so a partial file (or no file) is valid.

use crate::cache::MipLevel;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;
const MIN_MIPMAP_MEMORY: u64 = 100 * MIB;
const MAX_MIPMAP_MEMORY: u64 = 8 * 1024 * MIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the thumbnail disk cache. `None` uses the
    /// platform cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Byte budget for thumbnail levels
    pub mipmap_memory: u64,

    /// Background worker threads
    pub worker_threads: usize,

    /// Write evicted thumbnails to disk and load them back on a miss
    pub disk_backend: bool,

    /// JPEG quality of disk thumbnails (10-100)
    pub cache_quality: u8,

    /// Largest thumbnail level that may come from the embedded JPEG
    pub embedded_thumbnail_max_level: MipLevel,

    /// Undo records kept per develop session
    pub undo_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_dir: None,
            mipmap_memory: 512 * MIB,
            worker_threads: 2,
            disk_backend: true,
            cache_quality: 90,
            embedded_thumbnail_max_level: MipLevel::Thumb512,
            undo_depth: 100,
        }
    }
}

impl EngineConfig {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!("⚙️  Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("raw-develop");
        path.push("engine.json");
        Some(path)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(EngineError::Config("worker_threads must be at least 1".into()));
        }
        if !self.embedded_thumbnail_max_level.is_thumbnail() {
            return Err(EngineError::Config(format!(
                "embedded_thumbnail_max_level must be a thumbnail level, got {}",
                self.embedded_thumbnail_max_level
            )));
        }
        Ok(())
    }

    /// Directory that holds the `<root>.d` thumbnail tree.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir)
                .join("raw-develop")
        })
    }

    /// Thumbnail byte quota, clamped to a sane range.
    pub fn thumbnail_quota(&self) -> u64 {
        self.mipmap_memory.clamp(MIN_MIPMAP_MEMORY, MAX_MIPMAP_MEMORY)
    }

    /// Slot count for the preview and full levels.
    pub fn slot_quota(&self) -> u64 {
        (2 * self.worker_threads.max(1)).next_power_of_two() as u64
    }

    pub fn cache_quality(&self) -> u8 {
        self.cache_quality.clamp(10, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scratch_dir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.thumbnail_quota(), 512 * MIB);
        assert_eq!(config.slot_quota(), 4);
        assert_eq!(config.cache_quality(), 90);
    }

    #[test]
    fn test_clamping() {
        let config = EngineConfig {
            mipmap_memory: 1,
            worker_threads: 3,
            cache_quality: 200,
            ..EngineConfig::default()
        };
        assert_eq!(config.thumbnail_quota(), MIN_MIPMAP_MEMORY);
        assert_eq!(config.slot_quota(), 8);
        assert_eq!(config.cache_quality(), 100);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = scratch_dir("config");
        let path = dir.join("engine.json");
        fs::write(&path, r#"{ "worker_threads": 4, "embedded_thumbnail_max_level": "thumb_1024" }"#).unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.embedded_thumbnail_max_level, MipLevel::Thumb1024);
        assert!(config.disk_backend);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = scratch_dir("config-save");
        let path = dir.join("nested").join("engine.json");
        let config = EngineConfig {
            cache_dir: Some(dir.clone()),
            undo_depth: 5,
            ..EngineConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = scratch_dir("config-invalid");
        let path = dir.join("engine.json");
        fs::write(&path, r#"{ "worker_threads": 0 }"#).unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(EngineError::Config(_))));

        fs::write(&path, r#"{ "embedded_thumbnail_max_level": "full" }"#).unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(EngineError::Config(_))));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(EngineError::Json(_))));
    }
}
