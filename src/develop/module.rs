//! Processing module interface
//!
//! Modules are stateless: everything they need comes in as an opaque,
//! versioned parameter blob. Built-in modules use `#[repr(C)]` Pod structs
//! for their parameters so the blob is just the struct's bytes.

use super::modules;
use crate::error::{EngineError, Result};
use bytemuck::Pod;
use std::sync::Arc;

/// Interleaved linear RGBA f32 image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RgbaBuffer {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl RgbaBuffer {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height * 4);
        RgbaBuffer { width, height, data }
    }

    pub fn filled(width: usize, height: usize, rgba: [f32; 4]) -> Self {
        let data = rgba.iter().copied().cycle().take(width * height * 4).collect();
        RgbaBuffer { width, height, data }
    }

    pub fn pixels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.data.chunks_exact_mut(4)
    }

    pub fn pixel(&self, x: usize, y: usize) -> [f32; 4] {
        let i = (y * self.width + x) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

pub trait ProcessingModule: Send + Sync {
    /// Operation name stored in history items
    fn name(&self) -> &'static str;

    /// Current parameter layout version
    fn version(&self) -> u32;

    fn params_size(&self) -> usize;

    fn default_params(&self) -> Vec<u8>;

    fn default_enabled(&self) -> bool {
        false
    }

    /// Convert parameters stored by an older version. `None` when the
    /// version is unknown or the blob is malformed.
    fn migrate(&self, _old_version: u32, _params: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Output size for an input of `width x height`.
    fn modify_dimensions(&self, _params: &[u8], width: usize, height: usize) -> (usize, usize) {
        (width, height)
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()>;
}

/// Read a Pod parameter struct from its byte blob.
pub fn decode_params<P: Pod>(module: &str, bytes: &[u8]) -> Result<P> {
    bytemuck::try_pod_read_unaligned(bytes).map_err(|_| EngineError::ParamsSize {
        module: module.to_string(),
        expected: std::mem::size_of::<P>(),
        actual: bytes.len(),
    })
}

pub fn encode_params<P: Pod>(params: &P) -> Vec<u8> {
    bytemuck::bytes_of(params).to_vec()
}

/// Installed modules, looked up by operation name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn ProcessingModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for module in modules::builtin() {
            registry.register(module);
        }
        registry
    }

    /// Install a module, replacing one with the same name.
    pub fn register(&mut self, module: Arc<dyn ProcessingModule>) {
        self.modules.retain(|m| m.name() != module.name());
        self.modules.push(module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessingModule>> {
        self.modules.iter().find(|m| m.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }
}
