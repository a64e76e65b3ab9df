//! Blending of a module's output over its input

use super::module::{decode_params, encode_params, RgbaBuffer};
use bytemuck::{Pod, Zeroable};

/// Layout version of [`BlendParams`].
pub const BLEND_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Normal,
    Multiply,
    Lighten,
    Darken,
}

impl BlendMode {
    pub fn from_u32(value: u32) -> Option<BlendMode> {
        match value {
            0 => Some(BlendMode::Normal),
            1 => Some(BlendMode::Multiply),
            2 => Some(BlendMode::Lighten),
            3 => Some(BlendMode::Darken),
            _ => None,
        }
    }

    fn combine(self, input: f32, output: f32) -> f32 {
        match self {
            BlendMode::Normal => output,
            BlendMode::Multiply => input * output,
            BlendMode::Lighten => input.max(output),
            BlendMode::Darken => input.min(output),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlendParams {
    /// 0.0 (input only) to 1.0 (module output only)
    pub opacity: f32,
    pub mode: u32,
}

impl Default for BlendParams {
    fn default() -> Self {
        BlendParams {
            opacity: 1.0,
            mode: 0,
        }
    }
}

impl BlendParams {
    /// Decode stored blend bytes. Empty bytes mean opaque normal blending;
    /// unknown versions and malformed blobs are ignored the same way.
    pub fn from_stored(bytes: &[u8], version: u32) -> Option<BlendParams> {
        if bytes.is_empty() {
            return None;
        }
        if version != BLEND_VERSION {
            tracing::warn!("⚠️  Ignoring blend parameters of unknown version {}", version);
            return None;
        }
        let params: BlendParams = decode_params("blend", bytes).ok()?;
        BlendMode::from_u32(params.mode)?;
        Some(params)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_params(self)
    }

    pub fn mode(&self) -> BlendMode {
        BlendMode::from_u32(self.mode).unwrap_or(BlendMode::Normal)
    }

    /// True when blending leaves the module output untouched.
    pub fn is_passthrough(&self) -> bool {
        self.mode() == BlendMode::Normal && self.opacity >= 1.0
    }
}

/// Mix `output` with `input` in place. Alpha is taken from the output.
/// Buffers of different sizes (geometry-changing modules) are left alone.
pub fn blend(input: &RgbaBuffer, output: &mut RgbaBuffer, params: &BlendParams) {
    if params.is_passthrough() || input.width != output.width || input.height != output.height {
        return;
    }
    let mode = params.mode();
    let opacity = params.opacity.clamp(0.0, 1.0);
    for (src, dst) in input.data.chunks_exact(4).zip(output.data.chunks_exact_mut(4)) {
        for c in 0..3 {
            let blended = mode.combine(src[c], dst[c]);
            dst[c] = src[c] + (blended - src[c]) * opacity;
        }
    }
}
