use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// Black and white points
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LevelsParams {
    pub black: f32,
    pub white: f32,
}

impl Default for LevelsParams {
    fn default() -> Self {
        LevelsParams { black: 0.0, white: 1.0 }
    }
}

pub struct Levels;

impl ProcessingModule for Levels {
    fn name(&self) -> &'static str {
        "levels"
    }

    fn version(&self) -> u32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<LevelsParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&LevelsParams::default())
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: LevelsParams = decode_params(self.name(), params)?;
        let range = (p.white - p.black).max(1e-4);
        for px in buffer.pixels_mut() {
            for c in &mut px[..3] {
                *c = (*c - p.black) / range;
            }
        }
        Ok(())
    }
}
