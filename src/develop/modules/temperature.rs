use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// White balance correction on top of the as-shot coefficients
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct TemperatureParams {
    /// -100 (cooler) to +100 (warmer)
    pub temperature: f32,
    /// -100 (greener) to +100 (more magenta)
    pub tint: f32,
}

pub struct Temperature;

impl TemperatureParams {
    /// Per-channel multipliers for R, G, B.
    pub fn multipliers(&self) -> [f32; 3] {
        let t = self.temperature.clamp(-100.0, 100.0) / 200.0;
        let tint = self.tint.clamp(-100.0, 100.0) / 200.0;
        [1.0 + t, 1.0 - tint, 1.0 - t]
    }
}

impl ProcessingModule for Temperature {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn version(&self) -> u32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<TemperatureParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&TemperatureParams::default())
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: TemperatureParams = decode_params(self.name(), params)?;
        let mul = p.multipliers();
        for px in buffer.pixels_mut() {
            for c in 0..3 {
                px[c] *= mul[c];
            }
        }
        Ok(())
    }
}
