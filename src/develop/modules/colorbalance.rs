use crate::color;
use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// Contrast, saturation and vibrance, each -100 to +100
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct ColorBalanceParams {
    pub contrast: f32,
    pub saturation: f32,
    pub vibrance: f32,
}

pub struct ColorBalance;

impl ProcessingModule for ColorBalance {
    fn name(&self) -> &'static str {
        "colorbalance"
    }

    fn version(&self) -> u32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ColorBalanceParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&ColorBalanceParams::default())
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: ColorBalanceParams = decode_params(self.name(), params)?;
        let contrast = 1.0 + p.contrast / 100.0;
        let saturation = 1.0 + p.saturation / 100.0;
        let vibrance = p.vibrance / 100.0;

        for px in buffer.pixels_mut() {
            // Contrast around the midpoint
            for c in &mut px[..3] {
                *c = (*c - 0.5) * contrast + 0.5;
            }

            // -100 = grayscale, +100 = double saturation
            let lum = color::luminance([px[0], px[1], px[2]]);
            for c in &mut px[..3] {
                *c = lum + (*c - lum) * saturation;
            }

            // Vibrance boosts muted colors more than saturated ones
            if vibrance != 0.0 {
                let max = px[0].max(px[1]).max(px[2]);
                let min = px[0].min(px[1]).min(px[2]);
                let sat = (max - min).clamp(0.0, 1.0);
                let factor = 1.0 + vibrance * (1.0 - sat);
                let lum = color::luminance([px[0], px[1], px[2]]);
                for c in &mut px[..3] {
                    *c = lum + (*c - lum) * factor;
                }
            }
        }
        Ok(())
    }
}
