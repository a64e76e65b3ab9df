use crate::color;
use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// Luminance-weighted shadow lift and highlight recovery
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct ShadowsHighlightsParams {
    /// -100 to +100; positive lifts dark pixels
    pub shadows: f32,
    /// -100 to +100; negative recovers bright pixels
    pub highlights: f32,
}

pub struct ShadowsHighlights;

impl ProcessingModule for ShadowsHighlights {
    fn name(&self) -> &'static str {
        "shadhi"
    }

    fn version(&self) -> u32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ShadowsHighlightsParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&ShadowsHighlightsParams::default())
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: ShadowsHighlightsParams = decode_params(self.name(), params)?;
        let (shadows, highlights) = (p.shadows / 100.0, p.highlights / 100.0);
        for px in buffer.pixels_mut() {
            // Bright pixels get the full highlight effect, dark ones the full shadow effect
            let lum = color::luminance([px[0], px[1], px[2]]).clamp(0.0, 1.0);
            let factor = (1.0 + lum * highlights) * (1.0 + (1.0 - lum) * shadows);
            for c in &mut px[..3] {
                *c *= factor;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadows_lift_dark_more_than_bright() {
        let params = encode_params(&ShadowsHighlightsParams { shadows: 50.0, highlights: 0.0 });
        let mut dark = RgbaBuffer::filled(1, 1, [0.1, 0.1, 0.1, 1.0]);
        let mut bright = RgbaBuffer::filled(1, 1, [0.9, 0.9, 0.9, 1.0]);
        ShadowsHighlights.apply(&params, &mut dark).unwrap();
        ShadowsHighlights.apply(&params, &mut bright).unwrap();
        let dark_gain = dark.pixel(0, 0)[0] / 0.1;
        let bright_gain = bright.pixel(0, 0)[0] / 0.9;
        assert!(dark_gain > bright_gain);
        assert!(bright_gain > 1.0);
    }

    #[test]
    fn test_highlight_recovery_darkens_bright() {
        let params = encode_params(&ShadowsHighlightsParams { shadows: 0.0, highlights: -50.0 });
        let mut bright = RgbaBuffer::filled(1, 1, [1.0, 1.0, 1.0, 1.0]);
        ShadowsHighlights.apply(&params, &mut bright).unwrap();
        assert!((bright.pixel(0, 0)[0] - 0.5).abs() < 1e-5);
    }
}
