use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// Crop rectangle as normalized edges: left, top, right, bottom
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CropParams {
    pub cx: f32,
    pub cy: f32,
    pub cw: f32,
    pub ch: f32,
}

impl Default for CropParams {
    fn default() -> Self {
        CropParams {
            cx: 0.0,
            cy: 0.0,
            cw: 1.0,
            ch: 1.0,
        }
    }
}

impl CropParams {
    /// Pixel rectangle `(x, y, width, height)` inside `width x height`,
    /// at least one pixel in each direction.
    pub fn rect(&self, width: usize, height: usize) -> (usize, usize, usize, usize) {
        let edge = |v: f32, size: usize| ((v.clamp(0.0, 1.0) * size as f32).round() as usize).min(size);
        let x0 = edge(self.cx, width).min(width.saturating_sub(1));
        let y0 = edge(self.cy, height).min(height.saturating_sub(1));
        let x1 = edge(self.cw, width).max(x0 + 1).min(width.max(1));
        let y1 = edge(self.ch, height).max(y0 + 1).min(height.max(1));
        (x0, y0, x1 - x0, y1 - y0)
    }
}

pub struct Crop;

impl ProcessingModule for Crop {
    fn name(&self) -> &'static str {
        "crop"
    }

    fn version(&self) -> u32 {
        1
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<CropParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&CropParams::default())
    }

    fn modify_dimensions(&self, params: &[u8], width: usize, height: usize) -> (usize, usize) {
        match decode_params::<CropParams>(self.name(), params) {
            Ok(p) => {
                let (_, _, w, h) = p.rect(width, height);
                (w, h)
            }
            Err(_) => (width, height),
        }
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: CropParams = decode_params(self.name(), params)?;
        if buffer.width == 0 || buffer.height == 0 {
            return Ok(());
        }
        let (x, y, w, h) = p.rect(buffer.width, buffer.height);
        if (w, h) == (buffer.width, buffer.height) {
            return Ok(());
        }
        let mut data = Vec::with_capacity(w * h * 4);
        for row in y..y + h {
            let start = (row * buffer.width + x) * 4;
            data.extend_from_slice(&buffer.data[start..start + w * 4]);
        }
        *buffer = RgbaBuffer::new(w, h, data);
        Ok(())
    }
}
