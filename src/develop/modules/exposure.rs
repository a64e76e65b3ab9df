use crate::develop::module::{decode_params, encode_params, ProcessingModule, RgbaBuffer};
use crate::error::Result;
use bytemuck::{Pod, Zeroable};

/// Exposure in stops and a black level offset
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct ExposureParams {
    /// -5.0 to +5.0 stops
    pub exposure: f32,
    pub black: f32,
}

/// Version 1 layout: exposure only
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
struct ExposureParamsV1 {
    exposure: f32,
}

pub struct Exposure;

impl ProcessingModule for Exposure {
    fn name(&self) -> &'static str {
        "exposure"
    }

    fn version(&self) -> u32 {
        2
    }

    fn params_size(&self) -> usize {
        std::mem::size_of::<ExposureParams>()
    }

    fn default_params(&self) -> Vec<u8> {
        encode_params(&ExposureParams::default())
    }

    fn migrate(&self, old_version: u32, params: &[u8]) -> Option<Vec<u8>> {
        match old_version {
            1 => {
                let old: ExposureParamsV1 = decode_params(self.name(), params).ok()?;
                Some(encode_params(&ExposureParams {
                    exposure: old.exposure,
                    black: 0.0,
                }))
            }
            _ => None,
        }
    }

    fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
        let p: ExposureParams = decode_params(self.name(), params)?;
        let scale = 2.0f32.powf(p.exposure);
        for px in buffer.pixels_mut() {
            for c in &mut px[..3] {
                *c = (*c - p.black) * scale;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_stop_doubles() {
        let mut buffer = RgbaBuffer::filled(2, 2, [0.1, 0.2, 0.25, 1.0]);
        let params = encode_params(&ExposureParams { exposure: 1.0, black: 0.0 });
        Exposure.apply(&params, &mut buffer).unwrap();
        assert_eq!(buffer.pixel(1, 1), [0.2, 0.4, 0.5, 1.0]);
    }

    #[test]
    fn test_migrate_v1() {
        let v1 = 0.5f32.to_ne_bytes().to_vec();
        let migrated = Exposure.migrate(1, &v1).unwrap();
        let p: ExposureParams = decode_params("exposure", &migrated).unwrap();
        assert_eq!(p, ExposureParams { exposure: 0.5, black: 0.0 });

        assert!(Exposure.migrate(1, &[1, 2]).is_none());
        assert!(Exposure.migrate(7, &v1).is_none());
    }
}
