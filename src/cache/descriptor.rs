//! Mip levels and the buffer descriptor carried by every cached buffer
//!
//! A cached buffer is a small header (`BufferDescriptor`) plus the pixel
//! payload. Thumbnail levels store display-ready RGBA8, the preview level
//! stores linear RGBA f32 and the full level stores the decoded source
//! (a CFA mosaic for RAW files, RGBA f32 otherwise).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounds of the float preview level.
pub const PREVIEW_MAX_SIZE: u32 = 1280;

/// One resolution tier cached per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MipLevel {
    #[serde(rename = "thumb_128")]
    Thumb128,
    #[serde(rename = "thumb_256")]
    Thumb256,
    #[serde(rename = "thumb_512")]
    Thumb512,
    #[serde(rename = "thumb_1024")]
    Thumb1024,
    #[serde(rename = "thumb_2048")]
    Thumb2048,
    #[serde(rename = "thumb_4096")]
    Thumb4096,
    Preview,
    Full,
}

impl MipLevel {
    pub const ALL: [MipLevel; 8] = [
        MipLevel::Thumb128,
        MipLevel::Thumb256,
        MipLevel::Thumb512,
        MipLevel::Thumb1024,
        MipLevel::Thumb2048,
        MipLevel::Thumb4096,
        MipLevel::Preview,
        MipLevel::Full,
    ];

    /// Thumbnail levels in ascending resolution.
    pub const THUMBNAILS: [MipLevel; 6] = [
        MipLevel::Thumb128,
        MipLevel::Thumb256,
        MipLevel::Thumb512,
        MipLevel::Thumb1024,
        MipLevel::Thumb2048,
        MipLevel::Thumb4096,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<MipLevel> {
        MipLevel::ALL.get(index as usize).copied()
    }

    pub fn is_thumbnail(self) -> bool {
        self < MipLevel::Preview
    }

    /// Maximum width and height of a buffer at this level.
    ///
    /// `None` for the full level, whose size is the decoded source size.
    pub fn max_size(self) -> Option<(u32, u32)> {
        let side = match self {
            MipLevel::Thumb128 => 128,
            MipLevel::Thumb256 => 256,
            MipLevel::Thumb512 => 512,
            MipLevel::Thumb1024 => 1024,
            MipLevel::Thumb2048 => 2048,
            MipLevel::Thumb4096 => 4096,
            MipLevel::Preview => PREVIEW_MAX_SIZE,
            MipLevel::Full => return None,
        };
        Some((side, side))
    }

    /// Byte size of the largest buffer a thumbnail level can hold.
    ///
    /// Thumbnail entries are costed with this fixed value so the byte
    /// quota does not depend on the images that happen to be resident.
    pub fn thumbnail_cost(self) -> u64 {
        match self.max_size() {
            Some((w, h)) if self.is_thumbnail() => {
                HEADER_SIZE as u64 + w as u64 * h as u64 * PixelFormat::Rgba8.bytes_per_pixel() as u64
            }
            _ => 1,
        }
    }
}

impl fmt::Display for MipLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MipLevel::Thumb128 => "thumb_128",
            MipLevel::Thumb256 => "thumb_256",
            MipLevel::Thumb512 => "thumb_512",
            MipLevel::Thumb1024 => "thumb_1024",
            MipLevel::Thumb2048 => "thumb_2048",
            MipLevel::Thumb4096 => "thumb_4096",
            MipLevel::Preview => "preview",
            MipLevel::Full => "full",
        };
        f.write_str(name)
    }
}

/// Generation flags stored in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Buffer content must be (re)generated before use.
    pub const GENERATE: BufferFlags = BufferFlags(1 << 0);
    /// Delete the disk copy when this entry is evicted.
    pub const INVALIDATE: BufferFlags = BufferFlags(1 << 1);
    /// Buffer holds the dead-image placeholder.
    pub const DEAD: BufferFlags = BufferFlags(1 << 2);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

/// Channel layout of the pixel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8,
    RgbaF32,
    MosaicF32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::RgbaF32 => 16,
            PixelFormat::MosaicF32 => 4,
        }
    }
}

/// Header prefixed to every cached pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferDescriptor {
    pub width: u32,
    pub height: u32,
    /// Source width divided by buffer width.
    pub iscale: f32,
    pub format: PixelFormat,
    pub flags: BufferFlags,
    /// Header plus allocated payload, in bytes.
    pub size: usize,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<BufferDescriptor>();

/// Pixel payload of a cached buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PixelData {
    #[default]
    Empty,
    Rgba8(Vec<u8>),
    Float(Vec<f32>),
}

impl PixelData {
    fn capacity_bytes(&self) -> usize {
        match self {
            PixelData::Empty => 0,
            PixelData::Rgba8(v) => v.capacity(),
            PixelData::Float(v) => v.capacity() * std::mem::size_of::<f32>(),
        }
    }
}

/// Allocation failure while sizing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

/// Descriptor plus payload: the value stored in each mipmap cache entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MipBuffer {
    pub desc: BufferDescriptor,
    pub pixels: PixelData,
}

impl MipBuffer {
    /// An entry that has not been generated yet.
    pub fn pending() -> Self {
        let mut buffer = MipBuffer::default();
        buffer.desc.flags.insert(BufferFlags::GENERATE);
        buffer.desc.size = HEADER_SIZE;
        buffer
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn is_dead(&self) -> bool {
        self.desc.flags.contains(BufferFlags::DEAD)
    }

    pub fn is_populated(&self) -> bool {
        self.desc.width > 0
            && self.desc.height > 0
            && !self.desc.flags.contains(BufferFlags::GENERATE)
    }

    pub fn rgba8(&self) -> Option<&[u8]> {
        match &self.pixels {
            PixelData::Rgba8(v) => Some(v),
            _ => None,
        }
    }

    pub fn float(&self) -> Option<&[f32]> {
        match &self.pixels {
            PixelData::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Size the payload for `width x height` pixels of `format`.
    ///
    /// An existing allocation of the same kind is reused when large enough
    /// and grown in place otherwise.
    pub fn reserve(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<(), AllocError> {
        let pixels = width as usize * height as usize;
        match format {
            PixelFormat::Rgba8 => {
                let len = pixels * 4;
                let mut data = match std::mem::take(&mut self.pixels) {
                    PixelData::Rgba8(v) => v,
                    _ => Vec::new(),
                };
                if data.capacity() < len {
                    data.try_reserve_exact(len - data.len()).map_err(|_| AllocError)?;
                }
                data.clear();
                data.resize(len, 0);
                self.pixels = PixelData::Rgba8(data);
            }
            PixelFormat::RgbaF32 | PixelFormat::MosaicF32 => {
                let len = if format == PixelFormat::RgbaF32 { pixels * 4 } else { pixels };
                let mut data = match std::mem::take(&mut self.pixels) {
                    PixelData::Float(v) => v,
                    _ => Vec::new(),
                };
                if data.capacity() < len {
                    data.try_reserve_exact(len - data.len()).map_err(|_| AllocError)?;
                }
                data.clear();
                data.resize(len, 0.0);
                self.pixels = PixelData::Float(data);
            }
        }
        self.desc.width = width;
        self.desc.height = height;
        self.desc.format = format;
        self.desc.size = HEADER_SIZE + self.pixels.capacity_bytes();
        Ok(())
    }

    /// Replace the payload with an already computed RGBA8 buffer.
    pub fn set_rgba8(&mut self, width: u32, height: u32, data: Vec<u8>) {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        self.desc.width = width;
        self.desc.height = height;
        self.desc.format = PixelFormat::Rgba8;
        self.pixels = PixelData::Rgba8(data);
        self.desc.size = HEADER_SIZE + self.pixels.capacity_bytes();
    }

    /// Replace the payload with an already computed float buffer.
    pub fn set_float(&mut self, width: u32, height: u32, format: PixelFormat, data: Vec<f32>) {
        self.desc.width = width;
        self.desc.height = height;
        self.desc.format = format;
        self.pixels = PixelData::Float(data);
        self.desc.size = HEADER_SIZE + self.pixels.capacity_bytes();
    }

    /// Drop the payload, keeping nothing but the header.
    pub fn clear(&mut self) {
        self.pixels = PixelData::Empty;
        self.desc = BufferDescriptor {
            size: HEADER_SIZE,
            ..BufferDescriptor::default()
        };
    }

    /// Turn this buffer into the dead-image placeholder for `level`.
    pub fn set_dead(&mut self, level: MipLevel) {
        let format = if level.is_thumbnail() {
            PixelFormat::Rgba8
        } else {
            PixelFormat::RgbaF32
        };
        let (width, height) = (DEAD_IMAGE_SIZE, DEAD_IMAGE_SIZE);
        match format {
            PixelFormat::Rgba8 => self.set_rgba8(width, height, dead_image_rgba8()),
            _ => self.set_float(width, height, format, dead_image_rgba_f32()),
        }
        self.desc.iscale = 1.0;
        self.desc.flags = BufferFlags::DEAD;
    }

    pub fn dead(level: MipLevel) -> Self {
        let mut buffer = MipBuffer::default();
        buffer.set_dead(level);
        buffer
    }
}

pub const DEAD_IMAGE_SIZE: u32 = 8;

/// 8x8 skull bitmap, one bit per pixel, MSB is the leftmost pixel.
const DEAD_IMAGE_ROWS: [u8; 8] = [
    0b0000_0000,
    0b0011_1100,
    0b0101_1010,
    0b0111_1110,
    0b0010_0100,
    0b0000_0000,
    0b0011_1100,
    0b0000_0000,
];

fn dead_image_bit(x: u32, y: u32) -> bool {
    DEAD_IMAGE_ROWS[y as usize] & (0x80 >> x) != 0
}

fn dead_image_rgba8() -> Vec<u8> {
    let mut data = Vec::with_capacity((DEAD_IMAGE_SIZE * DEAD_IMAGE_SIZE * 4) as usize);
    for y in 0..DEAD_IMAGE_SIZE {
        for x in 0..DEAD_IMAGE_SIZE {
            let v = if dead_image_bit(x, y) { 255 } else { 0 };
            data.extend_from_slice(&[v, v, v, 255]);
        }
    }
    data
}

fn dead_image_rgba_f32() -> Vec<f32> {
    dead_image_rgba8().iter().map(|&v| v as f32 / 255.0).collect()
}
