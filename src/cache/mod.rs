//! Tiered mipmap cache
//!
//! - descriptor.rs: mip levels, buffer header and payload
//! - bounded.rs: generic cost-bounded LRU cache with per-entry locks
//! - disk.rs: JPEG write-back layer for thumbnail levels
//! - mipmap.rs: the per-image, per-level cache built from the above

pub mod bounded;
pub mod descriptor;
pub mod disk;
pub mod mipmap;

pub use bounded::Access;
pub use descriptor::{BufferDescriptor, BufferFlags, MipBuffer, MipLevel, PixelData, PixelFormat, DEAD_IMAGE_SIZE, PREVIEW_MAX_SIZE};
pub use disk::DiskCache;
pub use mipmap::{AcquireMode, MipmapCache, MipmapHandle, MipmapStats};
