//! GPU-side record layouts written by chunk uploads.
//!
//! Both types are `#[repr(C)]` and `Pod` so they can be cast straight into
//! staging bytes with `bytemuck`.

use cgmath::Point3;

/// A chunk-local mesh corner.
///
/// Coordinates are cell corners in `0..=S`, so they fit a byte for any
/// supported chunk size. Vertices never carry world positions; the chunk
/// origin comes from the per-block [`DrawParams`].
///
/// # Memory Layout
/// - x, y, z: u8 each
/// - padding: u8
///
/// Total size: 4 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PackedVertex {
    /// X corner coordinate
    pub x: u8,
    /// Y corner coordinate
    pub y: u8,
    /// Z corner coordinate
    pub z: u8,
    /// Always zero
    pub pad: u8,
}

impl PackedVertex {
    /// Packs a chunk-local corner.
    pub fn new(corner: Point3<u8>) -> Self {
        PackedVertex {
            x: corner.x,
            y: corner.y,
            z: corner.z,
            pad: 0,
        }
    }
}

/// Draw parameters patched in for every index block of a resident chunk.
///
/// # Memory Layout
/// - origin: [f32; 3] (12 bytes), world-space chunk origin
/// - index_count: u32 (4 bytes), valid index words in the block
///
/// Total size: 16 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawParams {
    /// World-space origin of the chunk
    pub origin: [f32; 3],
    /// Number of index words used in this block
    pub index_count: u32,
}

/// Size of one [`DrawParams`] record in the draw-parameter buffer.
pub const DRAW_PARAMS_SIZE: u64 = std::mem::size_of::<DrawParams>() as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<PackedVertex>(), 4);
        assert_eq!(DRAW_PARAMS_SIZE, 16);
        let params = DrawParams {
            origin: [32.0, 0.0, -64.0],
            index_count: 6,
        };
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[12..16], &6u32.to_ne_bytes());
    }
}
