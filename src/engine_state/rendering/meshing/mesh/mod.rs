//! Mesh data produced from voxel faces.
//!
//! # Architecture
//! - [`Face`]: one exposed side of one cell, with its four corners
//! - [`PackedMesh`]: faces packed into deduplicated 4-byte corners and
//!   `material << 16 | vertex` index words, ready to be carved into blocks
//! - [`BlockBounds`]: box and sphere around each block's corners

mod bounds;
mod face;
mod mesh;

pub use bounds::BlockBounds;
pub use face::Face;
pub use mesh::{PackedMesh, INDICES_PER_FACE, VERTEX_INDEX_BITS};
