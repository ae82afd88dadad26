//! # Block Module
//!
//! Per-cell material data and the six faces of a cell.

pub mod block_side;

/// Material stored in one voxel cell. `AIR` (0) is empty space.
///
/// Materials end up in the upper 16 bits of every index word, so the type
/// must stay 16 bits wide.
pub type MaterialId = u16;

/// The empty material.
pub const AIR: MaterialId = 0;

/// Placeholder material for halo cells of an absent neighbor under the
/// solid missing-neighbor policy. Never emitted as a face material.
pub const HALO_SOLID: MaterialId = MaterialId::MAX;
