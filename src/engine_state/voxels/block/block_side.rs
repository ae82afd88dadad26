//! # Block Side Module
//!
//! The six axis-aligned faces of a voxel cell, and the matching directions to
//! a chunk's face neighbors.

use cgmath::Vector3;

/// One of the six faces of a cell.
///
/// The discriminants are stable; they index per-side arrays such as a chunk's
/// neighbor list.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum BlockSide {
    /// Facing positive Z
    FRONT = 0,
    /// Facing negative Z
    BACK = 1,
    /// Facing negative Y
    BOTTOM = 2,
    /// Facing positive Y
    TOP = 3,
    /// Facing negative X
    LEFT = 4,
    /// Facing positive X
    RIGHT = 5,
}

impl BlockSide {
    /// All six sides, in discriminant order.
    pub fn all() -> [BlockSide; 6] {
        [
            BlockSide::FRONT,
            BlockSide::BACK,
            BlockSide::BOTTOM,
            BlockSide::TOP,
            BlockSide::LEFT,
            BlockSide::RIGHT,
        ]
    }

    /// Axis the side is perpendicular to: 0 = X, 1 = Y, 2 = Z.
    pub fn axis(self) -> usize {
        match self {
            BlockSide::LEFT | BlockSide::RIGHT => 0,
            BlockSide::BOTTOM | BlockSide::TOP => 1,
            BlockSide::FRONT | BlockSide::BACK => 2,
        }
    }

    /// Whether the side faces the positive end of its axis.
    pub fn is_positive(self) -> bool {
        matches!(self, BlockSide::FRONT | BlockSide::TOP | BlockSide::RIGHT)
    }

    /// Outward unit normal.
    pub fn normal(self) -> Vector3<i32> {
        let mut normal = [0; 3];
        normal[self.axis()] = if self.is_positive() { 1 } else { -1 };
        Vector3::from(normal)
    }

    /// The side facing the other way.
    pub fn opposite(self) -> BlockSide {
        match self {
            BlockSide::FRONT => BlockSide::BACK,
            BlockSide::BACK => BlockSide::FRONT,
            BlockSide::BOTTOM => BlockSide::TOP,
            BlockSide::TOP => BlockSide::BOTTOM,
            BlockSide::LEFT => BlockSide::RIGHT,
            BlockSide::RIGHT => BlockSide::LEFT,
        }
    }
}
