use cgmath::Point3;

use crate::engine_state::voxels::block::{block_side::BlockSide, MaterialId};

/// One visible cell face produced by the mesher.
///
/// Faces are transient: they are packed into vertex and index words right
/// after meshing and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Face {
    /// Chunk-local cell the face belongs to
    pub position: Point3<u8>,
    /// Which side of the cell is exposed
    pub block_side: BlockSide,
    /// Material of the cell
    pub material: MaterialId,
}

impl Face {
    /// Creates a face of the cell at `(x, y, z)`.
    pub fn new(x: u8, y: u8, z: u8, block_side: BlockSide, material: MaterialId) -> Self {
        Face {
            position: Point3::new(x, y, z),
            block_side,
            material,
        }
    }

    /// The four corners of the face, counter-clockwise seen from outside the cell.
    pub fn corners(&self) -> [Point3<u8>; 4] {
        let offsets: [[u8; 3]; 4] = match self.block_side {
            BlockSide::RIGHT => [[1, 0, 0], [1, 1, 0], [1, 1, 1], [1, 0, 1]],
            BlockSide::LEFT => [[0, 0, 0], [0, 0, 1], [0, 1, 1], [0, 1, 0]],
            BlockSide::TOP => [[0, 1, 0], [0, 1, 1], [1, 1, 1], [1, 1, 0]],
            BlockSide::BOTTOM => [[0, 0, 0], [1, 0, 0], [1, 0, 1], [0, 0, 1]],
            BlockSide::FRONT => [[0, 0, 1], [1, 0, 1], [1, 1, 1], [0, 1, 1]],
            BlockSide::BACK => [[0, 0, 0], [0, 1, 0], [1, 1, 0], [1, 0, 0]],
        };
        let p = self.position;
        offsets.map(|[dx, dy, dz]| Point3::new(p.x + dx, p.y + dy, p.z + dz))
    }
}

#[cfg(test)]
mod tests {
    use cgmath::{InnerSpace, Vector3};

    use super::*;

    #[test]
    fn test_corners_wind_outward() {
        for side in BlockSide::all() {
            let face = Face::new(2, 3, 4, side, 1);
            let c = face.corners().map(|p| Vector3::new(p.x as f32, p.y as f32, p.z as f32));
            let normal = (c[1] - c[0]).cross(c[2] - c[0]).normalize();
            let n = side.normal();
            let expected = Vector3::new(n.x as f32, n.y as f32, n.z as f32);
            assert!((normal - expected).magnitude() < 1e-6, "{side:?} winds inward");
        }
    }
}
