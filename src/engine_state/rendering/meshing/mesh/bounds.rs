//! Bounding volumes of index blocks, for per-block culling.

use cgmath::{EuclideanSpace, MetricSpace, Point3, Vector3};

use super::mesh::VERTEX_INDEX_BITS;
use crate::engine_state::rendering::vertex::PackedVertex;

const VERTEX_INDEX_MASK: u32 = (1 << VERTEX_INDEX_BITS) - 1;

/// Axis-aligned box around the corners one index block references.
///
/// Boxes are chunk-local when built by [`PackedMesh`](super::PackedMesh)
/// and world-space once the cache has placed them with [`Self::translated`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockBounds {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl BlockBounds {
    /// Bounds of each `block_words`-long run of `indices`, in order.
    ///
    /// An axis along which every referenced corner is equal (a run of
    /// coplanar faces) is widened by one cell, so no box is flat.
    pub fn per_block(
        vertices: &[PackedVertex],
        indices: &[u32],
        block_words: usize,
    ) -> Vec<BlockBounds> {
        indices
            .chunks(block_words.max(1))
            .map(|run| Self::of_run(vertices, run))
            .collect()
    }

    fn of_run(vertices: &[PackedVertex], run: &[u32]) -> BlockBounds {
        let mut min = [u8::MAX; 3];
        let mut max = [u8::MIN; 3];
        for word in run {
            let vertex = vertices[(word & VERTEX_INDEX_MASK) as usize];
            for (axis, value) in [vertex.x, vertex.y, vertex.z].into_iter().enumerate() {
                min[axis] = min[axis].min(value);
                max[axis] = max[axis].max(value);
            }
        }

        let mut lo = [0.0f32; 3];
        let mut hi = [0.0f32; 3];
        for axis in 0..3 {
            lo[axis] = min[axis] as f32;
            hi[axis] = max[axis] as f32;
            if min[axis] == max[axis] {
                hi[axis] += 1.0;
            }
        }
        BlockBounds {
            min: Point3::from(lo),
            max: Point3::from(hi),
        }
    }

    /// Centre of the box, which is also the centre of its bounding sphere.
    pub fn centre(&self) -> Point3<f32> {
        self.min.midpoint(self.max)
    }

    /// Radius of the sphere around [`Self::centre`] that encloses the box.
    pub fn radius(&self) -> f32 {
        self.centre().distance(self.max)
    }

    /// The same box moved by `offset`.
    pub fn translated(&self, offset: [f32; 3]) -> BlockBounds {
        let offset = Vector3::from(offset);
        BlockBounds {
            min: self.min + offset,
            max: self.max + offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: u8, y: u8, z: u8) -> PackedVertex {
        PackedVertex::new(Point3::new(x, y, z))
    }

    #[test]
    fn test_runs_get_separate_boxes() {
        let vertices = [vertex(0, 0, 0), vertex(2, 3, 1), vertex(4, 4, 4), vertex(3, 1, 2)];
        // Material bits above the vertex index are ignored.
        let indices = [0, 1 | 7 << 16, 2, 3];
        let bounds = BlockBounds::per_block(&vertices, &indices, 2);

        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[0].min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(bounds[0].max, Point3::new(2.0, 3.0, 1.0));
        assert_eq!(bounds[1].min, Point3::new(3.0, 1.0, 2.0));
        assert_eq!(bounds[1].max, Point3::new(4.0, 4.0, 4.0));
    }

    #[test]
    fn test_flat_axis_is_widened() {
        let vertices = [vertex(1, 2, 0), vertex(3, 2, 0), vertex(3, 2, 4)];
        let bounds = BlockBounds::per_block(&vertices, &[0, 1, 2], 16);
        assert_eq!(bounds[0].min, Point3::new(1.0, 2.0, 0.0));
        assert_eq!(bounds[0].max, Point3::new(3.0, 3.0, 4.0));
    }

    #[test]
    fn test_sphere_encloses_box() {
        let bounds = BlockBounds {
            min: Point3::new(0.0, 0.0, 0.0),
            max: Point3::new(2.0, 2.0, 2.0),
        }
        .translated([32.0, 0.0, -64.0]);

        assert_eq!(bounds.min, Point3::new(32.0, 0.0, -64.0));
        assert_eq!(bounds.centre(), Point3::new(33.0, 1.0, -63.0));
        assert!((bounds.radius() - 3.0f32.sqrt()).abs() < 1e-6);
    }
}
