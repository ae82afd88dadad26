//! Packing of mesher output into upload-ready vertex and index words.

use std::collections::HashMap;

use cgmath::Point3;

use super::{bounds::BlockBounds, face::Face};
use crate::engine_state::rendering::vertex::PackedVertex;
use crate::engine_state::voxels::chunk::ChunkId;

/// Index words per face: two triangles.
pub const INDICES_PER_FACE: usize = 6;

/// Bits of an index word holding the vertex index; the material sits above.
pub const VERTEX_INDEX_BITS: u32 = 16;

/// A chunk mesh ready for upload, plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedMesh {
    /// Chunk the mesh was built for
    pub chunk: ChunkId,
    /// Instance number of that chunk when it was sampled
    pub instance: u64,
    /// Generation of that chunk when it was sampled
    pub generation: u64,
    /// Deduplicated chunk-local corners
    pub vertices: Vec<PackedVertex>,
    /// `material << 16 | vertex_index` words, six per face
    pub indices: Vec<u32>,
    /// Number of faces packed
    pub face_count: usize,
    /// Index words per block the bounds were computed for
    pub block_words: usize,
    /// Chunk-local bounds of each `block_words`-long run of `indices`
    pub block_bounds: Vec<BlockBounds>,
}

impl PackedMesh {
    /// Packs faces into shared vertices and material-tagged index words, and
    /// bounds each run of `block_words` index words.
    ///
    /// # Panics
    /// Panics if the faces reference more than 65536 distinct corners, which
    /// cannot happen for chunks within the configured size limit.
    pub fn pack(
        chunk: ChunkId,
        instance: u64,
        generation: u64,
        faces: &[Face],
        block_words: usize,
    ) -> Self {
        let mut vertices = Vec::new();
        let mut indices = Vec::with_capacity(faces.len() * INDICES_PER_FACE);
        let mut lookup: HashMap<Point3<u8>, u32> = HashMap::new();

        for face in faces {
            let corners = face.corners().map(|corner| {
                *lookup.entry(corner).or_insert_with(|| {
                    vertices.push(PackedVertex::new(corner));
                    (vertices.len() - 1) as u32
                })
            });
            assert!(
                vertices.len() <= 1 << VERTEX_INDEX_BITS,
                "chunk mesh exceeds the 16-bit vertex index range"
            );
            let material = (face.material as u32) << VERTEX_INDEX_BITS;
            for corner in [0, 1, 2, 0, 2, 3] {
                indices.push(material | corners[corner]);
            }
        }

        let block_bounds = BlockBounds::per_block(&vertices, &indices, block_words);
        PackedMesh {
            chunk,
            instance,
            generation,
            vertices,
            indices,
            face_count: faces.len(),
            block_words,
            block_bounds,
        }
    }

    /// Chunk-local block bounds for blocks of `block_words` index words.
    pub fn block_bounds_for(&self, block_words: usize) -> Vec<BlockBounds> {
        if block_words == self.block_words {
            self.block_bounds.clone()
        } else {
            BlockBounds::per_block(&self.vertices, &self.indices, block_words)
        }
    }

    /// Whether the mesh has nothing to draw.
    pub fn is_empty(&self) -> bool {
        self.face_count == 0
    }

    /// Vertex stream as bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index stream as bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}
