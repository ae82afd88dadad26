//! Perlin-noise terrain, expressed as voxel edits.

use cgmath::Point3;
use noise::{NoiseFn, Perlin};

use super::{block::MaterialId, chunk::ChunkId, world::VoxelEdit};
use crate::engine_state::rendering::Material;

/// Samples above this value are solid.
pub const PERLIN_POSITIVE_THRESHOLD: f64 = 0.2;
/// Samples below this value are solid.
pub const PERLIN_NEGATIVE_THRESHOLD: f64 = -0.2;
/// World coordinates are multiplied by this before sampling.
pub const PERLIN_SCALE_FACTOR: f64 = 0.05;

/// Materials handed out to solid cells.
const TERRAIN_MATERIALS: std::ops::Range<MaterialId> = 1..4;

/// Dirt, grass and stone, to be registered in this order so they get
/// the ids the generator hands out.
pub const TERRAIN_PALETTE: [Material; 3] = [
    Material {
        color: [0.45, 0.32, 0.2],
        roughness: 0.95,
        specular: [0.02, 0.02, 0.02],
        emissive: 0.0,
    },
    Material {
        color: [0.3, 0.6, 0.2],
        roughness: 0.8,
        specular: [0.04, 0.04, 0.04],
        emissive: 0.0,
    },
    Material {
        color: [0.5, 0.5, 0.52],
        roughness: 0.7,
        specular: [0.06, 0.06, 0.06],
        emissive: 0.0,
    },
];

/// Deterministic cave-like terrain generator.
pub struct TerrainGenerator {
    perlin: Perlin,
    seed: u32,
}

impl TerrainGenerator {
    pub fn new(seed: u32) -> Self {
        Self {
            perlin: Perlin::new(seed),
            seed,
        }
    }

    /// Edits that fill one chunk with terrain.
    ///
    /// Only solid cells produce an edit. Materials are drawn from an RNG seeded
    /// by the generator seed and the chunk position, so the same chunk always
    /// gets the same edits.
    pub fn chunk_edits(&self, chunk: ChunkId, side: usize) -> Vec<VoxelEdit> {
        let side = side as i32;
        let mut rng = fastrand::Rng::with_seed(self.chunk_seed(chunk));
        let mut edits = Vec::new();

        for z in 0..side {
            for y in 0..side {
                for x in 0..side {
                    let world = Point3::new(
                        x + side * chunk.x,
                        y + side * chunk.y,
                        z + side * chunk.z,
                    );
                    if self.is_solid(world) {
                        edits.push(VoxelEdit::new(
                            world.x,
                            world.y,
                            world.z,
                            rng.u16(TERRAIN_MATERIALS),
                        ));
                    }
                }
            }
        }
        edits
    }

    fn is_solid(&self, position: Point3<i32>) -> bool {
        let sample = self.perlin.get([
            position.x as f64 * PERLIN_SCALE_FACTOR,
            position.y as f64 * PERLIN_SCALE_FACTOR,
            position.z as f64 * PERLIN_SCALE_FACTOR,
        ]);
        !(PERLIN_NEGATIVE_THRESHOLD..=PERLIN_POSITIVE_THRESHOLD).contains(&sample)
    }

    fn chunk_seed(&self, chunk: ChunkId) -> u64 {
        let mut seed = self.seed as u64;
        for coordinate in [chunk.x, chunk.y, chunk.z] {
            seed = seed
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(coordinate as u32 as u64);
        }
        seed
    }
}
