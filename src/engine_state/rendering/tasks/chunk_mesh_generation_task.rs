//! Task for meshing one chunk on a worker thread.
//!
//! The render thread resolves the chunk's six face neighbors through the
//! world before publishing the task, so the worker never touches the world
//! itself. On the worker the task read-locks the chunk, then each neighbor in
//! turn, copies what it needs into an [`OccupancyGrid`], and meshes and packs
//! the grid without holding any lock.

use crate::{
    config::MissingNeighborPolicy,
    core::MtResource,
    engine_state::{
        rendering::meshing::{mesh::PackedMesh, mesher, mesher::OccupancyGrid},
        task_management::task::Task,
        voxels::{
            block::{block_side::BlockSide, HALO_SOLID},
            chunk::{Chunk, ChunkId},
        },
    },
};

/// Meshes one chunk against a snapshot of its neighbors.
pub struct ChunkMeshGenerationTask {
    /// The chunk to mesh
    chunk: MtResource<Chunk>,
    /// Face neighbors, indexed by `BlockSide` discriminant
    neighbors: [Option<MtResource<Chunk>>; 6],
    /// What an absent neighbor looks like in the halo
    policy: MissingNeighborPolicy,
    /// Index words per block, for the per-block bounds
    index_block_words: usize,
}

impl ChunkMeshGenerationTask {
    /// Creates a mesh generation task.
    ///
    /// # Arguments
    /// * `chunk` - The chunk to mesh
    /// * `neighbors` - Its face neighbors as resolved by the world
    /// * `policy` - Halo policy for absent neighbors
    /// * `index_block_words` - Index words per block of the shared index buffer
    pub fn new(
        chunk: MtResource<Chunk>,
        neighbors: [Option<MtResource<Chunk>>; 6],
        policy: MissingNeighborPolicy,
        index_block_words: usize,
    ) -> Self {
        ChunkMeshGenerationTask {
            chunk,
            neighbors,
            policy,
            index_block_words,
        }
    }

    /// Builds the halo-padded grid for the chunk.
    ///
    /// # Returns
    /// The grid plus the chunk's id, instance and generation at sampling time
    fn sample(&self) -> (OccupancyGrid, (ChunkId, u64, u64)) {
        let (mut grid, stamp) = {
            let chunk = self.chunk.get();
            let mut grid = OccupancyGrid::new(chunk.side());
            chunk.copy_into(&mut grid);
            (grid, (chunk.position, chunk.instance(), chunk.generation()))
        };

        for side in BlockSide::all() {
            match &self.neighbors[side as usize] {
                Some(neighbor) => neighbor.get().copy_border_into_halo(side, &mut grid),
                None if self.policy == MissingNeighborPolicy::Solid => {
                    grid.fill_halo(side, HALO_SOLID)
                }
                None => {}
            }
        }
        (grid, stamp)
    }
}

impl Task for ChunkMeshGenerationTask {
    type Output = PackedMesh;

    /// Samples, meshes and packs the chunk. Runs on a worker thread.
    fn process(&self) -> PackedMesh {
        let (grid, (chunk, instance, generation)) = self.sample();
        let faces = mesher::mesh(&grid);
        PackedMesh::pack(chunk, instance, generation, &faces, self.index_block_words)
    }
}

#[cfg(test)]
mod tests {
    use cgmath::Point3;

    use super::*;
    use crate::engine_state::voxels::world::World;

    #[test]
    fn test_neighbor_border_hides_shared_face() {
        let mut world = World::new(4, MissingNeighborPolicy::Empty);
        world.set_voxel(3, 0, 0, 1);
        world.set_voxel(4, 0, 0, 1);

        let id = Point3::new(0, 0, 0);
        let task = ChunkMeshGenerationTask::new(
            world.get_chunk_at(id).unwrap(),
            world.neighbors_of(id),
            world.policy(),
            64,
        );
        let mesh = task.process();
        assert_eq!(mesh.face_count, 5);
        assert_eq!(mesh.chunk, id);
        // Own edit plus the neighbor's border edit.
        assert_eq!(mesh.generation, 2);
        assert_eq!(mesh.block_words, 64);
        assert_eq!(mesh.block_bounds.len(), 1);
        assert_eq!(mesh.block_bounds[0].min, Point3::new(3.0, 0.0, 0.0));
        assert_eq!(mesh.block_bounds[0].max, Point3::new(4.0, 1.0, 1.0));
    }

    #[test]
    fn test_missing_neighbor_policy() {
        let mut world = World::new(4, MissingNeighborPolicy::Empty);
        world.set_voxel(3, 0, 0, 1);
        let id = Point3::new(0, 0, 0);
        let chunk = world.get_chunk_at(id).unwrap();

        let empty = ChunkMeshGenerationTask::new(
            chunk.clone(),
            world.neighbors_of(id),
            MissingNeighborPolicy::Empty,
            64,
        );
        assert_eq!(empty.process().face_count, 6);

        // Corner cell: +X, -Y and -Z touch absent chunks.
        let solid = ChunkMeshGenerationTask::new(
            chunk,
            world.neighbors_of(id),
            MissingNeighborPolicy::Solid,
            64,
        );
        assert_eq!(solid.process().face_count, 3);
    }
}
