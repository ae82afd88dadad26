//! # World Module
//!
//! The `World` owns every chunk and is the only way to reach one. Chunks are
//! stored sparsely by chunk coordinate and created on their first edit.
//!
//! ## Architecture
//!
//! Neighbor access is always a by-key lookup through the world: a chunk never
//! holds a pointer to another chunk, so there is no ownership cycle between
//! the world and its chunks, and "no neighbor here" is a normal answer.
//!
//! ## Dirty Propagation
//!
//! Face visibility depends on the six neighbors of a cell, so changing a cell
//! on a chunk border also dirties the chunk across that border. Removing a
//! chunk always dirties its neighbors. Creating one dirties them only under
//! the solid missing-neighbor policy; a new chunk is all air, which is what
//! the empty policy already assumed.

use std::collections::HashMap;

use cgmath::Point3;
use log::trace;
use serde::{Deserialize, Serialize};

use super::block::block_side::BlockSide;
use super::block::{MaterialId, AIR};
use super::chunk::{Chunk, ChunkId};
use crate::config::MissingNeighborPolicy;
use crate::core::MtResource;

/// A single voxel write in world voxel coordinates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoxelEdit {
    /// World X
    pub x: i32,
    /// World Y
    pub y: i32,
    /// World Z
    pub z: i32,
    /// Material to store; `AIR` clears the cell
    pub material: MaterialId,
}

impl VoxelEdit {
    /// Creates an edit.
    pub fn new(x: i32, y: i32, z: i32, material: MaterialId) -> Self {
        Self { x, y, z, material }
    }
}

/// What a batch of edits did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EditSummary {
    /// Cells whose material changed.
    pub changed: usize,
    /// Chunks created by the batch.
    pub created: usize,
}

/// Sparse collection of chunks keyed by chunk coordinate.
pub struct World {
    chunks: HashMap<ChunkId, MtResource<Chunk>>,
    chunk_side: usize,
    policy: MissingNeighborPolicy,
    next_instance: u64,
}

impl World {
    /// Creates an empty world.
    pub fn new(chunk_side: usize, policy: MissingNeighborPolicy) -> Self {
        Self {
            chunks: HashMap::new(),
            chunk_side,
            policy,
            next_instance: 0,
        }
    }

    /// Splits a world voxel coordinate into its chunk and the cell inside it.
    pub fn chunk_and_local(&self, x: i32, y: i32, z: i32) -> (ChunkId, [usize; 3]) {
        let side = self.chunk_side as i32;
        let chunk = Point3::new(x.div_euclid(side), y.div_euclid(side), z.div_euclid(side));
        let local = [
            x.rem_euclid(side) as usize,
            y.rem_euclid(side) as usize,
            z.rem_euclid(side) as usize,
        ];
        (chunk, local)
    }

    /// Applies a batch of edits in order.
    pub fn apply_edits(&mut self, edits: &[VoxelEdit]) -> EditSummary {
        let mut summary = EditSummary::default();
        for edit in edits {
            let (changed, created) = self.write_voxel(edit.x, edit.y, edit.z, edit.material);
            summary.changed += changed as usize;
            summary.created += created as usize;
        }
        summary
    }

    /// Writes one voxel.
    ///
    /// # Returns
    /// `true` if the stored material changed
    pub fn set_voxel(&mut self, x: i32, y: i32, z: i32, material: MaterialId) -> bool {
        self.write_voxel(x, y, z, material).0
    }

    fn write_voxel(&mut self, x: i32, y: i32, z: i32, material: MaterialId) -> (bool, bool) {
        let (id, [lx, ly, lz]) = self.chunk_and_local(x, y, z);

        let mut created = false;
        let chunk = match self.chunks.get(&id) {
            Some(chunk) => chunk.clone(),
            None if material == AIR => return (false, false),
            None => {
                created = true;
                self.create_chunk(id)
            }
        };

        if !chunk.get_mut().set(lx, ly, lz, material) {
            return (false, created);
        }

        let last = self.chunk_side - 1;
        for (axis, local) in [lx, ly, lz].into_iter().enumerate() {
            let low = negative_side(axis);
            let touching = [(local == 0, low), (local == last, low.opposite())];
            for side in touching
                .into_iter()
                .filter_map(|(touches, side)| touches.then_some(side))
            {
                if let Some(neighbor) = self.get_chunk_at(id + side.normal()) {
                    neighbor.get_mut().mark_dirty();
                }
            }
        }
        (true, created)
    }

    fn create_chunk(&mut self, id: ChunkId) -> MtResource<Chunk> {
        self.next_instance += 1;
        let chunk = MtResource::new(Chunk::empty(id, self.chunk_side, self.next_instance));
        self.chunks.insert(id, chunk.clone());
        trace!("Created chunk {:?} (instance {})", id, self.next_instance);

        if self.policy == MissingNeighborPolicy::Solid {
            self.dirty_neighbors(id);
        }
        chunk
    }

    /// Destroys a chunk and dirties its face neighbors. Rebuilds still
    /// running for it become stale.
    ///
    /// Under either policy the neighbors' halo goes from real data to the
    /// assumed value, so they always need a rebuild.
    ///
    /// # Returns
    /// `true` if a chunk existed at `id`
    pub fn remove_chunk(&mut self, id: ChunkId) -> bool {
        if self.chunks.remove(&id).is_none() {
            return false;
        }
        self.dirty_neighbors(id);
        true
    }

    fn dirty_neighbors(&self, id: ChunkId) {
        for neighbor in self.neighbors_of(id).into_iter().flatten() {
            neighbor.get_mut().mark_dirty();
        }
    }

    /// Material at a world voxel coordinate; `AIR` where no chunk exists.
    pub fn get_voxel(&self, x: i32, y: i32, z: i32) -> MaterialId {
        let (id, [lx, ly, lz]) = self.chunk_and_local(x, y, z);
        self.chunks
            .get(&id)
            .map_or(AIR, |chunk| chunk.get().get(lx, ly, lz))
    }

    /// Resolves a chunk coordinate to a chunk, if one exists.
    pub fn get_chunk_at(&self, id: ChunkId) -> Option<MtResource<Chunk>> {
        self.chunks.get(&id).cloned()
    }

    /// The six face neighbors of `id`, indexed by [`BlockSide`] discriminant.
    pub fn neighbors_of(&self, id: ChunkId) -> [Option<MtResource<Chunk>>; 6] {
        BlockSide::all().map(|side| self.get_chunk_at(id + side.normal()))
    }

    /// Coordinates of every dirty chunk.
    pub fn dirty_chunks(&self) -> Vec<ChunkId> {
        self.chunks
            .iter()
            .filter(|(_, chunk)| chunk.get().is_dirty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Coordinates of every chunk.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Cells per chunk edge.
    pub fn chunk_side(&self) -> usize {
        self.chunk_side
    }

    /// Halo policy for absent neighbors.
    pub fn policy(&self) -> MissingNeighborPolicy {
        self.policy
    }
}

fn negative_side(axis: usize) -> BlockSide {
    match axis {
        0 => BlockSide::LEFT,
        1 => BlockSide::BOTTOM,
        _ => BlockSide::BACK,
    }
}
