//! # Chunk Module
//!
//! A `Chunk` is an S×S×S cube of material ids: the unit of editing, meshing
//! and caching.
//!
//! ## Storage
//!
//! One `MaterialId` per cell in a flat vector indexed `x + S * (y + S * z)`.
//! Alongside the cells a chunk keeps:
//! - `dirty`: its mesh no longer matches its cells or its neighbors' borders
//! - `generation`: bumped on every change that affects the mesh, so results
//!   can be ordered
//! - `instance`: unique per chunk object, so a chunk destroyed and re-created
//!   at the same position is never confused with its predecessor
//!
//! Chunks never hold references to their neighbors. Halo data is copied in by
//! whoever resolved the neighbor through the [`World`](super::world::World).

use cgmath::Point3;

use super::block::block_side::BlockSide;
use super::block::{MaterialId, AIR};
use crate::engine_state::rendering::meshing::mesher::OccupancyGrid;

/// Identity of a chunk: its position in chunk coordinates.
pub type ChunkId = Point3<i32>;

/// A cube of voxel materials.
pub struct Chunk {
    /// Position of this chunk in chunk coordinates (not voxel coordinates).
    pub position: ChunkId,
    side: usize,
    materials: Vec<MaterialId>,
    voxel_count: usize,
    dirty: bool,
    generation: u64,
    instance: u64,
}

impl Chunk {
    /// Creates an all-air chunk.
    ///
    /// # Arguments
    /// * `position` - Chunk coordinates
    /// * `side` - Cells per edge
    /// * `instance` - World-unique number of this chunk object
    pub fn empty(position: ChunkId, side: usize, instance: u64) -> Self {
        Self {
            position,
            side,
            materials: vec![AIR; side * side * side],
            voxel_count: 0,
            dirty: false,
            generation: 0,
            instance,
        }
    }

    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < self.side && y < self.side && z < self.side);
        x + self.side * (y + self.side * z)
    }

    /// Material at a local cell.
    pub fn get(&self, x: usize, y: usize, z: usize) -> MaterialId {
        self.materials[self.index(x, y, z)]
    }

    /// Writes a local cell.
    ///
    /// A changed cell marks the chunk dirty and bumps its generation.
    ///
    /// # Returns
    /// `true` if the stored material changed
    pub fn set(&mut self, x: usize, y: usize, z: usize, material: MaterialId) -> bool {
        let index = self.index(x, y, z);
        let previous = self.materials[index];
        if previous == material {
            return false;
        }
        match (previous == AIR, material == AIR) {
            (true, false) => self.voxel_count += 1,
            (false, true) => self.voxel_count -= 1,
            _ => {}
        }
        self.materials[index] = material;
        self.mark_dirty();
        true
    }

    /// Flags the mesh as out of date.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    /// Clears the dirty flag once a rebuild has been scheduled.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Whether the mesh is out of date.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Counter of mesh-affecting changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// World-unique number of this chunk object.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Number of non-air cells.
    pub fn voxel_count(&self) -> usize {
        self.voxel_count
    }

    /// Cells per edge.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Copies every cell into the interior of `grid`.
    pub fn copy_into(&self, grid: &mut OccupancyGrid) {
        debug_assert_eq!(grid.side(), self.side);
        let side = self.side;
        for z in 0..side {
            for y in 0..side {
                for x in 0..side {
                    let material = self.get(x, y, z);
                    if material != AIR {
                        grid.set(x as i32, y as i32, z as i32, material);
                    }
                }
            }
        }
    }

    /// Copies this chunk's border layer into the halo of a neighbor's grid.
    ///
    /// # Arguments
    /// * `toward` - Direction from the grid's owner to this chunk
    /// * `grid` - The owner's occupancy grid
    pub fn copy_border_into_halo(&self, toward: BlockSide, grid: &mut OccupancyGrid) {
        let side = self.side;
        let axis = toward.axis();
        let (source, target) = if toward.is_positive() {
            (0, side as i32)
        } else {
            (side - 1, -1)
        };

        for v in 0..side {
            for u in 0..side {
                let [x, y, z] = along_axis(axis, source, u, v);
                let material = self.get(x, y, z);
                if material != AIR {
                    let [gx, gy, gz] = along_axis(axis, target, u as i32, v as i32);
                    grid.set(gx, gy, gz, material);
                }
            }
        }
    }
}

/// Builds a coordinate triple with `along` on `axis` and `u`, `v` on the other two.
pub(crate) fn along_axis<T>(axis: usize, along: T, u: T, v: T) -> [T; 3] {
    match axis {
        0 => [along, u, v],
        1 => [u, along, v],
        _ => [u, v, along],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_tracks_count_dirty_and_generation() {
        let mut chunk = Chunk::empty(Point3::new(0, 0, 0), 4, 1);
        assert!(!chunk.is_dirty());

        assert!(chunk.set(1, 2, 3, 7));
        assert_eq!(chunk.get(1, 2, 3), 7);
        assert_eq!(chunk.voxel_count(), 1);
        assert!(chunk.is_dirty());
        assert_eq!(chunk.generation(), 1);

        chunk.clear_dirty();
        assert!(!chunk.set(1, 2, 3, 7));
        assert!(!chunk.is_dirty());
        assert_eq!(chunk.generation(), 1);

        assert!(chunk.set(1, 2, 3, 9));
        assert_eq!(chunk.voxel_count(), 1);
        assert!(chunk.set(1, 2, 3, AIR));
        assert_eq!(chunk.voxel_count(), 0);
        assert_eq!(chunk.generation(), 3);
    }

    #[test]
    fn test_border_lands_in_opposite_halo() {
        let mut neighbor = Chunk::empty(Point3::new(1, 0, 0), 4, 2);
        neighbor.set(0, 1, 2, 5);
        neighbor.set(3, 1, 2, 6);

        let mut grid = OccupancyGrid::new(4);
        neighbor.copy_border_into_halo(BlockSide::RIGHT, &mut grid);
        assert_eq!(grid.get(4, 1, 2), 5);
        assert_eq!(grid.get(4, 1, 1), AIR);

        let mut grid = OccupancyGrid::new(4);
        neighbor.copy_border_into_halo(BlockSide::LEFT, &mut grid);
        assert_eq!(grid.get(-1, 1, 2), 6);
    }
}
