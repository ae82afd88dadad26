//! # Face-Visibility Mesher
//!
//! Turns a halo-padded occupancy grid into the list of exposed cell faces.
//!
//! ## Algorithm
//!
//! Every (x, y) column of the padded grid is packed into a `u64` with bit `z`
//! set when cell `z` is occupied. For an interior column `c`:
//!
//! - `+Z` faces: `c & !(c >> 1)` (the cell above is empty)
//! - `-Z` faces: `c & !(c << 1)`
//! - `±X` / `±Y` faces: `c & !neighbor_column`
//!
//! so each direction costs one word operation per column instead of one test
//! per cell. Set bits are then walked with `trailing_zeros`.
//!
//! The padded side S + 2 must fit in 64 bits, so S is at most 62.

use super::mesh::Face;
use crate::config::MAX_CHUNK_SIDE;
use crate::engine_state::voxels::block::{block_side::BlockSide, MaterialId, AIR};

/// Largest interior side the column masks can hold.
pub const MAX_MESHER_SIDE: usize = 62;

const _: () = assert!(MAX_CHUNK_SIDE <= MAX_MESHER_SIDE);

/// Materials of a chunk plus a one-cell halo on every side.
///
/// Coordinates run from -1 to S inclusive; -1 and S are halo cells.
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    side: usize,
    padded: usize,
    cells: Vec<MaterialId>,
}

impl OccupancyGrid {
    /// Creates an all-empty grid for a chunk of side `side`.
    ///
    /// # Panics
    /// Panics if `side` is 0 or larger than [`MAX_MESHER_SIDE`].
    pub fn new(side: usize) -> Self {
        assert!(
            (1..=MAX_MESHER_SIDE).contains(&side),
            "chunk side {side} outside 1..={MAX_MESHER_SIDE}"
        );
        let padded = side + 2;
        OccupancyGrid {
            side,
            padded,
            cells: vec![AIR; padded * padded * padded],
        }
    }

    /// Interior side S.
    pub fn side(&self) -> usize {
        self.side
    }

    fn index(&self, x: i32, y: i32, z: i32) -> usize {
        let p = self.padded as i32;
        let (px, py, pz) = (x + 1, y + 1, z + 1);
        debug_assert!((0..p).contains(&px) && (0..p).contains(&py) && (0..p).contains(&pz));
        (px + p * (py + p * pz)) as usize
    }

    /// Material at a cell, halo included.
    pub fn get(&self, x: i32, y: i32, z: i32) -> MaterialId {
        self.cells[self.index(x, y, z)]
    }

    /// Writes a cell, halo included.
    pub fn set(&mut self, x: i32, y: i32, z: i32, material: MaterialId) {
        let index = self.index(x, y, z);
        self.cells[index] = material;
    }

    /// Fills the whole halo layer on `side` with `material`.
    pub fn fill_halo(&mut self, side: BlockSide, material: MaterialId) {
        let s = self.side as i32;
        let along = if side.is_positive() { s } else { -1 };
        for v in -1..=s {
            for u in -1..=s {
                let [x, y, z] = match side.axis() {
                    0 => [along, u, v],
                    1 => [u, along, v],
                    _ => [u, v, along],
                };
                self.set(x, y, z, material);
            }
        }
    }

    /// Occupancy bitmask of the padded column at padded coordinates `(px, py)`.
    fn column_masks(&self) -> Vec<u64> {
        let p = self.padded;
        let mut columns = vec![0u64; p * p];
        for pz in 0..p {
            for py in 0..p {
                for px in 0..p {
                    if self.cells[px + p * (py + p * pz)] != AIR {
                        columns[px + p * py] |= 1 << pz;
                    }
                }
            }
        }
        columns
    }
}

/// Lists every interior cell face whose neighbor across it is empty.
///
/// A pure function: an empty grid yields no faces, and a solid grid with an
/// empty halo yields exactly its 6·S² shell faces.
pub fn mesh(grid: &OccupancyGrid) -> Vec<Face> {
    let p = grid.padded;
    let s = grid.side;
    let columns = grid.column_masks();
    let interior: u64 = ((1u64 << s) - 1) << 1;
    let mut faces = Vec::new();

    for py in 1..=s {
        for px in 1..=s {
            let full = columns[px + p * py];
            let cur = full & interior;
            if cur == 0 {
                continue;
            }

            let exposed = [
                (BlockSide::FRONT, cur & !(full >> 1)),
                (BlockSide::BACK, cur & !(full << 1)),
                (BlockSide::BOTTOM, cur & !columns[px + p * (py - 1)]),
                (BlockSide::TOP, cur & !columns[px + p * (py + 1)]),
                (BlockSide::LEFT, cur & !columns[px - 1 + p * py]),
                (BlockSide::RIGHT, cur & !columns[px + 1 + p * py]),
            ];

            let (x, y) = ((px - 1) as i32, (py - 1) as i32);
            for (side, mut bits) in exposed {
                while bits != 0 {
                    let pz = bits.trailing_zeros() as i32;
                    bits &= bits - 1;
                    let z = pz - 1;
                    faces.push(Face::new(
                        x as u8,
                        y as u8,
                        z as u8,
                        side,
                        grid.get(x, y, z),
                    ));
                }
            }
        }
    }

    faces
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn solid(side: usize) -> OccupancyGrid {
        let mut grid = OccupancyGrid::new(side);
        let s = side as i32;
        for z in 0..s {
            for y in 0..s {
                for x in 0..s {
                    grid.set(x, y, z, 1);
                }
            }
        }
        grid
    }

    /// Straightforward per-cell six-neighbor test.
    fn reference_mesh(grid: &OccupancyGrid) -> HashSet<Face> {
        let s = grid.side() as i32;
        let mut faces = HashSet::new();
        for z in 0..s {
            for y in 0..s {
                for x in 0..s {
                    let material = grid.get(x, y, z);
                    if material == AIR {
                        continue;
                    }
                    for side in BlockSide::all() {
                        let n = side.normal();
                        if grid.get(x + n.x, y + n.y, z + n.z) == AIR {
                            faces.insert(Face::new(x as u8, y as u8, z as u8, side, material));
                        }
                    }
                }
            }
        }
        faces
    }

    #[test]
    fn test_empty_grid_has_no_faces() {
        assert!(mesh(&OccupancyGrid::new(32)).is_empty());
    }

    #[test]
    fn test_solid_chunk_yields_shell() {
        for side in [1, 4, 32, 62] {
            let faces = mesh(&solid(side));
            assert_eq!(faces.len(), 6 * side * side, "side {side}");
        }
    }

    #[test]
    fn test_single_cell_has_one_face_per_direction() {
        let mut grid = OccupancyGrid::new(4);
        grid.set(0, 0, 0, 9);
        let faces = mesh(&grid);

        assert_eq!(faces.len(), 6);
        let sides: HashSet<BlockSide> = faces.iter().map(|f| f.block_side).collect();
        assert_eq!(sides.len(), 6);
        assert!(faces
            .iter()
            .all(|f| f.material == 9 && f.position == cgmath::Point3::new(0, 0, 0)));
    }

    #[test]
    fn test_enclosed_cell_contributes_nothing() {
        let mut grid = solid(3);
        let with_center = mesh(&grid).len();
        grid.set(1, 1, 1, 2);
        assert_eq!(mesh(&grid).len(), with_center);
        assert!(mesh(&grid).iter().all(|f| f.material == 1));
    }

    #[test]
    fn test_occupied_halo_hides_boundary_faces() {
        let mut grid = solid(4);
        for side in BlockSide::all() {
            grid.fill_halo(side, 1);
        }
        assert!(mesh(&grid).is_empty());

        let mut grid = solid(4);
        grid.fill_halo(BlockSide::TOP, 1);
        assert_eq!(mesh(&grid).len(), 5 * 16);
    }

    #[test]
    fn test_matches_per_cell_reference_on_random_grids() {
        let mut rng = fastrand::Rng::with_seed(42);
        for side in [1, 5, 17, 62] {
            let mut grid = OccupancyGrid::new(side);
            let s = side as i32;
            for z in -1..=s {
                for y in -1..=s {
                    for x in -1..=s {
                        if rng.u8(..) < 100 {
                            grid.set(x, y, z, rng.u16(1..5));
                        }
                    }
                }
            }
            let faces = mesh(&grid);
            let unique: HashSet<Face> = faces.iter().copied().collect();
            assert_eq!(unique.len(), faces.len(), "duplicate faces at side {side}");
            assert_eq!(unique, reference_mesh(&grid), "side {side}");
        }
    }
}
