//! # Voxel Data
//!
//! Editable voxel storage: materials and faces (`block`), fixed-size cubes of
//! cells (`chunk`), and the sparse container that owns them (`world`).
//!
//! ## Data Flow
//!
//! 1. Batched `VoxelEdit`s arrive at the `World`
//! 2. The world creates chunks on first edit and writes cells
//! 3. Changed chunks, and neighbors whose halo changed, are marked dirty
//! 4. The engine schedules a background rebuild for every dirty chunk
//!
//! ## Thread Safety
//!
//! Each chunk sits behind its own `MtResource` lock. Mesher workers take read
//! locks on a chunk and its neighbors; the render thread takes short write
//! locks to apply edits.

pub mod block;
pub mod chunk;
pub mod terrain;
pub mod world;
