//! Rendering side of the streaming engine.
//!
//! Turns chunk data into GPU-resident meshes: background mesh generation
//! (`tasks`), the mesher and the slot cache (`meshing`), and the record
//! layouts uploads write (`vertex`). Pipelines and draw calls stay with the
//! caller, who receives one [`FrameOutput`] per frame through a
//! [`DrawSubmitter`].

pub mod material_table;
pub mod meshing;
pub mod tasks;
pub mod vertex;

// Re-export commonly used types
pub use meshing::{
    BlockBounds, BlockDraw, CacheStats, ChunkMeshCache, DrawOutcome, DrawRecord, DrawSubmitter,
    FrameOutput, FrameStats, Lookup, SlotState,
};
pub use material_table::{Material, MaterialTable};
pub use vertex::{DrawParams, PackedVertex};
