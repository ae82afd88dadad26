//! Background tasks owned by the rendering side.

pub mod chunk_mesh_generation_task;
