//! Per-frame output of the mesh cache.
//!
//! The cache does not record draw calls. Each frame it hands a [`FrameOutput`]
//! to a [`DrawSubmitter`]: the staging copies that must run first, and one
//! [`DrawRecord`] per chunk drawn. Indices live in fixed-size blocks of one
//! shared index buffer, so a chunk becomes one indexed indirect draw per
//! block; the block number doubles as `first_instance`, which lets a shader
//! fetch the block's [`DrawParams`](crate::engine_state::rendering::vertex::DrawParams).

use cgmath::{MetricSpace, Point3, Vector3};
use wgpu::util::DrawIndexedIndirectArgs;

use super::mesh::BlockBounds;
use crate::engine_state::{
    gpu::{BufferHandle, GpuDevice, UploadCopy},
    voxels::chunk::ChunkId,
};
use crate::error::Result;

/// One block's share of a chunk's indices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockDraw {
    /// Block index in the shared index buffer
    pub block: usize,
    /// First index word of the block, in index-buffer units
    pub first_index: u32,
    /// Index words used in the block
    pub index_count: u32,
    /// World-space box around the corners the block references
    pub bounds: BlockBounds,
}

/// Everything needed to draw one chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub chunk: ChunkId,
    pub slot: usize,
    /// Chunk-local vertices
    pub geometry: BufferHandle,
    pub blocks: Vec<BlockDraw>,
    /// World-space origin of the chunk
    pub world_offset: [f32; 3],
}

impl DrawRecord {
    /// Total index words over all blocks.
    pub fn index_count(&self) -> u32 {
        self.blocks.iter().map(|block| block.index_count).sum()
    }
}

/// What one frame hands to the submitter.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameOutput {
    /// Frame number, as returned by `begin_frame`
    pub frame: u64,
    /// Staging ring buffer the copies read from
    pub staging: BufferHandle,
    pub index_buffer: BufferHandle,
    pub draw_params_buffer: BufferHandle,
    /// Transfers to encode before any draw
    pub copies: Vec<UploadCopy>,
    pub draws: Vec<DrawRecord>,
}

impl FrameOutput {
    /// Flattens the draw records into indexed indirect arguments.
    pub fn indirect_args(&self) -> Vec<DrawIndexedIndirectArgs> {
        self.draws
            .iter()
            .flat_map(|draw| draw.blocks.iter())
            .map(|block| DrawIndexedIndirectArgs {
                index_count: block.index_count,
                instance_count: 1,
                first_index: block.first_index,
                base_vertex: 0,
                first_instance: block.block as u32,
            })
            .collect()
    }
}

/// Consumer of a frame's uploads and draws.
///
/// Called between the staging flush and the placement of the frame's fence,
/// so everything it submits is covered by that fence.
pub trait DrawSubmitter<D: GpuDevice + ?Sized> {
    fn submit(&mut self, device: &mut D, output: &FrameOutput) -> Result<()>;
}

/// Orders draws by distance from `viewer` to each chunk's centre, nearest first.
pub fn sort_front_to_back(draws: &mut [DrawRecord], viewer: Point3<f32>, chunk_side: usize) {
    let half = chunk_side as f32 / 2.0;
    let centre_distance = |draw: &DrawRecord| {
        let centre = Point3::from(draw.world_offset) + Vector3::new(half, half, half);
        centre.distance2(viewer)
    };
    draws.sort_by(|a, b| centre_distance(a).total_cmp(&centre_distance(b)));
}

/// World-space origin of a chunk.
pub fn chunk_origin(chunk: ChunkId, chunk_side: usize) -> [f32; 3] {
    let side = chunk_side as f32;
    [
        chunk.x as f32 * side,
        chunk.y as f32 * side,
        chunk.z as f32 * side,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunk: ChunkId, blocks: &[usize]) -> DrawRecord {
        DrawRecord {
            chunk,
            slot: 0,
            geometry: BufferHandle(1),
            blocks: blocks
                .iter()
                .map(|&block| BlockDraw {
                    block,
                    first_index: block as u32 * 8,
                    index_count: 6,
                    bounds: BlockBounds {
                        min: Point3::new(0.0, 0.0, 0.0),
                        max: Point3::new(1.0, 1.0, 1.0),
                    }
                    .translated(chunk_origin(chunk, 4)),
                })
                .collect(),
            world_offset: chunk_origin(chunk, 4),
        }
    }

    #[test]
    fn test_chunk_origin_scales_by_side() {
        assert_eq!(chunk_origin(Point3::new(1, -2, 0), 32), [32.0, -64.0, 0.0]);
    }

    #[test]
    fn test_sort_front_to_back() {
        let mut draws = vec![
            record(Point3::new(3, 0, 0), &[0]),
            record(Point3::new(-1, 0, 0), &[1]),
            record(Point3::new(0, 0, 0), &[2]),
        ];
        sort_front_to_back(&mut draws, Point3::new(2.0, 2.0, 2.0), 4);
        let order: Vec<i32> = draws.iter().map(|draw| draw.chunk.x).collect();
        assert_eq!(order, vec![0, -1, 3]);
    }

    #[test]
    fn test_indirect_args_one_per_block() {
        let output = FrameOutput {
            frame: 1,
            staging: BufferHandle(10),
            index_buffer: BufferHandle(11),
            draw_params_buffer: BufferHandle(12),
            copies: Vec::new(),
            draws: vec![
                record(Point3::new(0, 0, 0), &[3, 5]),
                record(Point3::new(1, 0, 0), &[0]),
            ],
        };
        let args = output.indirect_args();
        assert_eq!(args.len(), 3);
        assert_eq!(args[1].first_instance, 5);
        assert_eq!(args[1].first_index, 40);
        assert_eq!(args[2].instance_count, 1);
        assert_eq!(output.draws[0].index_count(), 12);
    }
}
