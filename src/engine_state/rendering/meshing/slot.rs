//! Cache slots: one chunk's GPU-resident geometry each.

use super::draw_record::BlockDraw;
use crate::engine_state::{
    gpu::{BufferHandle, RetiredResource},
    voxels::chunk::ChunkId,
};

/// Where a slot is in its lifecycle.
///
/// `Empty` means unassigned: before first use, or after the cache gave the
/// slot up for a chunk it can never upload. An assigned slot alternates
/// between `Uploading` (assigned or rebuilt, geometry not yet current) and
/// `Resident`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Uploading,
    Resident,
}

/// A pre-allocated cache entry.
#[derive(Debug)]
pub struct Slot {
    /// Chunk currently mapped to this slot
    pub chunk: Option<ChunkId>,
    pub state: SlotState,
    /// Access-clock value of the last request; 0 if never used
    pub last_access: u64,
    /// Vertex buffer of the current upload
    pub geometry: Option<BufferHandle>,
    /// Index blocks of the current upload, in draw order
    pub blocks: Vec<BlockDraw>,
    /// Instance and generation of the mesh last uploaded here
    pub uploaded: Option<(u64, u64)>,
}

impl Slot {
    pub fn empty() -> Self {
        Slot {
            chunk: None,
            state: SlotState::Empty,
            last_access: 0,
            geometry: None,
            blocks: Vec::new(),
            uploaded: None,
        }
    }

    /// Number of deletion-queue entries [`Self::take_resources`] would produce.
    pub fn retired_entry_count(&self) -> usize {
        self.geometry.is_some() as usize + !self.blocks.is_empty() as usize
    }

    /// Detaches the geometry buffer and index blocks for deferred release.
    pub fn take_resources(&mut self) -> Vec<RetiredResource> {
        let mut resources = Vec::with_capacity(2);
        if let Some(geometry) = self.geometry.take() {
            resources.push(RetiredResource::Buffer(geometry));
        }
        if !self.blocks.is_empty() {
            let blocks = self.blocks.drain(..).map(|draw| draw.block).collect();
            resources.push(RetiredResource::Blocks(blocks));
        }
        self.uploaded = None;
        resources
    }

    /// Points the slot at a new chunk. Its old resources must already be taken.
    pub fn assign(&mut self, chunk: ChunkId) {
        debug_assert_eq!(self.retired_entry_count(), 0);
        self.chunk = Some(chunk);
        self.state = SlotState::Uploading;
    }

    /// Returns the slot to the unassigned state, first in line for reuse.
    /// Its old resources must already be taken.
    pub fn unassign(&mut self) {
        debug_assert_eq!(self.retired_entry_count(), 0);
        self.chunk = None;
        self.state = SlotState::Empty;
        self.last_access = 0;
    }
}

#[cfg(test)]
mod tests {
    use cgmath::Point3;

    use super::*;
    use crate::engine_state::rendering::meshing::mesh::BlockBounds;

    fn block(block: usize, index_count: u32) -> BlockDraw {
        BlockDraw {
            block,
            first_index: block as u32 * 256,
            index_count,
            bounds: BlockBounds {
                min: Point3::new(0.0, 0.0, 0.0),
                max: Point3::new(4.0, 4.0, 4.0),
            },
        }
    }

    #[test]
    fn test_take_resources_clears_slot() {
        let mut slot = Slot::empty();
        slot.assign(Point3::new(1, 2, 3));
        assert_eq!(slot.retired_entry_count(), 0);

        slot.geometry = Some(BufferHandle(7));
        slot.blocks = vec![block(4, 256), block(9, 12)];
        slot.uploaded = Some((1, 1));
        assert_eq!(slot.retired_entry_count(), 2);

        assert_eq!(
            slot.take_resources(),
            vec![
                RetiredResource::Buffer(BufferHandle(7)),
                RetiredResource::Blocks(vec![4, 9]),
            ]
        );
        assert_eq!(slot.retired_entry_count(), 0);
        assert_eq!(slot.uploaded, None);
        assert_eq!(slot.chunk, Some(Point3::new(1, 2, 3)));
    }
}
