//! # Chunk Mesh Cache
//!
//! Keeps the meshes of recently drawn chunks resident on the GPU in a fixed
//! set of slots, and streams new or rebuilt meshes up through a fenced
//! staging ring.
//!
//! ## Architecture
//! - `mesher`: bitmask face-visibility meshing of a halo-padded grid
//! - `mesh`: faces packed into vertex and index words
//! - `slot`: one cache entry and its lifecycle state
//! - `draw_record`: what a frame hands to the [`DrawSubmitter`]
//!
//! ## Slots
//! All C slots exist from construction on and are only ever reassigned. A
//! miss takes the slot with the oldest access time (lowest index on ties);
//! a chunk whose mesh was rebuilt keeps its slot and is uploaded again.
//!
//! ## Upload Path
//! An upload allocates index blocks from the shared index buffer and a fresh
//! geometry buffer, writes vertices, index words and one
//! [`DrawParams`] per block into the current staging rung, and records the
//! copies for the frame. The slot's previous buffer and blocks go to the
//! deferred-deletion ring tagged with the current frame, so they are only
//! reused after the GPU is known to have finished that frame.
//!
//! ## Frame Protocol
//! 1. `begin_frame` acquires a staging rung and drains completed deletions
//! 2. `request_draw` for every visible chunk
//! 3. `end_frame` flushes staging, submits, and fences the rung

use std::collections::{HashMap, HashSet};

use cgmath::Point3;
use log::{debug, trace, warn};

pub mod draw_record;
pub mod mesh;
pub mod mesher;
mod slot;

use draw_record::chunk_origin;
pub use draw_record::{sort_front_to_back, BlockDraw, DrawRecord, DrawSubmitter, FrameOutput};
pub use mesh::BlockBounds;
use mesh::PackedMesh;
use slot::Slot;
pub use slot::SlotState;

use crate::{
    config::StreamerConfig,
    core::StResource,
    engine_state::{
        gpu::{
            BlockAllocator, BufferHandle, BufferKind, DeletionQueue, FencedRingBuffer, GpuDevice,
            UploadCopy,
        },
        rendering::vertex::{DrawParams, DRAW_PARAMS_SIZE},
        voxels::chunk::ChunkId,
    },
    error::{Result, StreamingError},
};

/// Name of the staging ring buffer
pub const STAGING_BUFFER_NAME: &str = "Chunk Staging Ring";
/// Name of the shared index-block buffer
pub const INDEX_BUFFER_NAME: &str = "Chunk Index Blocks";
/// Name of the per-block draw parameter buffer
pub const DRAW_PARAMS_BUFFER_NAME: &str = "Chunk Draw Params";
/// Name given to every per-chunk vertex buffer
pub const GEOMETRY_BUFFER_NAME: &str = "Chunk Geometry";

/// Result of looking a chunk up in the slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit(usize),
    Miss,
}

/// What `request_draw` did for a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawOutcome {
    /// A draw record was emitted. `stale` means the slot still holds an
    /// older mesh because this frame's re-upload was deferred.
    Drawn { slot: usize, stale: bool },
    /// The chunk is meshed but has no faces; no slot is used.
    Empty,
    /// No mesh has been installed for the chunk yet.
    NotMeshed,
    /// Uploads are blocked for the rest of this frame and the chunk has
    /// nothing older to draw.
    Deferred,
}

/// Staging bytes and index blocks one mesh upload takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct UploadSize {
    bytes: u64,
    blocks: usize,
}

/// Running totals since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub uploads: u64,
    pub stale_draws: u64,
    pub deferred_requests: u64,
    pub stale_meshes_discarded: u64,
    pub released: u64,
    /// Requests refused because the mesh can never fit a rung or the index pool
    pub oversized_rejections: u64,
}

/// Per-frame totals returned by `end_frame`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub draws: usize,
    pub uploads: usize,
    pub copies: usize,
    pub staged_bytes: u64,
    pub evictions: usize,
    /// Deferred deletions released by `begin_frame`
    pub released: usize,
    /// An upload hit a capacity limit during the frame
    pub upload_blocked: bool,
}

struct FrameInProgress {
    number: u64,
    viewer: Point3<f32>,
    /// Access clock at `begin_frame`; slots touched this frame are newer
    first_tick: u64,
    draws: Vec<DrawRecord>,
    drawn: HashSet<ChunkId>,
    copies: Vec<UploadCopy>,
    uploaded_slots: Vec<usize>,
    upload_blocked: bool,
    stats: FrameStats,
}

/// Fixed-capacity LRU cache of GPU-resident chunk meshes.
pub struct ChunkMeshCache {
    slots: Vec<Slot>,
    slot_index: HashMap<ChunkId, usize>,
    access_clock: u64,
    /// Latest installed mesh per chunk
    meshes: HashMap<ChunkId, PackedMesh>,
    /// Chunks whose installed mesh was refused as oversized, warned about once
    oversized: HashSet<ChunkId>,
    allocator: BlockAllocator,
    staging: FencedRingBuffer,
    index_buffer: BufferHandle,
    draw_params_buffer: BufferHandle,
    deletion_queue: StResource<DeletionQueue>,
    chunk_side: usize,
    sort_draws: bool,
    frame_number: u64,
    /// Newest frame known to have finished on the GPU
    completed_frame: u64,
    frame: Option<FrameInProgress>,
    stats: CacheStats,
}

impl ChunkMeshCache {
    /// Creates the cache and its shared GPU buffers.
    ///
    /// # Arguments
    /// * `device` - Device the index, draw-parameter and staging buffers come from
    /// * `config` - Validated streamer configuration
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D, config: &StreamerConfig) -> Result<Self> {
        let deletion_queue = StResource::new(DeletionQueue::new(config.deletion_queue_capacity));
        let allocator = BlockAllocator::new(config.index_block_count, config.index_block_size);

        let index_buffer = device.allocate_device_buffer(
            INDEX_BUFFER_NAME,
            allocator.capacity_bytes(),
            BufferKind::Index,
        )?;
        let draw_params_buffer = match device.allocate_device_buffer(
            DRAW_PARAMS_BUFFER_NAME,
            config.index_block_count as u64 * DRAW_PARAMS_SIZE,
            BufferKind::DrawParams,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.release_buffer(index_buffer);
                return Err(err);
            }
        };
        let staging = match FencedRingBuffer::new(
            device,
            deletion_queue.clone(),
            STAGING_BUFFER_NAME,
            config.staging_rungs,
            config.staging_rung_size,
            config.fence_timeout(),
        ) {
            Ok(staging) => staging,
            Err(err) => {
                device.release_buffer(index_buffer);
                device.release_buffer(draw_params_buffer);
                return Err(err);
            }
        };

        debug!(
            "Created mesh cache: {} slots, {} index blocks of {} bytes, {} staging rungs",
            config.cache_capacity,
            config.index_block_count,
            config.index_block_size,
            config.staging_rungs
        );

        Ok(Self {
            slots: (0..config.cache_capacity).map(|_| Slot::empty()).collect(),
            slot_index: HashMap::new(),
            access_clock: 0,
            meshes: HashMap::new(),
            oversized: HashSet::new(),
            allocator,
            staging,
            index_buffer,
            draw_params_buffer,
            deletion_queue,
            chunk_side: config.chunk_side,
            sort_draws: config.sort_draws_by_distance,
            frame_number: 0,
            completed_frame: 0,
            frame: None,
            stats: CacheStats::default(),
        })
    }

    /// Finds the slot holding `chunk`.
    pub fn lookup(&self, chunk: ChunkId) -> Lookup {
        match self.slot_index.get(&chunk) {
            Some(&slot) => Lookup::Hit(slot),
            None => Lookup::Miss,
        }
    }

    /// Stores a freshly built mesh if it is newer than the one held for its chunk.
    ///
    /// A mesh is newer when it comes from a later chunk instance, or from the
    /// same instance at a later generation. A resident slot for the chunk is
    /// switched back to `Uploading` and keeps its place.
    ///
    /// # Returns
    /// `false` if the mesh was stale and dropped
    pub fn install_mesh(&mut self, mesh: PackedMesh) -> bool {
        let newer = match self.meshes.get(&mesh.chunk) {
            None => true,
            Some(current) => {
                (mesh.instance, mesh.generation) > (current.instance, current.generation)
            }
        };
        if !newer {
            self.stats.stale_meshes_discarded += 1;
            trace!(
                "Dropped stale mesh for chunk {:?} (generation {})",
                mesh.chunk,
                mesh.generation
            );
            return false;
        }

        if let Some(&slot) = self.slot_index.get(&mesh.chunk) {
            let slot = &mut self.slots[slot];
            if slot.state == SlotState::Resident {
                slot.state = SlotState::Uploading;
            }
        }
        self.oversized.remove(&mesh.chunk);
        self.meshes.insert(mesh.chunk, mesh);
        true
    }

    /// Forgets the mesh of a destroyed chunk.
    ///
    /// The chunk's slot is not freed; it ages out through normal eviction.
    pub fn forget_mesh(&mut self, chunk: ChunkId) -> bool {
        self.oversized.remove(&chunk);
        self.meshes.remove(&chunk).is_some()
    }

    /// Starts a frame.
    ///
    /// Waits for the next staging rung, learns from it which frame last
    /// completed on the GPU, and releases every deferred deletion up to that
    /// frame.
    ///
    /// # Returns
    /// - `Ok(frame_number)`
    /// - `Err(FenceTimeout)` if the GPU never released the rung
    pub fn begin_frame<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        viewer: Point3<f32>,
    ) -> Result<u64> {
        if self.frame.is_some() {
            return Err(StreamingError::FrameState(
                "begin_frame called twice without end_frame",
            ));
        }
        let lease = self.staging.begin_write(device)?;
        self.frame_number += 1;
        if let Some(epoch) = lease.completed_epoch {
            self.completed_frame = self.completed_frame.max(epoch);
        }

        let released = {
            let mut queue = self.deletion_queue.get_mut();
            queue.set_current_frame(self.frame_number);
            queue.drain(self.completed_frame, device, &mut self.allocator)
        };
        self.stats.released += released as u64;

        trace!(
            "Frame {} on staging rung {} (GPU completed frame {}, released {})",
            self.frame_number,
            lease.rung,
            self.completed_frame,
            released
        );
        self.frame = Some(FrameInProgress {
            number: self.frame_number,
            viewer,
            first_tick: self.access_clock,
            draws: Vec::new(),
            drawn: HashSet::new(),
            copies: Vec::new(),
            uploaded_slots: Vec::new(),
            upload_blocked: false,
            stats: FrameStats {
                frame: self.frame_number,
                released,
                ..Default::default()
            },
        });
        Ok(self.frame_number)
    }

    /// Requests that `chunk` be drawn this frame, uploading it if needed.
    ///
    /// Only the first capacity failure of a frame is returned as an error;
    /// later uploads in the same frame are deferred without trying.
    ///
    /// # Returns
    /// - `Ok(outcome)` for every non-error case, see [`DrawOutcome`]
    /// - `Err(AllocationExhausted | StagingExhausted | DeletionQueueFull)` when
    ///   this request's upload hit a limit; the chunk is retried next frame
    /// - `Err(UploadTooLarge)` when the mesh can never fit a staging rung or
    ///   the index pool; the chunk loses its slot, other requests go on
    /// - `Err(FrameState)` outside `begin_frame`/`end_frame`
    pub fn request_draw<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        chunk: ChunkId,
    ) -> Result<DrawOutcome> {
        let mut frame = self.frame.take().ok_or(StreamingError::FrameState(
            "request_draw outside begin_frame/end_frame",
        ))?;
        let outcome = self.request_in_frame(device, chunk, &mut frame);
        self.frame = Some(frame);
        outcome
    }

    fn request_in_frame<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        chunk: ChunkId,
        frame: &mut FrameInProgress,
    ) -> Result<DrawOutcome> {
        let Some(mesh) = self.meshes.get(&chunk) else {
            return Ok(DrawOutcome::NotMeshed);
        };
        let mesh_is_empty = mesh.is_empty();
        let size = self.upload_size(mesh);
        let block_capacity = self.allocator.block_count();
        if size.bytes > self.staging.rung_size() || size.blocks > block_capacity {
            let err = StreamingError::UploadTooLarge {
                bytes: size.bytes,
                rung_size: self.staging.rung_size(),
                blocks: size.blocks,
                block_capacity,
            };
            self.reject_oversized(chunk, &err);
            return Err(err);
        }

        let slot = match self.lookup(chunk) {
            Lookup::Hit(slot) => {
                self.stats.hits += 1;
                slot
            }
            Lookup::Miss if mesh_is_empty => return Ok(DrawOutcome::Empty),
            Lookup::Miss => {
                self.stats.misses += 1;
                if frame.upload_blocked {
                    self.stats.deferred_requests += 1;
                    return Ok(DrawOutcome::Deferred);
                }
                match self.assign_slot(chunk, frame) {
                    Ok(slot) => slot,
                    Err(err) => return Err(self.block_uploads(chunk, err, frame)),
                }
            }
        };
        self.access_clock += 1;
        self.slots[slot].last_access = self.access_clock;

        let stale = match self.slots[slot].state {
            SlotState::Resident => false,
            _ if frame.upload_blocked => true,
            _ => match self.upload(device, slot, frame) {
                Ok(()) => false,
                Err(err) => return Err(self.block_uploads(chunk, err, frame)),
            },
        };

        let entry = &self.slots[slot];
        match entry.geometry {
            Some(geometry) if !entry.blocks.is_empty() => {
                if frame.drawn.insert(chunk) {
                    frame.draws.push(DrawRecord {
                        chunk,
                        slot,
                        geometry,
                        blocks: entry.blocks.clone(),
                        world_offset: chunk_origin(chunk, self.chunk_side),
                    });
                }
                if stale {
                    self.stats.stale_draws += 1;
                }
                Ok(DrawOutcome::Drawn { slot, stale })
            }
            _ if stale => {
                self.stats.deferred_requests += 1;
                Ok(DrawOutcome::Deferred)
            }
            _ => Ok(DrawOutcome::Empty),
        }
    }

    /// Gives up the slot of a chunk whose mesh can never be uploaded.
    ///
    /// Uploads of other chunks carry on; the chunk comes back once a smaller
    /// mesh is installed for it.
    fn reject_oversized(&mut self, chunk: ChunkId, err: &StreamingError) {
        self.stats.oversized_rejections += 1;
        if self.oversized.insert(chunk) {
            warn!("Chunk {chunk:?} cannot be uploaded: {err}");
        }
        if let Some(slot) = self.slot_index.remove(&chunk) {
            let mut queue = self.deletion_queue.get_mut();
            let entry = &mut self.slots[slot];
            for resource in entry.take_resources() {
                queue.retire_or_leak(resource);
            }
            entry.unassign();
            trace!("Released slot {slot} of oversized chunk {chunk:?}");
        }
    }

    fn upload_size(&self, mesh: &PackedMesh) -> UploadSize {
        let blocks = self.allocator.blocks_for(mesh.index_bytes().len() as u64);
        UploadSize {
            bytes: mesh.vertex_bytes().len() as u64
                + mesh.index_bytes().len() as u64
                + blocks as u64 * DRAW_PARAMS_SIZE,
            blocks,
        }
    }

    /// Marks the frame as upload-blocked if `err` is a capacity limit.
    fn block_uploads(
        &mut self,
        chunk: ChunkId,
        err: StreamingError,
        frame: &mut FrameInProgress,
    ) -> StreamingError {
        if err.is_capacity_exhausted() {
            frame.upload_blocked = true;
            frame.stats.upload_blocked = true;
            warn!("Upload of chunk {chunk:?} deferred to a later frame: {err}");
            if let StreamingError::AllocationExhausted {
                requested_blocks, ..
            } = err
            {
                self.reclaim_idle_blocks(requested_blocks, frame);
            }
        }
        err
    }

    /// Oldest slot, lowest index first on equal access times.
    fn select_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(index, slot)| (slot.last_access, *index))
            .map(|(index, _)| index)
    }

    fn assign_slot(&mut self, chunk: ChunkId, frame: &mut FrameInProgress) -> Result<usize> {
        let victim = self
            .select_victim()
            .ok_or_else(|| StreamingError::InvalidConfig("mesh cache has no slots".to_owned()))?;
        self.retire_slot_resources(victim)?;

        if let Some(previous) = self.slots[victim].chunk.take() {
            self.slot_index.remove(&previous);
            self.stats.evictions += 1;
            frame.stats.evictions += 1;
            trace!("Evicted chunk {previous:?} from slot {victim}");
        }
        self.slots[victim].assign(chunk);
        self.slot_index.insert(chunk, victim);
        Ok(victim)
    }

    /// Moves a slot's buffer and blocks into the deletion ring.
    fn retire_slot_resources(&mut self, slot: usize) -> Result<()> {
        let mut queue = self.deletion_queue.get_mut();
        let entry = &mut self.slots[slot];
        if !queue.has_room(entry.retired_entry_count()) {
            return Err(StreamingError::DeletionQueueFull {
                capacity: queue.capacity(),
            });
        }
        for resource in entry.take_resources() {
            queue.retire(resource)?;
        }
        Ok(())
    }

    /// Releases the memory of slots not drawn this frame, least recent first,
    /// until their blocks plus the free ones cover `needed`.
    ///
    /// The slots keep their chunks and go back to `Uploading`. Their blocks
    /// become allocatable once this frame completes.
    fn reclaim_idle_blocks(&mut self, needed: usize, frame: &mut FrameInProgress) {
        let mut idle: Vec<usize> = (0..self.slots.len())
            .filter(|&index| {
                let slot = &self.slots[index];
                slot.last_access <= frame.first_tick && !slot.blocks.is_empty()
            })
            .collect();
        idle.sort_by_key(|&index| (self.slots[index].last_access, index));

        let mut covered = self.allocator.free_block_count();
        for slot in idle {
            if covered >= needed {
                break;
            }
            let blocks = self.slots[slot].blocks.len();
            if self.retire_slot_resources(slot).is_err() {
                break;
            }
            self.slots[slot].state = SlotState::Uploading;
            covered += blocks;
            self.stats.evictions += 1;
            frame.stats.evictions += 1;
            trace!("Reclaimed {blocks} index blocks from idle slot {slot}");
        }
    }

    /// Stages the chunk's current mesh into its slot.
    ///
    /// Nothing changes on failure except wasted staging space.
    fn upload<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        slot: usize,
        frame: &mut FrameInProgress,
    ) -> Result<()> {
        let chunk = self.slots[slot]
            .chunk
            .ok_or(StreamingError::FrameState("upload into an unassigned slot"))?;
        let mesh = self
            .meshes
            .get(&chunk)
            .ok_or(StreamingError::FrameState("upload without an installed mesh"))?;
        let stamp = (mesh.instance, mesh.generation);
        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();

        let staged_bytes = self.upload_size(mesh).bytes;
        let available = self.staging.remaining();
        if staged_bytes > available {
            return Err(StreamingError::StagingExhausted {
                requested: staged_bytes,
                available,
            });
        }
        {
            let queue = self.deletion_queue.get();
            if !queue.has_room(self.slots[slot].retired_entry_count()) {
                return Err(StreamingError::DeletionQueueFull {
                    capacity: queue.capacity(),
                });
            }
        }

        let blocks = self.allocator.allocate(index_bytes.len() as u64)?;
        let geometry = if vertex_bytes.is_empty() {
            None
        } else {
            match device.allocate_device_buffer(
                GEOMETRY_BUFFER_NAME,
                vertex_bytes.len() as u64,
                BufferKind::Geometry,
            ) {
                Ok(buffer) => Some(buffer),
                Err(err) => {
                    self.allocator.free(&blocks);
                    return Err(err);
                }
            }
        };

        let origin = chunk_origin(chunk, self.chunk_side);
        let mut stage = || -> Result<(Vec<UploadCopy>, Vec<BlockDraw>)> {
            let src = self.staging.buffer();
            let mut copies = Vec::with_capacity(1 + 2 * blocks.len());
            let mut block_draws = Vec::with_capacity(blocks.len());

            if let Some(geometry) = geometry {
                copies.push(UploadCopy {
                    src,
                    src_offset: self.staging.write(vertex_bytes)?,
                    dst: geometry,
                    dst_offset: 0,
                    size: vertex_bytes.len() as u64,
                });
            }

            let block_size = self.allocator.block_size() as usize;
            let bounds = mesh.block_bounds_for(block_size / 4);
            for ((&block, words), bounds) in blocks
                .iter()
                .zip(index_bytes.chunks(block_size))
                .zip(bounds)
            {
                let block_offset = self.allocator.block_offset(block);
                let index_count = (words.len() / 4) as u32;
                copies.push(UploadCopy {
                    src,
                    src_offset: self.staging.write(words)?,
                    dst: self.index_buffer,
                    dst_offset: block_offset,
                    size: words.len() as u64,
                });
                let params = DrawParams {
                    origin,
                    index_count,
                };
                copies.push(UploadCopy {
                    src,
                    src_offset: self.staging.write(bytemuck::bytes_of(&params))?,
                    dst: self.draw_params_buffer,
                    dst_offset: block as u64 * DRAW_PARAMS_SIZE,
                    size: DRAW_PARAMS_SIZE,
                });
                block_draws.push(BlockDraw {
                    block,
                    first_index: (block_offset / 4) as u32,
                    index_count,
                    bounds: bounds.translated(origin),
                });
            }
            Ok((copies, block_draws))
        };
        let (copies, block_draws) = match stage() {
            Ok(staged) => staged,
            Err(err) => {
                self.allocator.free(&blocks);
                if let Some(geometry) = geometry {
                    device.release_buffer(geometry);
                }
                return Err(err);
            }
        };

        {
            let mut queue = self.deletion_queue.get_mut();
            for resource in self.slots[slot].take_resources() {
                queue.retire_or_leak(resource);
            }
        }
        let entry = &mut self.slots[slot];
        entry.geometry = geometry;
        entry.blocks = block_draws;
        entry.uploaded = Some(stamp);
        entry.state = SlotState::Resident;

        trace!(
            "Uploaded chunk {chunk:?} into slot {slot}: {} blocks, {staged_bytes} bytes",
            entry.blocks.len()
        );
        self.stats.uploads += 1;
        frame.stats.uploads += 1;
        frame.stats.staged_bytes += staged_bytes;
        frame.copies.extend(copies);
        frame.uploaded_slots.push(slot);
        Ok(())
    }

    /// Stages `bytes` for a copy into `dst` at `dst_offset` in the open frame.
    ///
    /// # Returns
    /// - `Err(StagingExhausted)` if the current rung cannot hold the bytes;
    ///   nothing is staged
    /// - `Err(FrameState)` outside `begin_frame`/`end_frame`
    pub fn stage_buffer_write(
        &mut self,
        dst: BufferHandle,
        dst_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let frame = self.frame.as_mut().ok_or(StreamingError::FrameState(
            "stage_buffer_write outside begin_frame/end_frame",
        ))?;
        let src_offset = self.staging.write(bytes)?;
        frame.copies.push(UploadCopy {
            src: self.staging.buffer(),
            src_offset,
            dst,
            dst_offset,
            size: bytes.len() as u64,
        });
        frame.stats.staged_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Finishes the frame: flush staging, submit, fence the rung.
    ///
    /// The rung is fenced even if the submitter fails. Slots uploaded in a
    /// failed frame go back to `Uploading`, since their copies never ran.
    pub fn end_frame<D, S>(&mut self, device: &mut D, submitter: &mut S) -> Result<FrameStats>
    where
        D: GpuDevice + ?Sized,
        S: DrawSubmitter<D> + ?Sized,
    {
        let mut frame = self
            .frame
            .take()
            .ok_or(StreamingError::FrameState("end_frame without begin_frame"))?;
        if self.sort_draws {
            sort_front_to_back(&mut frame.draws, frame.viewer, self.chunk_side);
        }
        self.staging.flush(device);

        let mut stats = frame.stats;
        stats.draws = frame.draws.len();
        stats.copies = frame.copies.len();
        let output = FrameOutput {
            frame: frame.number,
            staging: self.staging.buffer(),
            index_buffer: self.index_buffer,
            draw_params_buffer: self.draw_params_buffer,
            copies: frame.copies,
            draws: frame.draws,
        };
        let submitted = submitter.submit(device, &output);
        self.staging.end_write(device, frame.number)?;

        if let Err(err) = submitted {
            for slot in frame.uploaded_slots {
                self.slots[slot].state = SlotState::Uploading;
            }
            return Err(err);
        }

        debug!(
            "Frame {}: {} draws, {} uploads, {} bytes staged, {} evictions",
            stats.frame, stats.draws, stats.uploads, stats.staged_bytes, stats.evictions
        );
        Ok(stats)
    }

    /// Waits for the GPU to go idle and releases every buffer the cache owns.
    pub fn shutdown<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        self.staging.wait_idle(device)?;

        let ChunkMeshCache {
            slots,
            mut allocator,
            staging,
            index_buffer,
            draw_params_buffer,
            deletion_queue,
            ..
        } = self;
        for geometry in slots.iter().filter_map(|slot| slot.geometry) {
            device.release_buffer(geometry);
        }
        device.release_buffer(index_buffer);
        device.release_buffer(draw_params_buffer);
        drop(staging);

        let released = deletion_queue.get_mut().drain_all(device, &mut allocator);
        debug!("Mesh cache shut down, released {released} deferred deletions");
        Ok(())
    }

    /// Number of slots C.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lifecycle state of a slot.
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    /// Number of slots holding uploaded geometry.
    pub fn resident_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Resident)
            .count()
    }

    /// Installed mesh of a chunk.
    pub fn mesh(&self, chunk: ChunkId) -> Option<&PackedMesh> {
        self.meshes.get(&chunk)
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Entries waiting in the deferred-deletion ring.
    pub fn pending_deletions(&self) -> usize {
        self.deletion_queue.get().len()
    }

    /// Number of the current or most recent frame.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Newest frame known to have completed on the GPU.
    pub fn completed_frame(&self) -> u64 {
        self.completed_frame
    }

    pub fn is_frame_open(&self) -> bool {
        self.frame.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_state::{
        gpu::{SoftwareDevice, SoftwareSubmitter},
        voxels::block::MaterialId,
    };
    use super::mesher::OccupancyGrid;

    fn config(capacity: usize, blocks: usize) -> StreamerConfig {
        StreamerConfig {
            chunk_side: 4,
            cache_capacity: capacity,
            index_block_size: 64,
            index_block_count: blocks,
            staging_rungs: 2,
            staging_rung_size: 4096,
            fence_timeout_ms: 5,
            deletion_queue_capacity: 64,
            worker_threads: 1,
            ..Default::default()
        }
    }

    /// Mesh of a 4³ chunk with the given occupied cells.
    fn mesh_of(chunk: ChunkId, generation: u64, cells: &[(i32, i32, i32, MaterialId)]) -> PackedMesh {
        let mut grid = OccupancyGrid::new(4);
        for &(x, y, z, material) in cells {
            grid.set(x, y, z, material);
        }
        PackedMesh::pack(chunk, 1, generation, &mesher::mesh(&grid), 16)
    }

    fn id(x: i32) -> ChunkId {
        Point3::new(x, 0, 0)
    }

    fn lookup_linear(cache: &ChunkMeshCache, chunk: ChunkId) -> Lookup {
        cache
            .slots
            .iter()
            .position(|slot| slot.chunk == Some(chunk))
            .map_or(Lookup::Miss, Lookup::Hit)
    }

    struct Harness {
        device: SoftwareDevice,
        submitter: SoftwareSubmitter,
        cache: ChunkMeshCache,
    }

    impl Harness {
        fn new(capacity: usize, blocks: usize) -> Self {
            let mut device = SoftwareDevice::new();
            let cache = ChunkMeshCache::new(&mut device, &config(capacity, blocks)).unwrap();
            Harness {
                device,
                submitter: SoftwareSubmitter::new(),
                cache,
            }
        }

        fn install_cube(&mut self, chunk: ChunkId, generation: u64) {
            assert!(self
                .cache
                .install_mesh(mesh_of(chunk, generation, &[(0, 0, 0, 1)])));
        }

        /// Runs one frame requesting `chunks` in order; the GPU completes it at once.
        fn frame(&mut self, chunks: &[ChunkId]) -> Vec<Option<DrawOutcome>> {
            self.cache
                .begin_frame(&mut self.device, Point3::new(0.0, 0.0, 0.0))
                .unwrap();
            let outcomes = chunks
                .iter()
                .map(|&chunk| self.cache.request_draw(&mut self.device, chunk).ok())
                .collect();
            self.cache
                .end_frame(&mut self.device, &mut self.submitter)
                .unwrap();
            self.device.complete_all();
            outcomes
        }
    }

    #[test]
    fn test_capacity_plus_one_evicts_first_requested() {
        let mut h = Harness::new(3, 32);
        let chunks: Vec<ChunkId> = (0..4).map(id).collect();
        for &chunk in &chunks {
            h.install_cube(chunk, 1);
        }

        let outcomes = h.frame(&chunks[..3]);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Some(DrawOutcome::Drawn { stale: false, .. }))));
        assert_eq!(h.cache.stats().evictions, 0);

        h.frame(&chunks[3..]);
        assert_eq!(h.cache.lookup(chunks[0]), Lookup::Miss);
        for &chunk in &chunks[1..] {
            assert!(matches!(h.cache.lookup(chunk), Lookup::Hit(_)));
            assert_eq!(h.cache.lookup(chunk), lookup_linear(&h.cache, chunk));
        }
        assert_eq!(h.cache.stats().evictions, 1);
    }

    #[test]
    fn test_reaccess_protects_from_eviction() {
        let mut h = Harness::new(2, 32);
        let (a, b, c) = (id(0), id(1), id(2));
        for chunk in [a, b, c] {
            h.install_cube(chunk, 1);
        }

        h.frame(&[a, b]);
        let slot_a = h.cache.lookup(a);
        h.frame(&[a]);
        h.frame(&[c]);

        assert_eq!(h.cache.lookup(b), Lookup::Miss);
        assert_eq!(h.cache.lookup(a), slot_a);
        assert!(matches!(h.cache.lookup(c), Lookup::Hit(_)));
    }

    #[test]
    fn test_empty_and_unmeshed_chunks_take_no_slot() {
        let mut h = Harness::new(2, 32);
        assert!(h.cache.install_mesh(mesh_of(id(0), 1, &[])));

        let outcomes = h.frame(&[id(0), id(1)]);
        assert_eq!(
            outcomes,
            vec![Some(DrawOutcome::Empty), Some(DrawOutcome::NotMeshed)]
        );
        assert_eq!(h.cache.lookup(id(0)), Lookup::Miss);
        assert_eq!(h.cache.resident_count(), 0);
    }

    #[test]
    fn test_upload_lands_in_device_buffers() {
        let mut h = Harness::new(2, 32);
        let chunk = Point3::new(1, 0, -1);
        h.install_cube(chunk, 1);
        h.frame(&[chunk]);

        let output = h.submitter.last_output().unwrap().clone();
        assert_eq!(output.draws.len(), 1);
        let draw = &output.draws[0];
        assert_eq!(draw.world_offset, [4.0, 0.0, -4.0]);
        // 36 index words over 16-word blocks.
        let counts: Vec<u32> = draw.blocks.iter().map(|b| b.index_count).collect();
        assert_eq!(counts, vec![16, 16, 4]);

        let mesh = h.cache.mesh(chunk).unwrap().clone();
        assert_eq!(
            h.device.buffer_contents(draw.geometry).unwrap(),
            mesh.vertex_bytes()
        );
        for (block, bounds) in draw.blocks.iter().zip(&mesh.block_bounds) {
            assert_eq!(block.bounds, bounds.translated([4.0, 0.0, -4.0]));
        }

        let index = h.device.buffer_contents(output.index_buffer).unwrap();
        let last = draw.blocks[2];
        let start = last.first_index as usize * 4;
        assert_eq!(&index[start..start + 16], &mesh.index_bytes()[128..144]);

        let params = h.device.buffer_contents(output.draw_params_buffer).unwrap();
        let offset = last.block * DRAW_PARAMS_SIZE as usize;
        let record: DrawParams = bytemuck::pod_read_unaligned(&params[offset..offset + 16]);
        assert_eq!(
            record,
            DrawParams {
                origin: [4.0, 0.0, -4.0],
                index_count: 4
            }
        );
    }

    #[test]
    fn test_exhaustion_defers_and_retries_later() {
        // Four blocks: one single-cell mesh uses three.
        let mut h = Harness::new(4, 4);
        let (a, b, c) = (id(0), id(1), id(2));
        for chunk in [a, b, c] {
            h.install_cube(chunk, 1);
        }

        h.cache
            .begin_frame(&mut h.device, Point3::new(0.0, 0.0, 0.0))
            .unwrap();
        assert!(matches!(
            h.cache.request_draw(&mut h.device, a),
            Ok(DrawOutcome::Drawn { .. })
        ));
        assert!(matches!(
            h.cache.request_draw(&mut h.device, b),
            Err(StreamingError::AllocationExhausted {
                requested_blocks: 3,
                free_blocks: 1
            })
        ));
        assert_eq!(
            h.cache.request_draw(&mut h.device, c).unwrap(),
            DrawOutcome::Deferred
        );
        let stats = h.cache.end_frame(&mut h.device, &mut h.submitter).unwrap();
        assert!(stats.upload_blocked);
        assert_eq!(stats.draws, 1);
        h.device.complete_all();

        // A is idle this time, so the failure reclaims its blocks; they come
        // back once this frame has completed on the GPU.
        assert_eq!(h.frame(&[b]), vec![None]);
        assert_eq!(h.cache.slot_state(0), SlotState::Uploading);
        assert_eq!(h.cache.stats().evictions, 1);
        assert_eq!(h.frame(&[b]), vec![None]);
        assert!(matches!(
            h.frame(&[b])[0],
            Some(DrawOutcome::Drawn { stale: false, .. })
        ));
    }

    /// Every other cell of a 4³ chunk: 32 isolated cubes, 4608 index bytes.
    fn checkerboard() -> Vec<(i32, i32, i32, MaterialId)> {
        let mut cells = Vec::new();
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    if (x + y + z) % 2 == 0 {
                        cells.push((x, y, z, 1));
                    }
                }
            }
        }
        cells
    }

    #[test]
    fn test_oversized_chunk_does_not_block_other_uploads() {
        let mut h = Harness::new(4, 256);
        let (big, small) = (id(0), id(1));
        assert!(h.cache.install_mesh(mesh_of(big, 1, &checkerboard())));
        h.install_cube(small, 1);
        assert_eq!(h.cache.mesh(big).unwrap().index_bytes().len(), 4608);

        h.cache
            .begin_frame(&mut h.device, Point3::new(0.0, 0.0, 0.0))
            .unwrap();
        assert!(matches!(
            h.cache.request_draw(&mut h.device, big),
            Err(StreamingError::UploadTooLarge {
                rung_size: 4096,
                blocks: 72,
                ..
            })
        ));
        assert!(matches!(
            h.cache.request_draw(&mut h.device, small),
            Ok(DrawOutcome::Drawn { stale: false, .. })
        ));
        let stats = h.cache.end_frame(&mut h.device, &mut h.submitter).unwrap();
        assert!(!stats.upload_blocked);
        h.device.complete_all();

        for _ in 0..5 {
            let outcomes = h.frame(&[big, small]);
            assert_eq!(outcomes[0], None);
            assert!(matches!(
                outcomes[1],
                Some(DrawOutcome::Drawn { stale: false, .. })
            ));
        }
        assert_eq!(h.cache.lookup(big), Lookup::Miss);
        assert_eq!(h.cache.stats().uploads, 1);
        assert_eq!(h.cache.stats().oversized_rejections, 6);
    }

    #[test]
    fn test_oversized_rebuild_releases_its_slot() {
        let mut h = Harness::new(2, 256);
        let chunk = id(0);
        h.install_cube(chunk, 1);
        h.frame(&[chunk]);
        let Lookup::Hit(slot) = h.cache.lookup(chunk) else {
            panic!("chunk not resident");
        };
        let geometry = h.submitter.last_output().unwrap().draws[0].geometry;

        assert!(h.cache.install_mesh(mesh_of(chunk, 2, &checkerboard())));
        assert_eq!(h.frame(&[chunk]), vec![None]);
        assert_eq!(h.cache.lookup(chunk), Lookup::Miss);
        assert_eq!(h.cache.slot_state(slot), SlotState::Empty);
        assert_eq!(h.cache.pending_deletions(), 2);

        h.frame(&[]);
        h.frame(&[]);
        assert!(h.device.buffer_contents(geometry).is_none());
        assert_eq!(h.cache.allocator().free_block_count(), 256);

        // A smaller rebuild brings the chunk back.
        h.install_cube(chunk, 3);
        assert!(matches!(
            h.frame(&[chunk])[0],
            Some(DrawOutcome::Drawn { stale: false, .. })
        ));
    }

    #[test]
    fn test_rebuilt_chunk_keeps_its_slot() {
        let mut h = Harness::new(2, 32);
        let chunk = id(0);
        h.install_cube(chunk, 1);
        h.frame(&[chunk]);
        let Lookup::Hit(slot) = h.cache.lookup(chunk) else {
            panic!("chunk not resident");
        };
        let old_geometry = h.submitter.last_output().unwrap().draws[0].geometry;

        assert!(h
            .cache
            .install_mesh(mesh_of(chunk, 2, &[(0, 0, 0, 1), (1, 0, 0, 1)])));
        assert_eq!(h.cache.slot_state(slot), SlotState::Uploading);

        assert_eq!(
            h.frame(&[chunk]),
            vec![Some(DrawOutcome::Drawn { slot, stale: false })]
        );
        assert_eq!(h.cache.stats().evictions, 0);
        let new_geometry = h.submitter.last_output().unwrap().draws[0].geometry;
        assert_ne!(old_geometry, new_geometry);

        // Retired in frame 2, released once frame 2 is known complete.
        assert!(h.device.buffer_contents(old_geometry).is_some());
        h.frame(&[]);
        h.frame(&[]);
        assert!(h.device.buffer_contents(old_geometry).is_none());
    }

    #[test]
    fn test_stale_mesh_is_discarded() {
        let mut h = Harness::new(1, 32);
        h.install_cube(id(0), 3);
        assert!(!h.cache.install_mesh(mesh_of(id(0), 2, &[(1, 1, 1, 1)])));
        assert!(!h.cache.install_mesh(mesh_of(id(0), 3, &[(1, 1, 1, 1)])));
        assert_eq!(h.cache.stats().stale_meshes_discarded, 2);

        let mut recreated = mesh_of(id(0), 1, &[(2, 2, 2, 1)]);
        recreated.instance = 2;
        assert!(h.cache.install_mesh(recreated));
    }

    #[test]
    fn test_evicted_blocks_wait_for_gpu() {
        let mut h = Harness::new(1, 32);
        h.install_cube(id(0), 1);
        h.install_cube(id(1), 1);

        h.frame(&[id(0)]);
        assert_eq!(h.cache.allocator().free_block_count(), 29);

        // Frame 2 evicts chunk 0; its blocks are retired, not freed.
        h.frame(&[id(1)]);
        assert_eq!(h.cache.allocator().free_block_count(), 26);
        assert_eq!(h.cache.pending_deletions(), 2);

        // Frame 3 reuses frame 1's rung: only frame 1 is known complete.
        h.frame(&[]);
        assert_eq!(h.cache.completed_frame(), 1);
        assert_eq!(h.cache.allocator().free_block_count(), 26);

        h.frame(&[]);
        assert_eq!(h.cache.completed_frame(), 2);
        assert_eq!(h.cache.allocator().free_block_count(), 29);
        assert_eq!(h.cache.pending_deletions(), 0);
    }

    #[test]
    fn test_repeated_request_draws_once() {
        let mut h = Harness::new(2, 32);
        h.install_cube(id(0), 1);
        let outcomes = h.frame(&[id(0), id(0)]);
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(h.submitter.last_output().unwrap().draws.len(), 1);
        assert_eq!(h.cache.stats().uploads, 1);
    }

    #[test]
    fn test_frame_protocol_is_enforced() {
        let mut h = Harness::new(1, 8);
        assert!(matches!(
            h.cache.request_draw(&mut h.device, id(0)),
            Err(StreamingError::FrameState(_))
        ));
        assert!(matches!(
            h.cache.end_frame(&mut h.device, &mut h.submitter),
            Err(StreamingError::FrameState(_))
        ));
        h.cache
            .begin_frame(&mut h.device, Point3::new(0.0, 0.0, 0.0))
            .unwrap();
        assert!(h.cache.is_frame_open());
        assert!(matches!(
            h.cache.begin_frame(&mut h.device, Point3::new(0.0, 0.0, 0.0)),
            Err(StreamingError::FrameState(_))
        ));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut h = Harness::new(1, 32);
        h.install_cube(id(0), 1);
        h.install_cube(id(1), 1);
        h.frame(&[id(0)]);
        h.frame(&[id(1)]);

        let Harness {
            mut device, cache, ..
        } = h;
        cache.shutdown(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }
}
