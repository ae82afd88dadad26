//! # Engine State Module
//!
//! The streaming engine: editable voxel world in, GPU-resident chunk meshes
//! and per-frame draw records out.
//!
//! ## Key Components
//!
//! * `StreamingEngine` - Ties the subsystems together and drives them per frame
//! * `gpu` - Device interface, block allocator, fenced staging ring, deferred deletion
//! * `rendering` - Mesher, mesh cache and the background mesh generation task
//! * `task_management` - Worker pool for off-thread rebuilds
//! * `voxels` - Materials, chunks and the sparse world
//!
//! ## Frame Loop
//!
//! ```text
//! apply_edits ──► chunks dirty ──► update() ──► mesher workers
//!                                     ▲               │
//!                                     └── meshes ◄────┘
//! render_frame: begin_frame ─► request_draw × visible ─► end_frame ─► submitter
//! ```
//!
//! Everything except the mesher workers runs on the thread that owns the
//! engine.

use std::collections::HashMap;
use std::time::Duration;

use cgmath::Point3;
use log::{debug, info, trace, warn};

use crate::{
    config::StreamerConfig,
    error::{Result, StreamingError},
};
use gpu::GpuDevice;
use rendering::{
    meshing::mesh::PackedMesh, tasks::chunk_mesh_generation_task::ChunkMeshGenerationTask,
    CacheStats, ChunkMeshCache, DrawOutcome, DrawSubmitter, FrameStats, Material, MaterialTable,
};
use task_management::{TaskId, TaskManager, TaskResult};
use voxels::{
    block::MaterialId,
    chunk::ChunkId,
    world::{EditSummary, VoxelEdit, World},
};

pub mod gpu;
pub mod rendering;
pub mod task_management;
pub mod voxels;

/// Counters of the rebuild pipeline, plus the cache's own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub chunks: usize,
    pub rebuilds_dispatched: u64,
    /// Rebuilds whose task panicked; the chunk keeps its last mesh until edited again
    pub rebuilds_failed: u64,
    pub rebuilds_in_flight: usize,
    pub meshes_installed: u64,
    /// Results for chunks that were destroyed, or older than the held mesh
    pub stale_results_discarded: u64,
    pub cache: CacheStats,
}

/// The voxel streaming engine.
///
/// # Examples
///
/// ```
/// use cgmath::Point3;
/// use voxel_streamer::config::StreamerConfig;
/// use voxel_streamer::engine_state::{
///     gpu::{SoftwareDevice, SoftwareSubmitter},
///     voxels::world::VoxelEdit,
///     StreamingEngine,
/// };
///
/// let config = StreamerConfig {
///     chunk_side: 8,
///     cache_capacity: 16,
///     index_block_count: 64,
///     staging_rung_size: 1 << 20,
///     worker_threads: 1,
///     ..Default::default()
/// };
/// let mut engine = StreamingEngine::new(config, SoftwareDevice::new().with_latency(0)).unwrap();
/// let mut submitter = SoftwareSubmitter::new();
///
/// engine.apply_edits(&[VoxelEdit::new(1, 2, 3, 1)]);
/// assert!(engine.wait_for_rebuilds(std::time::Duration::from_secs(5)));
///
/// let visible = engine.world().chunk_ids();
/// let stats = engine
///     .render_frame(&visible, Point3::new(0.0, 0.0, 0.0), &mut submitter)
///     .unwrap();
/// assert_eq!(stats.draws, 1);
/// ```
pub struct StreamingEngine<D: GpuDevice> {
    config: StreamerConfig,
    device: D,
    world: World,
    cache: ChunkMeshCache,
    materials: MaterialTable,
    task_manager: TaskManager<PackedMesh>,
    /// Chunks with a rebuild on a worker, and the task running it
    in_flight: HashMap<ChunkId, TaskId>,
    rebuilds_dispatched: u64,
    rebuilds_failed: u64,
    meshes_installed: u64,
    stale_results_discarded: u64,
}

impl<D: GpuDevice> StreamingEngine<D> {
    /// Validates the configuration and builds every subsystem.
    ///
    /// # Arguments
    /// * `config` - Engine configuration
    /// * `device` - Device all GPU resources are allocated from
    ///
    /// # Returns
    /// The engine, or `InvalidConfig`/`DeviceAllocation` on failure
    pub fn new(config: StreamerConfig, mut device: D) -> Result<Self> {
        config.validate()?;
        let cache = ChunkMeshCache::new(&mut device, &config)?;
        let materials = match MaterialTable::new(&mut device, config.material_capacity) {
            Ok(materials) => materials,
            Err(err) => {
                cache.shutdown(&mut device)?;
                return Err(err);
            }
        };
        let world = World::new(config.chunk_side, config.missing_neighbor_policy);
        let task_manager = TaskManager::new(config.worker_threads);

        info!(
            "Streaming engine ready: {}³ chunks, {} cache slots, {:?} missing-neighbor policy",
            config.chunk_side, config.cache_capacity, config.missing_neighbor_policy
        );

        Ok(Self {
            config,
            device,
            world,
            cache,
            materials,
            task_manager,
            in_flight: HashMap::new(),
            rebuilds_dispatched: 0,
            rebuilds_failed: 0,
            meshes_installed: 0,
            stale_results_discarded: 0,
        })
    }

    /// Applies a batch of voxel edits to the world.
    ///
    /// Affected chunks are only marked dirty; rebuilds start on the next
    /// [`Self::update`].
    pub fn apply_edits(&mut self, edits: &[VoxelEdit]) -> EditSummary {
        let summary = self.world.apply_edits(edits);
        trace!(
            "Applied {} edits: {} cells changed, {} chunks created",
            edits.len(),
            summary.changed,
            summary.created
        );
        summary
    }

    /// Destroys a chunk and forgets its mesh.
    ///
    /// A rebuild still running for it is discarded when it completes.
    pub fn remove_chunk(&mut self, chunk: ChunkId) -> bool {
        let removed = self.world.remove_chunk(chunk);
        self.cache.forget_mesh(chunk);
        removed
    }

    /// Collects finished rebuilds and starts new ones.
    ///
    /// A result is installed only if its chunk still exists as the same
    /// instance; the cache then keeps only the newest generation. A rebuild
    /// that panicked frees its chunk for the next edit. Every dirty chunk
    /// without a rebuild in flight is cleaned and handed to a worker.
    /// Call once per frame, outside `begin_frame`/`end_frame`.
    pub fn update(&mut self) {
        for result in self.task_manager.process_completed_tasks() {
            let mesh = match result {
                TaskResult::Done(_, mesh) => mesh,
                TaskResult::Panicked(task) => {
                    self.in_flight.retain(|_, in_flight| *in_flight != task);
                    self.rebuilds_failed += 1;
                    continue;
                }
            };
            self.in_flight.remove(&mesh.chunk);
            let live_instance = self
                .world
                .get_chunk_at(mesh.chunk)
                .map(|chunk| chunk.get().instance());
            if live_instance != Some(mesh.instance) {
                self.stale_results_discarded += 1;
                debug!(
                    "Discarded rebuild of chunk {:?}: instance {} no longer exists",
                    mesh.chunk, mesh.instance
                );
                continue;
            }
            if self.cache.install_mesh(mesh) {
                self.meshes_installed += 1;
            } else {
                self.stale_results_discarded += 1;
            }
        }

        let index_block_words = (self.config.index_block_size / 4) as usize;
        for id in self.world.dirty_chunks() {
            if self.in_flight.contains_key(&id) {
                continue;
            }
            let Some(chunk) = self.world.get_chunk_at(id) else {
                continue;
            };
            chunk.get_mut().clear_dirty();
            let task = self.task_manager.publish_task(Box::new(ChunkMeshGenerationTask::new(
                chunk,
                self.world.neighbors_of(id),
                self.world.policy(),
                index_block_words,
            )));
            self.in_flight.insert(id, task);
            self.rebuilds_dispatched += 1;
        }
        self.task_manager.process_queued_tasks();
    }

    /// Whether every dirty chunk has been rebuilt and installed.
    pub fn is_settled(&self) -> bool {
        self.in_flight.is_empty() && self.world.dirty_chunks().is_empty()
    }

    /// Runs [`Self::update`] until the engine is settled or `timeout` passes.
    ///
    /// # Returns
    /// `true` if the engine settled in time
    pub fn wait_for_rebuilds(&mut self, timeout: Duration) -> bool {
        let start = web_time::Instant::now();
        loop {
            self.update();
            if self.is_settled() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Adds a material to the material table.
    ///
    /// The entry is uploaded at the start of the next frame.
    pub fn register_material(&mut self, material: Material) -> Result<MaterialId> {
        self.materials.register(material)
    }

    /// Starts a frame; see [`ChunkMeshCache::begin_frame`].
    ///
    /// Materials registered since the last frame are staged first. If the
    /// rung cannot take them they wait for the next frame.
    pub fn begin_frame(&mut self, viewer: Point3<f32>) -> Result<u64> {
        let frame = self.cache.begin_frame(&mut self.device, viewer)?;
        match self.materials.stage(&mut self.cache) {
            Ok(0) => {}
            Ok(staged) => trace!("Staged {staged} material entries in frame {frame}"),
            Err(err) => warn!("Material upload deferred: {err}"),
        }
        Ok(frame)
    }

    /// See [`ChunkMeshCache::request_draw`].
    pub fn request_draw(&mut self, chunk: ChunkId) -> Result<DrawOutcome> {
        self.cache.request_draw(&mut self.device, chunk)
    }

    /// See [`ChunkMeshCache::end_frame`].
    pub fn end_frame<S: DrawSubmitter<D> + ?Sized>(
        &mut self,
        submitter: &mut S,
    ) -> Result<FrameStats> {
        self.cache.end_frame(&mut self.device, submitter)
    }

    /// Runs one whole frame over the visible chunks.
    ///
    /// Capacity failures only defer uploads and an oversized chunk is only
    /// skipped; neither fails the frame. Any other request error still closes
    /// the frame before it is returned.
    ///
    /// # Arguments
    /// * `visible` - Chunks to draw, in request order
    /// * `viewer` - World-space eye position used for draw ordering
    /// * `submitter` - Receives the frame's copies and draw records
    pub fn render_frame<S: DrawSubmitter<D> + ?Sized>(
        &mut self,
        visible: &[ChunkId],
        viewer: Point3<f32>,
        submitter: &mut S,
    ) -> Result<FrameStats> {
        self.begin_frame(viewer)?;

        let mut failure: Option<StreamingError> = None;
        for &chunk in visible {
            match self.request_draw(chunk) {
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let stats = self.end_frame(submitter);
        match failure {
            Some(err) => Err(err),
            None => stats,
        }
    }

    /// Waits for the GPU, releases every resource and hands the device back.
    pub fn shutdown(self) -> Result<D> {
        let StreamingEngine {
            mut device,
            cache,
            materials,
            ..
        } = self;
        cache.shutdown(&mut device)?;
        materials.release(&mut device);
        info!("Streaming engine shut down");
        Ok(device)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            chunks: self.world.chunk_count(),
            rebuilds_dispatched: self.rebuilds_dispatched,
            rebuilds_failed: self.rebuilds_failed,
            rebuilds_in_flight: self.in_flight.len(),
            meshes_installed: self.meshes_installed,
            stale_results_discarded: self.stale_results_discarded,
            cache: self.cache.stats(),
        }
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn cache(&self) -> &ChunkMeshCache {
        &self.cache
    }

    pub fn materials(&self) -> &MaterialTable {
        &self.materials
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_state::gpu::{SoftwareDevice, SoftwareSubmitter};

    const SETTLE: Duration = Duration::from_secs(10);

    fn config() -> StreamerConfig {
        StreamerConfig {
            chunk_side: 4,
            cache_capacity: 8,
            index_block_size: 256,
            index_block_count: 64,
            staging_rungs: 2,
            staging_rung_size: 16 * 1024,
            fence_timeout_ms: 5,
            deletion_queue_capacity: 64,
            worker_threads: 2,
            ..Default::default()
        }
    }

    fn engine() -> StreamingEngine<SoftwareDevice> {
        StreamingEngine::new(config(), SoftwareDevice::new().with_latency(0)).unwrap()
    }

    fn origin() -> Point3<f32> {
        Point3::new(0.0, 0.0, 0.0)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = StreamerConfig {
            staging_rungs: 0,
            ..config()
        };
        assert!(matches!(
            StreamingEngine::new(config, SoftwareDevice::new()),
            Err(StreamingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_edits_become_draws() {
        let mut engine = engine();
        let mut submitter = SoftwareSubmitter::new();
        engine.apply_edits(&[
            VoxelEdit::new(0, 0, 0, 1),
            VoxelEdit::new(9, 0, 0, 2),
            VoxelEdit::new(9, 0, 0, 0),
        ]);
        assert_eq!(engine.world().chunk_count(), 2);
        assert!(engine.wait_for_rebuilds(SETTLE));

        let visible = [Point3::new(0, 0, 0), Point3::new(2, 0, 0), Point3::new(5, 5, 5)];
        engine.begin_frame(origin()).unwrap();
        let outcomes: Vec<DrawOutcome> = visible
            .iter()
            .map(|&chunk| engine.request_draw(chunk).unwrap())
            .collect();
        let stats = engine.end_frame(&mut submitter).unwrap();

        assert!(matches!(outcomes[0], DrawOutcome::Drawn { stale: false, .. }));
        assert_eq!(outcomes[1], DrawOutcome::Empty);
        assert_eq!(outcomes[2], DrawOutcome::NotMeshed);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.uploads, 1);

        let output = submitter.last_output().unwrap();
        assert_eq!(output.draws[0].index_count(), 36);
        assert_eq!(engine.stats().meshes_installed, 2);
    }

    #[test]
    fn test_border_edit_remeshes_neighbor() {
        let mut engine = engine();
        engine.apply_edits(&[VoxelEdit::new(3, 0, 0, 1)]);
        assert!(engine.wait_for_rebuilds(SETTLE));
        let chunk = Point3::new(0, 0, 0);
        assert_eq!(engine.cache().mesh(chunk).unwrap().face_count, 6);

        engine.apply_edits(&[VoxelEdit::new(4, 0, 0, 1)]);
        assert!(engine.wait_for_rebuilds(SETTLE));
        assert_eq!(engine.cache().mesh(chunk).unwrap().face_count, 5);
        assert_eq!(
            engine.cache().mesh(Point3::new(1, 0, 0)).unwrap().face_count,
            5
        );
    }

    #[test]
    fn test_newest_generation_wins() {
        let mut engine = engine();
        let chunk = Point3::new(0, 0, 0);
        engine.apply_edits(&[VoxelEdit::new(1, 1, 1, 1)]);
        engine.update();
        // The chunk is dirty again while its first rebuild is in flight.
        engine.apply_edits(&[VoxelEdit::new(2, 1, 1, 1)]);
        assert!(engine.wait_for_rebuilds(SETTLE));

        let generation = engine.world().get_chunk_at(chunk).unwrap().get().generation();
        let mesh = engine.cache().mesh(chunk).unwrap();
        assert_eq!(mesh.generation, generation);
        assert_eq!(mesh.face_count, 10);
        assert_eq!(engine.stats().rebuilds_dispatched, 2);
    }

    #[test]
    fn test_result_for_destroyed_chunk_is_discarded() {
        let mut engine = engine();
        let chunk = Point3::new(0, 0, 0);
        engine.apply_edits(&[VoxelEdit::new(1, 1, 1, 1)]);
        engine.update();

        assert!(engine.remove_chunk(chunk));
        engine.apply_edits(&[VoxelEdit::new(2, 2, 2, 1)]);
        let instance = engine.world().get_chunk_at(chunk).unwrap().get().instance();
        assert!(engine.wait_for_rebuilds(SETTLE));

        assert_eq!(engine.stats().stale_results_discarded, 1);
        assert_eq!(engine.cache().mesh(chunk).unwrap().instance, instance);
    }

    #[test]
    fn test_registered_materials_upload_with_next_frame() {
        let mut engine = engine();
        let mut submitter = SoftwareSubmitter::new();
        let glow = Material {
            color: [1.0, 0.5, 0.0],
            roughness: 0.3,
            specular: [0.2, 0.2, 0.2],
            emissive: 15.0,
        };
        assert_eq!(engine.register_material(Material::default()).unwrap(), 1);
        assert_eq!(engine.register_material(glow).unwrap(), 2);
        assert!(engine.materials().has_unstaged());

        let stats = engine.render_frame(&[], origin(), &mut submitter).unwrap();
        assert_eq!(stats.copies, 1);
        assert!(!engine.materials().has_unstaged());

        let buffer = engine.materials().buffer();
        let contents = engine.device().buffer_contents(buffer).unwrap();
        assert_eq!(&contents[64..96], bytemuck::bytes_of(&glow));
    }

    #[test]
    fn test_lost_device_surfaces_fence_timeout() {
        let mut engine =
            StreamingEngine::new(config(), SoftwareDevice::new()).unwrap();
        let mut submitter = SoftwareSubmitter::new();
        engine.device_mut().set_hung(true);

        engine.render_frame(&[], origin(), &mut submitter).unwrap();
        engine.render_frame(&[], origin(), &mut submitter).unwrap();
        assert!(matches!(
            engine.render_frame(&[], origin(), &mut submitter),
            Err(StreamingError::FenceTimeout { rung: 0, .. })
        ));

        engine.device_mut().set_hung(false);
        engine.device_mut().complete_all();
        assert!(engine.render_frame(&[], origin(), &mut submitter).is_ok());
    }

    #[test]
    fn test_shutdown_leaves_nothing_alive() {
        let mut engine = engine();
        let mut submitter = SoftwareSubmitter::new();
        let edits: Vec<VoxelEdit> = (0..12).map(|x| VoxelEdit::new(x, 0, 0, 1)).collect();
        engine.apply_edits(&edits);
        assert!(engine.wait_for_rebuilds(SETTLE));

        let visible = engine.world().chunk_ids();
        for _ in 0..3 {
            engine.render_frame(&visible, origin(), &mut submitter).unwrap();
        }
        assert!(engine.device().live_buffer_count() > 3);

        let device = engine.shutdown().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }
}
