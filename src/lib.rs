#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Voxel Streamer
//!
//! GPU resource streaming for sparse, editable voxel worlds.
//!
//! Voxel edits go in. The crate meshes dirty chunks on worker threads, keeps a
//! bounded pool of GPU-resident chunk meshes under LRU eviction, and hands each
//! frame's uploads and draw records to the caller's renderer. CPU writes are
//! synchronised against in-flight GPU reads with fenced staging rungs, and
//! nothing the GPU may still read is freed before its frame has completed.
//!
//! ## Key Modules
//!
//! * `config` - Engine configuration, loadable from JSON
//! * `core` - Shared-resource wrappers used across threads
//! * `engine_state` - The streaming engine: GPU memory, meshing, workers and voxels
//! * `error` - The crate error type
//!
//! ## Usage
//!
//! ```no_run
//! fn main() {
//!     voxel_streamer::run();
//! }
//! ```
//!
//! Library users build a [`engine_state::StreamingEngine`] over their own
//! [`engine_state::gpu::GpuDevice`] and [`engine_state::rendering::DrawSubmitter`].

use cgmath::Point3;
use log::{error, info, warn};

use config::StreamerConfig;
use engine_state::{
    gpu::{GpuDevice, SoftwareDevice, SoftwareSubmitter, WgpuCopySubmitter, WgpuDevice},
    rendering::DrawSubmitter,
    voxels::{
        terrain::{TerrainGenerator, TERRAIN_PALETTE},
        world::VoxelEdit,
    },
    StreamingEngine,
};
use error::Result;

pub mod config;
pub mod core;
pub mod engine_state;
pub mod error;

/// Chunks generated along X and Z by the demo.
const DEMO_WORLD_RADIUS: i32 = 2;
/// Frames rendered by the demo.
const DEMO_FRAMES: u64 = 8;
/// Random edits applied between demo frames.
const DEMO_EDITS_PER_FRAME: usize = 64;
const DEMO_SETTLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Runs the headless streaming demo.
///
/// Reads an optional JSON configuration path from the first command-line
/// argument. Streams through wgpu when an adapter is available, otherwise
/// through the software device.
pub fn run() {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    info!("Logger initialized");

    let config = match load_config(std::env::args().nth(1)) {
        Ok(config) => config,
        Err(err) => {
            error!("Could not load configuration: {err}");
            return;
        }
    };

    let result = match pollster::block_on(WgpuDevice::request_headless()) {
        Ok(device) => {
            info!("Streaming through wgpu");
            stream_demo(config, device, &mut WgpuCopySubmitter::default())
        }
        Err(err) => {
            warn!("{err}; streaming through the software device instead");
            let device = SoftwareDevice::new().with_latency(config.staging_rungs.saturating_sub(1) as u64);
            stream_demo(config, device, &mut SoftwareSubmitter::new())
        }
    };

    if let Err(err) = result {
        error!("Demo failed: {err}");
    }
}

fn load_config(path: Option<String>) -> Result<StreamerConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            StreamerConfig::from_json(&std::fs::read_to_string(path)?)
        }
        None => Ok(StreamerConfig::default()),
    }
}

/// Generates terrain, then renders a few frames while digging random holes.
fn stream_demo<D, S>(config: StreamerConfig, device: D, submitter: &mut S) -> Result<()>
where
    D: GpuDevice,
    S: DrawSubmitter<D>,
{
    let side = config.chunk_side as i32;
    let mut engine = StreamingEngine::new(config, device)?;
    for material in TERRAIN_PALETTE {
        engine.register_material(material)?;
    }

    let terrain = TerrainGenerator::new(0);
    let range = -DEMO_WORLD_RADIUS..DEMO_WORLD_RADIUS;
    for x in range.clone() {
        for y in -1..1 {
            for z in range.clone() {
                let edits = terrain.chunk_edits(Point3::new(x, y, z), side as usize);
                engine.apply_edits(&edits);
            }
        }
    }
    if !engine.wait_for_rebuilds(DEMO_SETTLE_TIMEOUT) {
        warn!("Terrain still meshing after {DEMO_SETTLE_TIMEOUT:?}");
    }

    let extent = DEMO_WORLD_RADIUS * side;
    let mut rng = fastrand::Rng::with_seed(0xC0FFEE);
    for frame in 0..DEMO_FRAMES {
        let edits: Vec<VoxelEdit> = (0..DEMO_EDITS_PER_FRAME)
            .map(|_| {
                VoxelEdit::new(
                    rng.i32(-extent..extent),
                    rng.i32(-side..side),
                    rng.i32(-extent..extent),
                    0,
                )
            })
            .collect();
        engine.apply_edits(&edits);
        engine.update();

        let angle = frame as f32 / DEMO_FRAMES as f32 * std::f32::consts::TAU;
        let radius = extent as f32;
        let viewer = Point3::new(radius * angle.cos(), side as f32, radius * angle.sin());
        let visible = engine.world().chunk_ids();
        let stats = engine.render_frame(&visible, viewer, submitter)?;
        info!(
            "Frame {}: {} draws, {} uploads ({} bytes staged), {} evictions, {} released",
            stats.frame,
            stats.draws,
            stats.uploads,
            stats.staged_bytes,
            stats.evictions,
            stats.released
        );
    }

    let stats = engine.stats();
    info!(
        "{} chunks, {} rebuilds ({} stale results discarded), cache {:?}",
        stats.chunks, stats.rebuilds_dispatched, stats.stale_results_discarded, stats.cache
    );
    engine.shutdown()?;
    Ok(())
}
