//! # Streamer Configuration
//!
//! Tunables for the streaming engine, loadable from JSON. Every field has a
//! default, so a partial document only overrides what it names:
//!
//! ```json
//! { "cache_capacity": 4096, "staging_rungs": 4, "missing_neighbor_policy": "solid" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    engine_state::rendering::{
        material_table::{MATERIAL_SIZE, MAX_MATERIAL_CAPACITY},
        meshing::mesh::INDICES_PER_FACE,
        vertex::{PackedVertex, DRAW_PARAMS_SIZE},
    },
    error::{Result, StreamingError},
};

/// Largest supported chunk side.
///
/// A chunk has (S + 1)³ distinct corners and index words address them with
/// 16 bits, so S + 1 must stay at or below 40.
pub const MAX_CHUNK_SIDE: usize = 39;

/// How the mesher treats halo cells whose neighboring chunk does not exist.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingNeighborPolicy {
    /// Absent neighbors are empty space, so boundary faces are emitted.
    #[default]
    Empty,
    /// Absent neighbors are solid, so boundary faces are suppressed.
    Solid,
}

/// Configuration for a [`StreamingEngine`](crate::engine_state::StreamingEngine).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StreamerConfig {
    /// Side length S of a cubic chunk, in cells.
    pub chunk_side: usize,
    /// Number of GPU mesh slots C.
    pub cache_capacity: usize,
    /// Size in bytes of one index block.
    pub index_block_size: u64,
    /// Number of index blocks in the shared index buffer.
    pub index_block_count: usize,
    /// Number of staging rungs N.
    pub staging_rungs: usize,
    /// Size in bytes of one staging rung.
    pub staging_rung_size: u64,
    /// Upper bound on the spin-wait for a rung's fence.
    pub fence_timeout_ms: u64,
    /// Capacity of the deferred-deletion ring.
    pub deletion_queue_capacity: usize,
    /// Number of background mesher threads.
    pub worker_threads: usize,
    /// Halo policy for chunks without a neighbor.
    pub missing_neighbor_policy: MissingNeighborPolicy,
    /// Sort draw records front-to-back from the viewer.
    pub sort_draws_by_distance: bool,
    /// Entries in the material table, `AIR` included.
    pub material_capacity: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            chunk_side: 32,
            cache_capacity: 16 * 1024,
            index_block_size: 1024 * 12,
            index_block_count: 16 * 1024,
            staging_rungs: 3,
            staging_rung_size: 4 * 1024 * 1024,
            fence_timeout_ms: 2000,
            deletion_queue_capacity: 4096,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            missing_neighbor_policy: MissingNeighborPolicy::Empty,
            sort_draws_by_distance: true,
            material_capacity: 256,
        }
    }
}

impl StreamerConfig {
    /// Parses a JSON document and validates the result.
    ///
    /// # Arguments
    /// * `json` - Configuration text; missing fields take their defaults
    ///
    /// # Returns
    /// The validated configuration, or `Config`/`InvalidConfig` on failure
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StreamerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is within the range the engine supports.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_side == 0 || self.chunk_side > MAX_CHUNK_SIDE {
            return Err(StreamingError::InvalidConfig(format!(
                "chunk_side must be in 1..={MAX_CHUNK_SIDE}, got {}",
                self.chunk_side
            )));
        }
        let counts = [
            ("cache_capacity", self.cache_capacity),
            ("index_block_count", self.index_block_count),
            ("staging_rungs", self.staging_rungs),
            ("deletion_queue_capacity", self.deletion_queue_capacity),
            ("worker_threads", self.worker_threads),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(StreamingError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        for (name, value) in [
            ("index_block_size", self.index_block_size),
            ("staging_rung_size", self.staging_rung_size),
        ] {
            if value == 0 || value % 4 != 0 {
                return Err(StreamingError::InvalidConfig(format!(
                    "{name} must be a non-zero multiple of 4, got {value}"
                )));
            }
        }

        if !(2..=MAX_MATERIAL_CAPACITY).contains(&self.material_capacity) {
            return Err(StreamingError::InvalidConfig(format!(
                "material_capacity must be in 2..={MAX_MATERIAL_CAPACITY}, got {}",
                self.material_capacity
            )));
        }
        let material_bytes = self.material_capacity as u64 * MATERIAL_SIZE;
        if self.staging_rung_size < material_bytes {
            return Err(StreamingError::InvalidConfig(format!(
                "staging_rung_size must hold the whole material table ({material_bytes} bytes), got {}",
                self.staging_rung_size
            )));
        }

        let worst_upload = self.max_chunk_upload_bytes();
        if self.staging_rung_size < worst_upload {
            return Err(StreamingError::InvalidConfig(format!(
                "staging_rung_size must hold the largest upload of a {side}³ chunk \
                 ({worst_upload} bytes), got {}",
                self.staging_rung_size,
                side = self.chunk_side,
            )));
        }
        let worst_blocks = self.max_chunk_index_blocks();
        if self.index_block_count < worst_blocks {
            return Err(StreamingError::InvalidConfig(format!(
                "index_block_count must cover the largest mesh of a {side}³ chunk \
                 ({worst_blocks} blocks), got {}",
                self.index_block_count,
                side = self.chunk_side,
            )));
        }
        Ok(())
    }

    /// Most faces a chunk can produce.
    ///
    /// Each of the 3·S²·(S + 1) unit faces of the grid separates at most one
    /// solid cell from air, halo included.
    pub fn max_chunk_faces(&self) -> u64 {
        let side = self.chunk_side as u64;
        3 * side * side * (side + 1)
    }

    /// Index blocks taken by the largest possible chunk mesh.
    pub fn max_chunk_index_blocks(&self) -> usize {
        let index_bytes = self.max_chunk_faces() * (INDICES_PER_FACE * 4) as u64;
        index_bytes.div_ceil(self.index_block_size.max(1)) as usize
    }

    /// Staging bytes taken by the largest possible chunk upload: every corner
    /// as a vertex, every face, and one draw-parameter record per block.
    pub fn max_chunk_upload_bytes(&self) -> u64 {
        let corners = (self.chunk_side as u64 + 1).pow(3);
        corners * std::mem::size_of::<PackedVertex>() as u64
            + self.max_chunk_faces() * (INDICES_PER_FACE * 4) as u64
            + self.max_chunk_index_blocks() as u64 * DRAW_PARAMS_SIZE
    }

    /// The configured fence wait as a [`Duration`].
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}
