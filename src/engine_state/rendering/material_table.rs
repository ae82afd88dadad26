//! # Material Table
//!
//! Shading properties per [`MaterialId`], mirrored into a device buffer the
//! caller's shaders index with the material half of each index word.
//!
//! Id 0 is [`AIR`] and never registered; its entry stays zeroed. New entries
//! are staged through the cache's staging ring at the start of the next
//! frame, so they reach the GPU together with that frame's chunk uploads.

use log::{debug, trace};

use super::meshing::ChunkMeshCache;
use crate::{
    engine_state::{
        gpu::{BufferHandle, BufferKind, GpuDevice},
        voxels::block::{MaterialId, AIR, HALO_SOLID},
    },
    error::{Result, StreamingError},
};

/// Name of the material table buffer
pub const MATERIAL_BUFFER_NAME: &str = "Voxel Materials";

/// Shading properties of one material.
///
/// # Memory Layout
/// - color: [f32; 3], then roughness: f32
/// - specular: [f32; 3], then emissive: f32 (watts)
///
/// Total size: 32 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Material {
    pub color: [f32; 3],
    pub roughness: f32,
    pub specular: [f32; 3],
    /// Emitted power in watts; 0 for non-emissive materials
    pub emissive: f32,
}

/// Size of one [`Material`] entry in the material buffer.
pub const MATERIAL_SIZE: u64 = std::mem::size_of::<Material>() as u64;

/// Largest table capacity: every id below [`HALO_SOLID`].
pub const MAX_MATERIAL_CAPACITY: usize = HALO_SOLID as usize;

/// Registered materials and their GPU copy.
pub struct MaterialTable {
    buffer: BufferHandle,
    /// Entry 0 is `AIR`
    entries: Vec<Material>,
    capacity: usize,
    /// First entry not yet staged
    unstaged_from: Option<usize>,
}

impl MaterialTable {
    /// Allocates a zeroed device buffer of `capacity` entries.
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D, capacity: usize) -> Result<Self> {
        let buffer = device.allocate_device_buffer(
            MATERIAL_BUFFER_NAME,
            capacity as u64 * MATERIAL_SIZE,
            BufferKind::Materials,
        )?;
        debug!("Created material table with room for {capacity} entries");
        Ok(Self {
            buffer,
            entries: vec![Material::default()],
            capacity,
            unstaged_from: None,
        })
    }

    /// Adds a material and returns its id. Ids are handed out from 1 upwards.
    ///
    /// # Returns
    /// `MaterialTableFull` once every id of the table is taken
    pub fn register(&mut self, material: Material) -> Result<MaterialId> {
        if self.entries.len() >= self.capacity {
            return Err(StreamingError::MaterialTableFull {
                capacity: self.capacity,
            });
        }
        let id = self.entries.len();
        self.entries.push(material);
        self.unstaged_from.get_or_insert(id);
        trace!("Registered material {id}: {material:?}");
        Ok(id as MaterialId)
    }

    /// Properties of a registered material. `None` for `AIR` and unknown ids.
    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        if id == AIR {
            return None;
        }
        self.entries.get(id as usize)
    }

    /// Number of registered materials, `AIR` excluded.
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries are waiting for [`Self::stage`].
    pub fn has_unstaged(&self) -> bool {
        self.unstaged_from.is_some()
    }

    /// Stages every entry registered since the last call into the cache's
    /// open frame.
    ///
    /// # Returns
    /// The number of entries staged. On `StagingExhausted` nothing is staged
    /// and the entries stay pending.
    pub fn stage(&mut self, cache: &mut ChunkMeshCache) -> Result<usize> {
        let Some(from) = self.unstaged_from else {
            return Ok(0);
        };
        let bytes: &[u8] = bytemuck::cast_slice(&self.entries[from..]);
        cache.stage_buffer_write(self.buffer, from as u64 * MATERIAL_SIZE, bytes)?;
        self.unstaged_from = None;
        Ok(self.entries.len() - from)
    }

    /// Device buffer holding the table.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Releases the device buffer. The GPU must be idle.
    pub fn release<D: GpuDevice + ?Sized>(self, device: &mut D) {
        device.release_buffer(self.buffer);
    }
}
