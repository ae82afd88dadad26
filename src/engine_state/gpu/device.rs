//! The device capability interface the streaming engine is written against.
//!
//! Only the handful of operations the engine needs appear here. Pipelines,
//! shaders and draw submission belong to the caller.

use crate::error::Result;

/// Opaque identifier of a buffer owned by a [`GpuDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Opaque identifier of a fence owned by a [`GpuDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceHandle(pub u64);

/// What a device-local buffer will be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Packed chunk vertices, read as a storage/texel buffer.
    Geometry,
    /// Block-carved index words.
    Index,
    /// Per-block draw parameters.
    DrawParams,
    /// Material table entries, indexed by material id.
    Materials,
}

/// A buffer-to-buffer transfer the submitter must encode before any draw of
/// the frame it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadCopy {
    /// Source buffer, normally the staging ring.
    pub src: BufferHandle,
    /// Byte offset in `src`.
    pub src_offset: u64,
    /// Destination device buffer.
    pub dst: BufferHandle,
    /// Byte offset in `dst`.
    pub dst_offset: u64,
    /// Number of bytes, a multiple of 4.
    pub size: u64,
}

/// CPU-side view of a mapped buffer.
///
/// Writes land here first and only become visible to the device after
/// [`GpuDevice::flush_written_range`] covers them.
#[derive(Debug)]
pub struct MappedRegion {
    bytes: Vec<u8>,
}

impl MappedRegion {
    /// A zeroed region of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the region has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole region.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The whole region, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Bytes `offset..offset + length`.
    ///
    /// # Panics
    /// Panics if the range lies outside the region.
    pub fn range(&self, offset: u64, length: u64) -> &[u8] {
        let start = offset as usize;
        &self.bytes[start..start + length as usize]
    }
}

/// Operations the engine needs from a graphics device.
///
/// All buffer sizes and offsets passed by the engine are multiples of 4.
///
/// A fence that has been created but never placed counts as raised.
pub trait GpuDevice {
    /// Allocates a host-visible buffer and returns its CPU-side window.
    fn allocate_mapped_buffer(&mut self, label: &str, size: u64)
        -> Result<(BufferHandle, MappedRegion)>;

    /// Allocates a device-local buffer that uploads are copied into.
    fn allocate_device_buffer(
        &mut self,
        label: &str,
        size: u64,
        kind: BufferKind,
    ) -> Result<BufferHandle>;

    /// Releases a buffer. The caller guarantees the GPU no longer reads it.
    fn release_buffer(&mut self, buffer: BufferHandle);

    /// Creates a fence in the "never placed" state.
    fn create_fence(&mut self) -> FenceHandle;

    /// Records the fence behind all GPU work submitted so far.
    fn place_fence(&mut self, fence: FenceHandle);

    /// Whether all work submitted before the last `place_fence` has completed.
    fn is_raised(&mut self, fence: FenceHandle) -> bool;

    /// Destroys a fence. The caller guarantees nothing waits on it.
    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Makes CPU writes to `offset..offset + length` of a mapped buffer visible
    /// to the device. A no-op where host memory is coherent.
    fn flush_written_range(
        &mut self,
        buffer: BufferHandle,
        region: &MappedRegion,
        offset: u64,
        length: u64,
    );
}
