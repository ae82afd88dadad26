//! In-memory [`GpuDevice`] used by tests and by the headless demo when no
//! adapter is available.
//!
//! Buffers are plain byte vectors. Mapped writes stay in the caller's
//! [`MappedRegion`] until flushed, like non-coherent host memory. Fences are
//! completed explicitly (`complete_all`) or after a fixed latency measured in
//! placed fences, and a hung device never completes anything.

use std::collections::HashMap;

use log::debug;

use crate::error::{Result, StreamingError};

use super::{BufferHandle, BufferKind, FenceHandle, GpuDevice, MappedRegion, UploadCopy};
use crate::engine_state::rendering::{DrawSubmitter, FrameOutput};

/// A device that runs entirely on the CPU.
#[derive(Debug, Default)]
pub struct SoftwareDevice {
    buffers: HashMap<BufferHandle, Vec<u8>>,
    fences: HashMap<FenceHandle, Option<u64>>,
    next_handle: u64,
    submitted_serial: u64,
    completed_serial: u64,
    latency: Option<u64>,
    hung: bool,
    memory_limit: Option<u64>,
    allocated_bytes: u64,
    flushed_bytes: u64,
}

impl SoftwareDevice {
    /// A device whose fences complete only through [`Self::complete_all`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes work automatically once `latency` newer fences have been placed.
    /// A latency of 0 completes every fence as soon as it is placed.
    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails allocations once `limit` bytes are live.
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// While hung, no submitted work ever completes.
    pub fn set_hung(&mut self, hung: bool) {
        self.hung = hung;
    }

    /// Completes all submitted work.
    pub fn complete_all(&mut self) {
        if !self.hung {
            self.completed_serial = self.submitted_serial;
        }
    }

    /// Applies upload copies the way a queue submission would.
    ///
    /// # Panics
    /// Panics if a copy runs out of bounds.
    pub fn execute_copies(&mut self, copies: &[UploadCopy]) -> Result<()> {
        for copy in copies {
            let start = copy.src_offset as usize;
            let source = self
                .buffers
                .get(&copy.src)
                .ok_or(StreamingError::UnknownBuffer(copy.src))?[start..start + copy.size as usize]
                .to_vec();
            let target = self
                .buffers
                .get_mut(&copy.dst)
                .ok_or(StreamingError::UnknownBuffer(copy.dst))?;
            let dst = copy.dst_offset as usize;
            target[dst..dst + source.len()].copy_from_slice(&source);
        }
        Ok(())
    }

    /// Device-side contents of a live buffer.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    /// Number of live buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live fences.
    pub fn live_fence_count(&self) -> usize {
        self.fences.len()
    }

    /// Whether `fence` has not been destroyed.
    pub fn fence_exists(&self, fence: FenceHandle) -> bool {
        self.fences.contains_key(&fence)
    }

    /// Total bytes made visible through `flush_written_range`.
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn reserve(&mut self, label: &str, size: u64) -> Result<()> {
        if let Some(limit) = self.memory_limit {
            if self.allocated_bytes + size > limit {
                return Err(StreamingError::DeviceAllocation {
                    label: label.to_owned(),
                    size,
                    reason: format!("{} of {limit} bytes in use", self.allocated_bytes),
                });
            }
        }
        self.allocated_bytes += size;
        Ok(())
    }
}

impl GpuDevice for SoftwareDevice {
    fn allocate_mapped_buffer(
        &mut self,
        label: &str,
        size: u64,
    ) -> Result<(BufferHandle, MappedRegion)> {
        self.reserve(label, size)?;
        let handle = BufferHandle(self.next_id());
        self.buffers.insert(handle, vec![0; size as usize]);
        Ok((handle, MappedRegion::zeroed(size as usize)))
    }

    fn allocate_device_buffer(
        &mut self,
        label: &str,
        size: u64,
        _kind: BufferKind,
    ) -> Result<BufferHandle> {
        self.reserve(label, size)?;
        let handle = BufferHandle(self.next_id());
        self.buffers.insert(handle, vec![0; size as usize]);
        Ok(handle)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(&buffer) {
            Some(released) => self.allocated_bytes -= released.len() as u64,
            None => debug!("Release of unknown buffer {buffer:?}"),
        }
    }

    fn create_fence(&mut self) -> FenceHandle {
        let handle = FenceHandle(self.next_id());
        self.fences.insert(handle, None);
        handle
    }

    fn place_fence(&mut self, fence: FenceHandle) {
        self.submitted_serial += 1;
        self.fences.insert(fence, Some(self.submitted_serial));
        if let (Some(latency), false) = (self.latency, self.hung) {
            let completed = self.submitted_serial.saturating_sub(latency);
            self.completed_serial = self.completed_serial.max(completed);
        }
    }

    fn is_raised(&mut self, fence: FenceHandle) -> bool {
        match self.fences.get(&fence) {
            Some(Some(serial)) => *serial <= self.completed_serial,
            Some(None) => true,
            None => {
                debug_assert!(false, "query of destroyed fence {fence:?}");
                true
            }
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence);
    }

    fn flush_written_range(
        &mut self,
        buffer: BufferHandle,
        region: &MappedRegion,
        offset: u64,
        length: u64,
    ) {
        if let Some(target) = self.buffers.get_mut(&buffer) {
            let start = offset as usize;
            target[start..start + length as usize]
                .copy_from_slice(region.range(offset, length));
            self.flushed_bytes += length;
        }
    }
}

/// Submitter for [`SoftwareDevice`]: executes each frame's copies and keeps
/// the last output for inspection.
#[derive(Debug, Default)]
pub struct SoftwareSubmitter {
    last_output: Option<FrameOutput>,
}

impl SoftwareSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of the most recently submitted frame.
    pub fn last_output(&self) -> Option<&FrameOutput> {
        self.last_output.as_ref()
    }
}

impl DrawSubmitter<SoftwareDevice> for SoftwareSubmitter {
    fn submit(&mut self, device: &mut SoftwareDevice, output: &FrameOutput) -> Result<()> {
        device.execute_copies(&output.copies)?;
        self.last_output = Some(output.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_completes_older_fences() {
        let mut device = SoftwareDevice::new().with_latency(1);
        let a = device.create_fence();
        let b = device.create_fence();

        device.place_fence(a);
        assert!(!device.is_raised(a));
        device.place_fence(b);
        assert!(device.is_raised(a));
        assert!(!device.is_raised(b));
    }

    #[test]
    fn test_memory_limit() {
        let mut device = SoftwareDevice::new().with_memory_limit(100);
        let first = device
            .allocate_device_buffer("a", 64, BufferKind::Geometry)
            .unwrap();
        assert!(matches!(
            device.allocate_device_buffer("b", 64, BufferKind::Geometry),
            Err(StreamingError::DeviceAllocation { size: 64, .. })
        ));
        device.release_buffer(first);
        assert!(device
            .allocate_device_buffer("b", 64, BufferKind::Geometry)
            .is_ok());
    }

    #[test]
    fn test_execute_copies() {
        let mut device = SoftwareDevice::new();
        let (staging, mut region) = device.allocate_mapped_buffer("staging", 8).unwrap();
        let target = device
            .allocate_device_buffer("target", 8, BufferKind::Index)
            .unwrap();

        region.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        device.flush_written_range(staging, &region, 0, 4);
        device
            .execute_copies(&[UploadCopy {
                src: staging,
                src_offset: 0,
                dst: target,
                dst_offset: 4,
                size: 4,
            }])
            .unwrap();
        assert_eq!(device.buffer_contents(target).unwrap(), &[0, 0, 0, 0, 1, 2, 3, 4]);

        let stray = UploadCopy {
            src: BufferHandle(999),
            src_offset: 0,
            dst: target,
            dst_offset: 0,
            size: 4,
        };
        assert!(matches!(
            device.execute_copies(&[stray]),
            Err(StreamingError::UnknownBuffer(BufferHandle(999)))
        ));
    }
}
