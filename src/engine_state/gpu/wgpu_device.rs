//! [`GpuDevice`] on top of wgpu.
//!
//! wgpu has no persistently mapped buffers, so a "mapped" buffer is a
//! device buffer plus the caller's CPU-side [`MappedRegion`]; flushing a range
//! turns into `Queue::write_buffer`. Fences are flags set by
//! `Queue::on_submitted_work_done` and observed after a non-blocking poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use wgpu::Features;

use crate::engine_state::rendering::{DrawSubmitter, FrameOutput};
use crate::error::{Result, StreamingError};

use super::{BufferHandle, BufferKind, FenceHandle, GpuDevice, MappedRegion};

/// A wgpu device and queue exposing the engine's device capability interface.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: HashMap<BufferHandle, wgpu::Buffer>,
    fences: HashMap<FenceHandle, Option<Arc<AtomicBool>>>,
    next_handle: u64,
}

impl WgpuDevice {
    /// Wraps an existing device and queue.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            buffers: HashMap::new(),
            fences: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Opens the default adapter without a surface.
    ///
    /// # Returns
    /// - `Ok(device)` when an adapter and device are available
    /// - `Err(DeviceUnavailable)` otherwise
    pub async fn request_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            backend_options: wgpu::BackendOptions::from_env_or_default(),
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| StreamingError::DeviceUnavailable(err.to_string()))?;
        info!("Using adapter {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                required_features: Features::empty(),
                required_limits: wgpu::Limits::default(),
                label: Some("Voxel Streamer Device"),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| StreamingError::DeviceUnavailable(err.to_string()))?;

        Ok(Self::new(device, queue))
    }

    /// The wgpu buffer behind `handle`.
    pub fn buffer(&self, handle: BufferHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&handle)
    }

    /// The underlying device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The underlying queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn create_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<BufferHandle> {
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(StreamingError::DeviceAllocation {
                label: label.to_owned(),
                size,
                reason: format!("exceeds max_buffer_size {max}"),
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }
}

impl GpuDevice for WgpuDevice {
    fn allocate_mapped_buffer(
        &mut self,
        label: &str,
        size: u64,
    ) -> Result<(BufferHandle, MappedRegion)> {
        let handle = self.create_buffer(
            label,
            size,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )?;
        Ok((handle, MappedRegion::zeroed(size as usize)))
    }

    fn allocate_device_buffer(
        &mut self,
        label: &str,
        size: u64,
        kind: BufferKind,
    ) -> Result<BufferHandle> {
        let usage = match kind {
            BufferKind::Geometry | BufferKind::DrawParams | BufferKind::Materials => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST
            }
            BufferKind::Index => {
                wgpu::BufferUsages::INDEX
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
            }
        };
        self.create_buffer(label, size, usage)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn create_fence(&mut self) -> FenceHandle {
        self.next_handle += 1;
        let handle = FenceHandle(self.next_handle);
        self.fences.insert(handle, None);
        handle
    }

    fn place_fence(&mut self, fence: FenceHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let signal = flag.clone();
        self.queue
            .on_submitted_work_done(move || signal.store(true, Ordering::Release));
        self.fences.insert(fence, Some(flag));
    }

    fn is_raised(&mut self, fence: FenceHandle) -> bool {
        let Some(Some(flag)) = self.fences.get(&fence) else {
            return true;
        };
        if flag.load(Ordering::Acquire) {
            return true;
        }
        if let Err(err) = self.device.poll(wgpu::PollType::Poll) {
            debug!("Device poll failed: {err}");
        }
        flag.load(Ordering::Acquire)
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
        if let Some(target) = self.buffers.get(&buffer) {
            self.queue
                .write_buffer(target, offset, region.range(offset, length));
        }
    }
}

/// Encodes each frame's upload copies and submits them to the queue.
///
/// Draw recording belongs to the caller's renderer. This submitter keeps the
/// frame's indirect arguments so a renderer can pick them up after submission.
#[derive(Default)]
pub struct WgpuCopySubmitter {
    last_indirect_args: Vec<wgpu::util::DrawIndexedIndirectArgs>,
}

impl WgpuCopySubmitter {
    /// Indirect arguments of the most recently submitted frame.
    pub fn last_indirect_args(&self) -> &[wgpu::util::DrawIndexedIndirectArgs] {
        &self.last_indirect_args
    }
}

impl DrawSubmitter<WgpuDevice> for WgpuCopySubmitter {
    fn submit(&mut self, device: &mut WgpuDevice, output: &FrameOutput) -> Result<()> {
        let mut encoder = device
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Chunk Upload Encoder"),
            });
        for copy in &output.copies {
            let source = device
                .buffer(copy.src)
                .ok_or(StreamingError::UnknownBuffer(copy.src))?;
            let destination = device
                .buffer(copy.dst)
                .ok_or(StreamingError::UnknownBuffer(copy.dst))?;
            encoder.copy_buffer_to_buffer(
                source,
                copy.src_offset,
                destination,
                copy.dst_offset,
                copy.size,
            );
        }
        device.queue().submit(std::iter::once(encoder.finish()));

        self.last_indirect_args = output.indirect_args();
        Ok(())
    }
}
