//! Deferred deletion of GPU objects.
//!
//! A buffer, fence or block range the GPU may still be reading is not released
//! on the spot. It is retired into this bounded ring, tagged with the frame in
//! which it was retired, and released once that frame is known to have
//! completed on the GPU. The ring is drained once per frame.

use std::collections::VecDeque;

use log::{error, trace};

use crate::error::{Result, StreamingError};

use super::{BlockAllocator, BufferHandle, FenceHandle, GpuDevice};

/// A resource waiting for the GPU to finish with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetiredResource {
    /// A fence to destroy.
    Fence(FenceHandle),
    /// A buffer to release.
    Buffer(BufferHandle),
    /// Index blocks to hand back to the allocator.
    Blocks(Vec<usize>),
}

#[derive(Debug)]
struct Retired {
    frame: u64,
    resource: RetiredResource,
}

/// Bounded ring of retired resources, drained by completed frame number.
#[derive(Debug)]
pub struct DeletionQueue {
    entries: VecDeque<Retired>,
    capacity: usize,
    current_frame: u64,
    leaked: usize,
}

impl DeletionQueue {
    /// Creates an empty ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            current_frame: 0,
            leaked: 0,
        }
    }

    /// Sets the frame number new retirements are tagged with.
    pub fn set_current_frame(&mut self, frame: u64) {
        debug_assert!(frame >= self.current_frame, "frame numbers go backwards");
        self.current_frame = frame;
    }

    /// The frame number new retirements are tagged with.
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Queues a resource for release after the current frame completes.
    pub fn retire(&mut self, resource: RetiredResource) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(StreamingError::DeletionQueueFull {
                capacity: self.capacity,
            });
        }
        trace!("Retiring {:?} in frame {}", resource, self.current_frame);
        self.entries.push_back(Retired {
            frame: self.current_frame,
            resource,
        });
        Ok(())
    }

    /// Retirement path for destructors, which cannot report errors.
    ///
    /// When the ring is full the resource is leaked and counted.
    pub fn retire_or_leak(&mut self, resource: RetiredResource) {
        if let Err(err) = self.retire(resource.clone()) {
            self.leaked += 1;
            error!("Leaking {resource:?}: {err}");
        }
    }

    /// Releases every entry retired in or before `completed_frame`.
    ///
    /// # Returns
    /// The number of entries released
    pub fn drain<D: GpuDevice + ?Sized>(
        &mut self,
        completed_frame: u64,
        device: &mut D,
        allocator: &mut BlockAllocator,
    ) -> usize {
        let mut released = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.frame <= completed_frame)
        {
            if let Some(entry) = self.entries.pop_front() {
                Self::release(entry.resource, device, allocator);
                released += 1;
            }
        }
        released
    }

    /// Releases everything regardless of frame. Only valid once the device is idle.
    pub fn drain_all<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        allocator: &mut BlockAllocator,
    ) -> usize {
        let released = self.entries.len();
        for entry in self.entries.drain(..) {
            Self::release(entry.resource, device, allocator);
        }
        released
    }

    fn release<D: GpuDevice + ?Sized>(
        resource: RetiredResource,
        device: &mut D,
        allocator: &mut BlockAllocator,
    ) {
        match resource {
            RetiredResource::Fence(fence) => device.destroy_fence(fence),
            RetiredResource::Buffer(buffer) => device.release_buffer(buffer),
            RetiredResource::Blocks(blocks) => allocator.free(&blocks),
        }
    }

    /// Number of entries waiting.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `count` more entries fit without rejection.
    pub fn has_room(&self, count: usize) -> bool {
        self.entries.len() + count <= self.capacity
    }

    /// Maximum number of waiting entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resources dropped because the ring was full.
    pub fn leaked_count(&self) -> usize {
        self.leaked
    }
}
