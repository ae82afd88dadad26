//! Owned GPU fence.
//!
//! Dropping a [`Fence`] does not destroy the device object immediately, since
//! the GPU may still signal it. The handle is retired into the
//! [`DeletionQueue`] and destroyed once the frame it was dropped in completes.

use crate::core::StResource;

use super::{DeletionQueue, FenceHandle, GpuDevice, RetiredResource};

/// A device fence whose destruction is deferred through the deletion ring.
pub struct Fence {
    handle: FenceHandle,
    retire_to: StResource<DeletionQueue>,
}

impl Fence {
    /// Creates a fence in the "never placed" (raised) state.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        retire_to: StResource<DeletionQueue>,
    ) -> Self {
        Self {
            handle: device.create_fence(),
            retire_to,
        }
    }

    /// Underlying device handle.
    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    /// Places the fence behind all work submitted so far.
    pub fn place<D: GpuDevice + ?Sized>(&self, device: &mut D) {
        device.place_fence(self.handle);
    }

    /// Whether the GPU has passed the point where the fence was placed.
    pub fn raised<D: GpuDevice + ?Sized>(&self, device: &mut D) -> bool {
        device.is_raised(self.handle)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.retire_to
            .get_mut()
            .retire_or_leak(RetiredResource::Fence(self.handle));
    }
}
