//! # GPU Resource Layer
//!
//! Everything that touches GPU memory on behalf of the streaming engine:
//!
//! - `device`: the [`GpuDevice`] capability trait and handle types
//! - `block_allocator`: fixed-size block pool for index storage
//! - `fenced_ring_buffer`: N-rung staging memory guarded by fences
//! - `fence` and `deletion_queue`: RAII fences and deferred release of
//!   anything the GPU may still be reading
//! - `software_device` / `wgpu_device`: the two device implementations
//!
//! ## Architecture
//!
//! All of it is owned by the render thread. No type here is shared with the
//! mesher workers, so none of it needs a lock; ordering between CPU writes and
//! GPU reads comes from fences alone.

pub mod block_allocator;
pub mod deletion_queue;
pub mod device;
pub mod fence;
pub mod fenced_ring_buffer;
pub mod software_device;
pub mod wgpu_device;

pub use block_allocator::BlockAllocator;
pub use deletion_queue::{DeletionQueue, RetiredResource};
pub use device::{BufferHandle, BufferKind, FenceHandle, GpuDevice, MappedRegion, UploadCopy};
pub use fence::Fence;
pub use fenced_ring_buffer::{FencedRingBuffer, RungLease};
pub use software_device::{SoftwareDevice, SoftwareSubmitter};
pub use wgpu_device::{WgpuCopySubmitter, WgpuDevice};
