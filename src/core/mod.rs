//! # Core Module
//!
//! Shared-ownership containers used across the streaming engine.
//!
//! ## Key Components
//! - `MtResource`: `Arc<RwLock<T>>` wrapper for data read by worker threads (chunk grids)
//! - `StResource`: `Rc<RwLock<T>>` wrapper for render-thread-only state (the deferred-deletion ring)
//!
//! Both recover from lock poisoning instead of panicking.
//!
//! ## Usage
//! ```
//! use voxel_streamer::core::{MtResource, StResource};
//!
//! let counter = MtResource::new(0);
//! *counter.get_mut() += 1;
//! assert_eq!(*counter.get(), 1);
//!
//! let queue = StResource::new(Vec::<u32>::new());
//! queue.get_mut().push(7);
//! assert_eq!(queue.get().len(), 1);
//! ```

pub mod mt_resource;
pub mod st_resource;

pub use mt_resource::MtResource;
pub use st_resource::StResource;
