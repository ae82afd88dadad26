use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A thread-safe, reference-counted container with read-write locking.
///
/// Chunks live in `MtResource`s so a background mesher can hold a read lock on
/// a chunk (and its neighbors) while the render thread keeps editing others.
///
/// # Examples
///
/// ```
/// # use std::thread;
/// use voxel_streamer::core::MtResource;
///
/// let cells = MtResource::new(vec![0u16; 8]);
/// let worker_view = cells.clone();
///
/// let handle = thread::spawn(move || worker_view.get().iter().filter(|&&m| m != 0).count());
/// assert_eq!(handle.join().unwrap(), 0);
/// ```
///
/// # Performance Considerations
/// - Reads (`get()`) proceed concurrently
/// - Writes (`get_mut()`) are exclusive; keep them short on the render thread
pub struct MtResource<T: Send + Sync> {
    resource: Arc<RwLock<T>>,
}

impl<T: Send + Sync> MtResource<T> {
    /// Wraps `resource` in a new shared container.
    pub fn new(resource: T) -> Self {
        Self {
            resource: Arc::new(RwLock::new(resource)),
        }
    }

    /// Returns a read guard. A poisoned lock is recovered, not propagated.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.resource.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a write guard. A poisoned lock is recovered, not propagated.
    pub fn get_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.resource.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two handles point at the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl<T: Send + Sync> Clone for MtResource<T> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
        }
    }
}
