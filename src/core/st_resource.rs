use std::{
    rc::Rc,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// A single-threaded, reference-counted container with interior mutability.
///
/// Used for state that several render-thread owners must reach without passing
/// `&mut` around, such as the deferred-deletion ring that every [`Fence`] pushes
/// into when dropped.
///
/// Not `Send`: nothing wrapped here may cross to a worker thread.
///
/// [`Fence`]: crate::engine_state::gpu::Fence
pub struct StResource<T> {
    resource: Rc<RwLock<T>>,
}

impl<T> StResource<T> {
    /// Wraps `resource` in a new shared container.
    pub fn new(resource: T) -> Self {
        Self {
            resource: Rc::new(RwLock::new(resource)),
        }
    }

    /// Returns a read guard.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.resource.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a write guard.
    ///
    /// # Panics
    /// Re-entrant locking on the same thread deadlocks or panics; never hold a
    /// guard across a call that may drop a `Fence`.
    pub fn get_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.resource.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for StResource<T> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
        }
    }
}
