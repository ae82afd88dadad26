//! # Task Trait
//!
//! A `Task` is a unit of work moved to a worker thread. It owns everything it
//! reads (shared state comes in as `MtResource` clones), runs `process()` off
//! the render thread, and hands back a plain `Output` value. The render thread
//! decides what to do with that value; tasks never reach into render-thread
//! state themselves.

/// A unit of work executed on a worker thread.
pub trait Task: Send {
    /// Value sent back to the thread that published the task.
    type Output: Send + 'static;

    /// Runs the task. Called exactly once, on a worker thread.
    fn process(&self) -> Self::Output;
}
