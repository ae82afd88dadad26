//! # Task Management System
//!
//! A small worker pool for CPU-heavy jobs (chunk meshing) that must stay off
//! the render thread.
//!
//! ## Architecture Overview
//! - `TaskManager`: owns the workers, distributes tasks, collects outputs
//! - `Task`: a unit of work producing an `Output`
//! - `TaskChannel`: one worker thread plus its task/result channel pair
//!
//! ## Task Lifecycle
//! 1. Tasks are published via `TaskManager::publish_task()`
//! 2. The manager hands each task to the next worker with spare capacity
//!    (round-robin), or queues it when every worker is busy
//! 3. Workers call `process()` and send the output back, or report the task
//!    as panicked and carry on with the next one
//! 4. The render thread drains results with `process_completed_tasks()` and
//!    feeds queued tasks to freed workers with `process_queued_tasks()`
//!
//! ## Example Usage
//! ```
//! use voxel_streamer::engine_state::task_management::{task::Task, TaskManager, TaskResult};
//!
//! struct Square(u64);
//! impl Task for Square {
//!     type Output = u64;
//!     fn process(&self) -> u64 { self.0 * self.0 }
//! }
//!
//! let mut manager = TaskManager::new(2);
//! let id = manager.publish_task(Box::new(Square(3)));
//! let mut results = Vec::new();
//! while results.is_empty() {
//!     results.extend(manager.process_completed_tasks());
//!     manager.process_queued_tasks();
//! }
//! assert_eq!(results, vec![TaskResult::Done(id, 9)]);
//! ```

pub mod task;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use task::Task;

type BoxedTask<R> = Box<dyn Task<Output = R>>;

/// Identifier handed out by [`TaskManager::publish_task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// What came back from a worker.
#[derive(Debug, PartialEq, Eq)]
pub enum TaskResult<R> {
    /// `process()` returned normally.
    Done(TaskId, R),
    /// `process()` panicked. The worker survives and takes further tasks.
    Panicked(TaskId),
}

/// One worker thread and the channels to talk to it.
struct TaskChannel<R> {
    task_sender: Sender<(TaskId, BoxedTask<R>)>,
    result_receiver: Receiver<(TaskId, Option<R>)>,
    num_tasks_in_flight: usize,
    _worker: JoinHandle<()>,
}

/// Distributes tasks over a fixed pool of worker threads.
///
/// Must be driven from a single thread, normally once per frame.
pub struct TaskManager<R: Send + 'static> {
    channels: Vec<TaskChannel<R>>,
    queued_tasks: VecDeque<(TaskId, BoxedTask<R>)>,
    current_channel: usize,
    next_task_id: u64,
}

/// Maximum number of tasks handed to one worker at a time.
///
/// Keeping this at 1 leaves queued tasks in `queued_tasks`, where any worker
/// that frees up can take them.
pub const MAX_TASKS_IN_FLIGHT: usize = 1;

impl<R: Send + 'static> TaskManager<R> {
    /// Spawns `num_workers` worker threads.
    ///
    /// # Panics
    /// Panics if the OS refuses to spawn a thread.
    pub fn new(num_workers: usize) -> Self {
        info!(
            "Starting {num_workers} mesher workers (available parallelism: {:?})",
            thread::available_parallelism()
        );
        let mut channels = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let (task_tx, task_rx) = channel::<(TaskId, BoxedTask<R>)>();
            let (result_tx, result_rx) = channel::<(TaskId, Option<R>)>();

            let worker = thread::Builder::new()
                .name(format!("mesher-{index}"))
                .spawn(move || {
                    while let Ok((id, task)) = task_rx.recv() {
                        let output = panic::catch_unwind(AssertUnwindSafe(|| task.process())).ok();
                        if result_tx.send((id, output)).is_err() {
                            break;
                        }
                    }
                })
                .unwrap_or_else(|err| panic!("failed to spawn mesher worker: {err}"));

            channels.push(TaskChannel {
                task_sender: task_tx,
                result_receiver: result_rx,
                num_tasks_in_flight: 0,
                _worker: worker,
            });
        }

        TaskManager {
            channels,
            queued_tasks: VecDeque::new(),
            current_channel: 0,
            next_task_id: 0,
        }
    }

    /// Sends a task to one worker, returning it if the worker is gone.
    fn try_send_task(
        &mut self,
        id: TaskId,
        task: BoxedTask<R>,
        channel_idx: usize,
    ) -> Result<(), BoxedTask<R>> {
        match self.channels[channel_idx].task_sender.send((id, task)) {
            Ok(()) => {
                self.channels[channel_idx].num_tasks_in_flight += 1;
                Ok(())
            }
            Err(returned) => {
                warn!("Mesher worker {channel_idx} disconnected");
                Err(returned.0 .1)
            }
        }
    }

    /// Next worker with spare capacity, scanning round-robin from the last one used.
    fn find_available_channel(&self) -> Option<usize> {
        let count = self.channels.len();
        (0..count)
            .map(|step| (self.current_channel + step) % count)
            .find(|&idx| self.channels[idx].num_tasks_in_flight < MAX_TASKS_IN_FLIGHT)
    }

    /// Schedules a task on a free worker, or queues it when every worker is busy.
    ///
    /// # Returns
    /// The id its [`TaskResult`] will carry
    pub fn publish_task(&mut self, task: BoxedTask<R>) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let Some(channel_idx) = self.find_available_channel() else {
            self.queued_tasks.push_back((id, task));
            return id;
        };
        match self.try_send_task(id, task, channel_idx) {
            Ok(()) => self.current_channel = (channel_idx + 1) % self.channels.len(),
            Err(task) => self.queued_tasks.push_back((id, task)),
        }
        id
    }

    /// Hands queued tasks, oldest first, to workers that have capacity.
    pub fn process_queued_tasks(&mut self) {
        while !self.queued_tasks.is_empty() {
            let Some(channel_idx) = self.find_available_channel() else {
                return;
            };
            let Some((id, task)) = self.queued_tasks.pop_front() else {
                return;
            };
            match self.try_send_task(id, task, channel_idx) {
                Ok(()) => self.current_channel = (channel_idx + 1) % self.channels.len(),
                Err(task) => {
                    self.queued_tasks.push_front((id, task));
                    return;
                }
            }
        }
    }

    /// Collects every result that workers have finished so far. Never blocks.
    pub fn process_completed_tasks(&mut self) -> Vec<TaskResult<R>> {
        let mut results = Vec::new();
        for (index, channel) in self.channels.iter_mut().enumerate() {
            while let Ok((id, output)) = channel.result_receiver.try_recv() {
                channel.num_tasks_in_flight -= 1;
                results.push(match output {
                    Some(output) => TaskResult::Done(id, output),
                    None => {
                        error!("Task {id:?} panicked on mesher worker {index}");
                        TaskResult::Panicked(id)
                    }
                });
            }
        }
        if !results.is_empty() {
            debug!("Collected {} finished tasks", results.len());
        }
        results
    }

    /// Tasks handed to workers whose output has not been collected yet.
    pub fn tasks_in_flight(&self) -> usize {
        self.channels.iter().map(|c| c.num_tasks_in_flight).sum()
    }

    /// Tasks waiting for a worker.
    pub fn queued_task_count(&self) -> usize {
        self.queued_tasks.len()
    }
}
