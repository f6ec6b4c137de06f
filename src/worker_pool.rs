//! The `WorkerPool` collaborator and a default thread-pool implementation.
//!
//! The execution engine only ever calls [`WorkerPool::submit`]; anything
//! implementing that one method — a fixed thread pool, a rayon-backed pool,
//! a test harness that runs tasks inline — can drive a pipeline. [`ThreadPool`]
//! is the batteries-included default, a fixed-size pool of OS threads pulling
//! work off this crate's own [`BoundedQueue`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::error::{PipelineError, PipelineResult};
use crate::queue::BoundedQueue;

/// A unit of work submitted to a pool: run once, on some thread, at some
/// point after `submit` returns.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// External collaborator that runs pipeline worker closures.
///
/// No guarantee is made about which thread runs a task, nor any bound on
/// the number of outstanding tasks from the pipeline's side — a pool that
/// wants to apply backpressure does so internally (as [`ThreadPool`] does,
/// via its own bounded task queue).
pub trait WorkerPool: Send + Sync {
    /// Submits `task` for execution. Must not block waiting for the task
    /// to *complete* (only for the pool to accept it, if the pool itself
    /// applies backpressure).
    fn submit(&self, task: Task);
}

/// A fixed-size pool of OS threads backed by a [`BoundedQueue<Task>`].
///
/// Threads pull tasks off the internal queue and run them to completion
/// before pulling the next one. Dropping the pool closes the queue and
/// joins every worker thread, so outstanding work finishes before the
/// pool's `Drop` returns.
pub struct ThreadPool {
    tasks: BoundedQueue<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Builds a pool with `worker_count` threads and an internal task queue
    /// of `queue_capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Internal`] if the OS refuses to spawn one of
    /// the worker threads (for example, the process is out of resources).
    /// Threads already spawned before the failure are left running; they
    /// exit on their own once `tasks` is dropped and closed.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` or `queue_capacity` is zero.
    pub fn new(worker_count: usize, queue_capacity: usize) -> PipelineResult<Self> {
        assert!(worker_count > 0, "ThreadPool requires at least one worker thread");
        let tasks: BoundedQueue<Task> = BoundedQueue::new(queue_capacity);
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker_tasks = tasks.clone();
            let handle = thread::Builder::new()
                .name(format!("pulsearc-pipeline-worker-{id}"))
                .spawn(move || Self::worker_loop(id, &worker_tasks))
                .map_err(|err| {
                    PipelineError::Internal(format!("failed to spawn pipeline worker thread: {err}"))
                })?;
            workers.push(handle);
        }
        debug!(worker_count, queue_capacity, "thread pool started");
        Ok(Self { tasks, workers })
    }

    /// Convenience constructor using a queue capacity equal to twice the
    /// worker count, a reasonable default for short-lived pipeline worker
    /// closures.
    ///
    /// # Errors
    ///
    /// See [`ThreadPool::new`].
    pub fn with_default_queue(worker_count: usize) -> PipelineResult<Self> {
        Self::new(worker_count, worker_count.saturating_mul(2).max(1))
    }

    fn worker_loop(id: usize, tasks: &BoundedQueue<Task>) {
        while let Ok(task) = tasks.value_pop() {
            trace!(worker_id = id, "running task");
            task();
        }
        trace!(worker_id = id, "worker thread exiting");
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, task: Task) {
        // A closed task queue (post-shutdown) silently drops the task rather
        // than panicking the caller; there is no one left to run it anyway.
        let _ = self.tasks.push(task);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.tasks.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl WorkerPool for Arc<ThreadPool> {
    fn submit(&self, task: Task) {
        ThreadPool::submit(self, task);
    }
}
