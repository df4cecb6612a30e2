//! Fork-join task scheduling.
//!
//! The renderer never keeps work in flight across a call: a caller forks a
//! fixed number of independent tasks, blocks until all of them finished and
//! then consumes their results in index order. [`TaskScheduler`] is the seam
//! between that pattern and whatever thread pool executes the tasks.

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Executes groups of independent tasks and waits for them.
pub trait TaskScheduler: Send + Sync {
    /// Number of threads tasks may run on concurrently.
    fn worker_count(&self) -> usize;

    /// Run `task(0)..task(task_count)` and return once every call returned.
    ///
    /// Tasks may run on any thread and in any order.
    fn run_tasks(&self, task_count: usize, task: &(dyn Fn(usize) + Sync));
}

/// Fork `task_count` tasks on `scheduler`, join, and return their results
/// ordered by task index regardless of completion order.
pub fn fork_join<S, R, F>(scheduler: &S, task_count: usize, task: F) -> Vec<R>
where
    S: TaskScheduler + ?Sized,
    R: Send,
    F: Fn(usize) -> R + Sync,
{
    let slots: Vec<Mutex<Option<R>>> = (0..task_count).map(|_| Mutex::new(None)).collect();

    scheduler.run_tasks(task_count, &|index| {
        let result = task(index);
        *slots[index].lock() = Some(result);
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| match slot.into_inner() {
            Some(result) => result,
            None => panic!("task {index} did not run to completion"),
        })
        .collect()
}

/// Scheduler backed by a dedicated rayon thread pool.
pub struct RayonScheduler {
    pool: rayon::ThreadPool,
}

impl RayonScheduler {
    /// Create a pool with `threads` workers (zero picks rayon's default).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("forge-worker-{index}"))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build worker pool: {e}")))?;

        tracing::info!("Task scheduler started with {} worker(s)", pool.current_num_threads());

        Ok(Self { pool })
    }
}

impl TaskScheduler for RayonScheduler {
    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run_tasks(&self, task_count: usize, task: &(dyn Fn(usize) + Sync)) {
        self.pool
            .install(|| (0..task_count).into_par_iter().for_each(|index| task(index)));
    }
}

/// Runs every task on the calling thread, in index order.
#[derive(Debug, Clone, Copy)]
pub struct InlineScheduler {
    workers: usize,
}

impl InlineScheduler {
    /// `workers` is only reported through [`TaskScheduler::worker_count`] so
    /// callers still partition work as if that many threads existed.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

impl Default for InlineScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TaskScheduler for InlineScheduler {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn run_tasks(&self, task_count: usize, task: &(dyn Fn(usize) + Sync)) {
        (0..task_count).for_each(task);
    }
}
