//! Worker pool for parallel sub-steps
//!
//! Workers are scoped threads: every job submitted during [`WorkerPool::scope`]
//! has finished by the time it returns, so nothing outlives the stage that
//! submitted it.

use crate::pipeline::{Flow, StepResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::thread;

type Job<'env> = Box<dyn FnOnce() -> StepResult + Send + 'env>;

/// Worker identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

struct QueueState<'env> {
    jobs: VecDeque<(usize, Job<'env>)>,
    submitted: usize,
    closed: bool,
}

struct Queue<'env> {
    state: Mutex<QueueState<'env>>,
    ready: Condvar,
    results: Mutex<Vec<(usize, StepResult)>>,
}

impl<'env> Queue<'env> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                submitted: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            results: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, job: Job<'env>) {
        let mut state = self.state.lock();
        let index = state.submitted;
        state.submitted += 1;
        state.jobs.push_back((index, job));
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<(usize, Job<'env>)> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

/// Closes the queue even if the submitting closure panics
struct CloseOnDrop<'q, 'env>(&'q Queue<'env>);

impl Drop for CloseOnDrop<'_, '_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Handle for submitting jobs inside [`WorkerPool::scope`]
pub struct Batch<'q, 'env> {
    queue: &'q Queue<'env>,
}

impl<'env> Batch<'_, 'env> {
    /// Queues a job; it may start immediately on an idle worker
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() -> StepResult + Send + 'env,
    {
        self.queue.push(Box::new(job));
    }
}

/// Bounded pool of worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

impl WorkerPool {
    /// Creates a pool with `workers` threads, at least one
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Number of worker threads
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `submit`, executing the jobs it submits on the pool
    ///
    /// Returns after every job has finished. The combined result is the
    /// first fault in submission order, else the first early-exit signal,
    /// else `Ok`.
    pub fn scope<'env, F>(&self, submit: F) -> StepResult
    where
        F: for<'q> FnOnce(&Batch<'q, 'env>),
    {
        let queue = Queue::new();

        thread::scope(|scope| {
            for id in 0..self.workers {
                let queue = &queue;
                let worker = WorkerId(id);
                let spawned = thread::Builder::new()
                    .name(format!("danube-{worker}"))
                    .spawn_scoped(scope, move || {
                        while let Some((index, job)) = queue.pop() {
                            tracing::trace!(%worker, job = index, "Running job");
                            let result = job();
                            queue.results.lock().push((index, result));
                        }
                    });
                if let Err(e) = spawned {
                    tracing::warn!(%worker, error = %e, "Could not start worker thread");
                }
            }

            let _close = CloseOnDrop(&queue);
            submit(&Batch { queue: &queue });
        });

        let state = queue.state.into_inner();
        if !state.jobs.is_empty() {
            return Err(Flow::fail(format!(
                "{} parallel jobs never ran, no worker thread available",
                state.jobs.len()
            )));
        }

        let mut results = queue.results.into_inner();
        results.sort_by_key(|(index, _)| *index);
        combine(results.into_iter().map(|(_, result)| result))
    }
}

fn combine(results: impl Iterator<Item = StepResult>) -> StepResult {
    let mut stop = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(fault @ Flow::Fault(_)) => return Err(fault),
            Err(signal @ Flow::Stop { .. }) => {
                stop.get_or_insert(signal);
            }
        }
    }
    stop.map_or(Ok(()), Err)
}
