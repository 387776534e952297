//! Generic worker pool with an out-of-order result queue.
//!
//! Path exploration produces more work while it runs: a forked context is a
//! new task scheduled from inside the task that forked it. The scheduler is
//! therefore a plain task-in, result-out pool with no notion of batches. The
//! driver drains results with [`Scheduler::wait_for_result`], which blocks
//! until a result arrives and returns `None` once the queue is empty and
//! every worker has gone idle, so "all paths finished" needs no external
//! bookkeeping.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of work producing one result.
pub trait Task<R>: Send {
    /// Runs the task to completion.
    fn execute(self: Box<Self>) -> R;
}

impl<R, F> Task<R> for F
where
    F: FnOnce() -> R + Send,
{
    fn execute(self: Box<Self>) -> R {
        (*self)()
    }
}

enum Job<R> {
    Run(Box<dyn Task<R>>),
    Rendezvous {
        barrier: Arc<(Mutex<usize>, Condvar)>,
        total: usize,
    },
}

struct State<R> {
    jobs: VecDeque<Job<R>>,
    results: VecDeque<R>,
    active: usize,
    shutdown: bool,
}

struct Shared<R> {
    state: Mutex<State<R>>,
    job_ready: Condvar,
    result_ready: Condvar,
}

/// Fixed-size worker pool.
///
/// Threads are spawned lazily on the first scheduled task. Dropping the
/// scheduler shuts the workers down and joins them; queued but unstarted
/// jobs are discarded at that point.
pub struct Scheduler<R> {
    shared: Arc<Shared<R>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_target: usize,
}

impl<R: Send + 'static> Scheduler<R> {
    /// Creates a pool sized to the machine's available parallelism.
    #[must_use]
    pub fn new() -> Scheduler<R> {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        Scheduler::with_workers(workers)
    }

    /// Creates a pool with an explicit worker count.
    #[must_use]
    pub fn with_workers(worker_target: usize) -> Scheduler<R> {
        Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    jobs: VecDeque::new(),
                    results: VecDeque::new(),
                    active: 0,
                    shutdown: false,
                }),
                job_ready: Condvar::new(),
                result_ready: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
            worker_target: worker_target.max(1),
        }
    }

    /// Configured worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_target
    }

    /// Queues a task unconditionally.
    pub fn schedule(&self, task: Box<dyn Task<R>>) {
        self.spawn_workers();
        let mut state = lock!(self.shared.state);
        state.jobs.push_back(Job::Run(task));
        drop(state);
        self.shared.job_ready.notify_one();
    }

    /// Queues a task only while the backlog is shallower than the pool.
    ///
    /// Returns the task unconsumed when the pool is saturated, so the caller
    /// can run it inline instead.
    pub fn try_schedule(&self, task: Box<dyn Task<R>>) -> Option<Box<dyn Task<R>>> {
        {
            let state = lock!(self.shared.state);
            if state.jobs.len() >= self.worker_target {
                return Some(task);
            }
        }
        self.schedule(task);
        None
    }

    /// Pushes a result without going through a task.
    pub fn yield_result(&self, result: R) {
        let mut state = lock!(self.shared.state);
        state.results.push_back(result);
        drop(state);
        self.shared.result_ready.notify_all();
    }

    /// Blocks until a result is available or the pool has drained.
    ///
    /// `None` means the job queue is empty and every worker is idle, which
    /// with self-scheduling tasks is exactly "no more results will come".
    pub fn wait_for_result(&self) -> Option<R> {
        let mut state = lock!(self.shared.state);
        loop {
            if let Some(result) = state.results.pop_front() {
                return Some(result);
            }
            if state.active == 0 && state.jobs.is_empty() {
                return None;
            }
            state = self
                .shared
                .result_ready
                .wait(state)
                .expect("Failed to acquire lock");
        }
    }

    /// Rendezvous of every worker thread.
    ///
    /// Returns once all workers have finished the jobs queued before the
    /// call and met at the barrier. A pool that has not spawned yet has
    /// nothing to rendezvous with.
    pub fn synchronize(&self) {
        let total = lock!(self.workers).len();
        if total == 0 {
            return;
        }
        let barrier = Arc::new((Mutex::new(0usize), Condvar::new()));
        {
            let mut state = lock!(self.shared.state);
            for _ in 0..total {
                state.jobs.push_back(Job::Rendezvous {
                    barrier: Arc::clone(&barrier),
                    total,
                });
            }
        }
        self.shared.job_ready.notify_all();

        let (count, arrived) = &*barrier;
        let mut count = lock!(count);
        while *count < total {
            count = arrived.wait(count).expect("Failed to acquire lock");
        }
    }

    fn spawn_workers(&self) {
        let mut workers = lock!(self.workers);
        if !workers.is_empty() {
            return;
        }
        {
            let mut state = lock!(self.shared.state);
            state.active = self.worker_target;
        }
        for _ in 0..self.worker_target {
            let shared = Arc::clone(&self.shared);
            workers.push(std::thread::spawn(move || worker_loop(&shared)));
        }
    }
}

impl<R: Send + 'static> Default for Scheduler<R> {
    fn default() -> Scheduler<R> {
        Scheduler::new()
    }
}

impl<R> Drop for Scheduler<R> {
    fn drop(&mut self) {
        {
            let mut state = lock!(self.shared.state);
            state.shutdown = true;
        }
        self.shared.job_ready.notify_all();
        let mut workers = lock!(self.workers);
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop<R>(shared: &Shared<R>) {
    let mut state = lock!(shared.state);
    loop {
        while state.jobs.is_empty() {
            if state.shutdown {
                return;
            }
            state.active -= 1;
            if state.active == 0 {
                shared.result_ready.notify_all();
            }
            state = shared
                .job_ready
                .wait(state)
                .expect("Failed to acquire lock");
            state.active += 1;
        }
        let Some(job) = state.jobs.pop_front() else {
            continue;
        };
        drop(state);

        match job {
            Job::Run(task) => {
                let result = task.execute();
                state = lock!(shared.state);
                state.results.push_back(result);
                shared.result_ready.notify_all();
            }
            Job::Rendezvous { barrier, total } => {
                let (count, arrived) = &*barrier;
                let mut count = lock!(count);
                *count += 1;
                if *count >= total {
                    arrived.notify_all();
                } else {
                    while *count < total {
                        count = arrived.wait(count).expect("Failed to acquire lock");
                    }
                }
                drop(count);
                state = lock!(shared.state);
            }
        }
    }
}
