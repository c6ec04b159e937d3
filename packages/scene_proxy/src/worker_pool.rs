use std::any::Any;
use std::fmt;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use new_zealand::nz;
use tracing::{debug, error, trace};

use crate::{Task, TaskSpawner};

const DEFAULT_WORKER_COUNT: NonZero<usize> = nz!(2);

enum Message {
    Run(Task),
    Shutdown,
}

/// A set of background threads that run compile tasks.
///
/// Tasks are executed in the order they were spawned, by whichever worker is free first. A task
/// that panics is logged and does not take its worker down.
///
/// # Lifetime
///
/// When the pool is dropped, every task spawned before the drop still runs, after which the
/// workers exit and the drop returns. Tasks spawned afterwards through a leftover
/// [`Scheduler`] are dropped without running.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use scene_proxy::{TaskSpawner, WorkerPool};
///
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let pool = WorkerPool::new();
///
/// for _ in 0..10 {
///     let counter = Arc::clone(&counter);
///     pool.spawn(Box::new(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }));
/// }
///
/// drop(pool);
/// assert_eq!(counter.load(Ordering::Relaxed), 10);
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    scheduler: Scheduler,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool with default settings.
    ///
    /// Use [`WorkerPool::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the pool.
    #[must_use]
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    /// Returns a handle that spawns tasks on this pool.
    ///
    /// The scheduler can be cloned and shared across threads.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSpawner for WorkerPool {
    fn spawn(&self, task: Task) {
        self.scheduler.spawn(task);
    }
}

impl Drop for WorkerPool {
    #[cfg_attr(test, mutants::skip)] // Removing this causes workers to outlive the pool.
    fn drop(&mut self) {
        // Each worker consumes exactly one shutdown message, after all tasks queued before it.
        for _ in 0..self.workers.len() {
            // The workers hold the receiver, so this cannot fail while any of them is alive.
            _ = self.scheduler.sender.send(Message::Shutdown);
        }

        for worker in self.workers.drain(..) {
            if let Err(payload) = worker.join() {
                // Workers catch task panics, so this means the worker loop itself is broken.
                panic::resume_unwind(payload);
            }
        }
    }
}

/// A handle for spawning tasks on a [`WorkerPool`].
///
/// Schedulers are cheaply cloneable and can be shared across threads. All clones reference the
/// same pool.
#[derive(Clone, Debug)]
pub struct Scheduler {
    sender: Sender<Message>,
}

impl TaskSpawner for Scheduler {
    fn spawn(&self, task: Task) {
        if self.sender.send(Message::Run(task)).is_err() {
            debug!("worker pool has shut down, dropping task");
            return;
        }

        trace!("spawned task");
    }
}

/// Builder for configuring a [`WorkerPool`].
#[derive(Debug)]
#[must_use]
pub struct WorkerPoolBuilder {
    worker_count: NonZero<usize>,
}

impl WorkerPoolBuilder {
    fn new() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Default is 2.
    pub fn worker_count(mut self, count: NonZero<usize>) -> Self {
        self.worker_count = count;
        self
    }

    /// Builds the pool, starting its worker threads.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be started.
    #[must_use]
    pub fn build(self) -> WorkerPool {
        let (sender, receiver) = channel::unbounded();

        let workers = (0..self.worker_count.get())
            .map(|worker_index| {
                let receiver = receiver.clone();

                thread::Builder::new()
                    .name(format!("scene-proxy-w{worker_index}"))
                    .spawn(move || {
                        debug!(worker_index, "worker thread started");
                        worker_loop(&receiver, worker_index);
                        debug!(worker_index, "worker thread exiting");
                    })
                    .expect("failed to spawn worker thread: thread spawning failure is not supported")
            })
            .collect();

        WorkerPool {
            scheduler: Scheduler { sender },
            workers,
        }
    }
}

fn worker_loop(receiver: &Receiver<Message>, worker_index: usize) {
    while let Ok(Message::Run(task)) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                worker_index,
                message = panic_message(payload.as_ref()),
                "task panicked"
            );
        } else {
            trace!(worker_index, "executed task");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(_) => f.write_str("Run"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}
