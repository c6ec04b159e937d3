/// A unit of background work handed to a [`TaskSpawner`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs compile tasks on behalf of a [`ProxyEngine`][crate::ProxyEngine].
///
/// The engine never calls `spawn()` while holding one of its locks, so an implementation may
/// run the task before returning.
pub trait TaskSpawner: Send + Sync {
    /// Schedules a task for execution. The task may run on any thread, in any order relative
    /// to other tasks.
    fn spawn(&self, task: Task);
}

/// Runs every task on the calling thread before `spawn()` returns.
///
/// Useful for hosts that want compile results to be visible as soon as the engine call that
/// started the compile returns, and for deterministic tests.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, task: Task) {
        task();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn inline_spawner_runs_before_returning() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        InlineSpawner.spawn(Box::new(move || ran_clone.store(true, Ordering::Relaxed)));

        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn inline_spawner_runs_on_calling_thread() {
        thread_local! {
            static MARK: Cell<bool> = const { Cell::new(false) };
        }

        InlineSpawner.spawn(Box::new(|| MARK.with(|mark| mark.set(true))));

        assert!(MARK.with(Cell::get));
    }
}
