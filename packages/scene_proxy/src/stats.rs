use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what happened to the compile tasks started by an engine.
///
/// Discards are the expected outcome of racing updates, not errors. A task is discarded before
/// compiling if its proxy was removed or updated again before the task got to run, and after
/// compiling if that happened while the task was compiling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct EngineStats {
    /// Compile tasks handed to the spawner.
    pub compiles_started: u64,

    /// Tasks that found their ticket stale before compiling and skipped the compile.
    pub discarded_before_compile: u64,

    /// Tasks whose compiled object was thrown away because the ticket went stale meanwhile.
    pub discarded_after_compile: u64,

    /// Compiled objects installed on their proxy.
    pub applied: u64,

    /// Compiles that returned an error.
    pub failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    compiles_started: AtomicU64,
    discarded_before_compile: AtomicU64,
    discarded_after_compile: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn compile_started(&self) {
        self.compiles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discarded_before_compile(&self) {
        self.discarded_before_compile.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discarded_after_compile(&self) {
        self.discarded_after_compile.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        EngineStats {
            compiles_started: self.compiles_started.load(Ordering::Relaxed),
            discarded_before_compile: self.discarded_before_compile.load(Ordering::Relaxed),
            discarded_after_compile: self.discarded_after_compile.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
