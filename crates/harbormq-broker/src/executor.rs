//! Background task execution.
//!
//! Journal deletes issued by the duplicate-id cache and page depaging must not
//! run on the thread that triggered them; they are handed to an [`Executor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::debug;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the caller's thread.
pub trait Executor: Send + Sync {
    /// Schedules `task`.
    fn execute(&self, task: Task);
}

/// Runs tasks on the tokio blocking pool.
///
/// Clones share the count of scheduled tasks, so [`TokioExecutor::drain`]
/// on any clone waits for work scheduled through all of them.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Marks a task finished even if it panics.
struct Finished {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl TokioExecutor {
    /// Wraps a runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Number of scheduled tasks that have not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until every scheduled task has finished, including tasks
    /// scheduled by the tasks being waited on.
    pub async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Uses the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let finished = Finished {
            in_flight: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        };
        let _ = self.handle.spawn_blocking(move || {
            let _finished = finished;
            task();
        });
        debug!("task scheduled on blocking pool");
    }
}

/// Runs tasks inline; used where ordering must be deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
