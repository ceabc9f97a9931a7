//! Executors: where connection callbacks and request timers run.
//!
//! The execution core never mutates shared request state on an arbitrary
//! thread; everything that is not CAS- or lock-protected runs as a task on
//! the connection's executor. Keeping the executor behind a trait lets the
//! test suite inject a deterministic single-threaded one and assert ordering
//! without real concurrency.

use std::time::Duration;

use tokio::runtime::Handle;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on a connection's event loop.
pub trait Executor: Send + Sync {
    /// Runs `task` as soon as possible.
    fn execute(&self, task: Task);

    /// Runs `task` after `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
}

/// An [`Executor`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Wraps a runtime handle.
    pub fn new(handle: Handle) -> TokioExecutor {
        TokioExecutor { handle }
    }

    /// Wraps the runtime the caller is currently running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> TokioExecutor {
        TokioExecutor {
            handle: Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task()
        });
    }
}
