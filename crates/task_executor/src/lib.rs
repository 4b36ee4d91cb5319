//! A cloneable handle to the tokio runtime the engine runs on.
//!
//! An [`Executor`] either owns its runtime (the CLI and the Python extension,
//! which are entered from synchronous code) or borrows the ambient one
//! (tests, and code already running inside tokio). Clones share the runtime.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Owns a runtime and shuts it down without blocking when dropped, so that
/// the last clone may be released from inside an async context.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    runtime: Option<Arc<Mutex<OwnedRuntime>>>,
    handle: Handle,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("owned", &self.runtime.is_some())
            .finish()
    }
}

impl Executor {
    /// Create an executor owning a multi-threaded runtime with one worker
    /// per CPU.
    ///
    /// # Errors
    /// Returns the I/O error from building the runtime.
    pub fn new() -> io::Result<Self> {
        Self::build(Builder::new_multi_thread())
    }

    /// Create an executor owning a multi-threaded runtime with exactly
    /// `worker_threads` workers.
    ///
    /// # Errors
    /// Returns the I/O error from building the runtime.
    pub fn new_owned(worker_threads: usize) -> io::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.worker_threads(worker_threads.max(1));
        Self::build(builder)
    }

    fn build(mut builder: Builder) -> io::Result<Self> {
        let runtime = builder
            .enable_all()
            .thread_name("engine-worker")
            .build()?;
        let handle = runtime.handle().clone();
        tracing::debug!("started owned tokio runtime");
        Ok(Self {
            runtime: Some(Arc::new(Mutex::new(OwnedRuntime(Some(runtime))))),
            handle,
        })
    }

    /// Borrow the runtime the caller is running on.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime, like [`Handle::current`].
    #[must_use]
    pub fn from_current() -> Self {
        Self::from_handle(Handle::current())
    }

    #[must_use]
    pub const fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            handle,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run blocking work (filesystem access, hashing large files) on the
    /// runtime's blocking pool.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Drive `future` to completion from synchronous code.
    ///
    /// Must not be called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Stop an owned runtime, waiting up to `timeout` for tasks to finish.
    /// A no-op for borrowed runtimes.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let taken = runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .take();
        if let Some(runtime) = taken {
            tracing::debug!(?timeout, "shutting down tokio runtime");
            runtime.shutdown_timeout(timeout);
        }
    }

    /// True once [`shutdown`](Self::shutdown) has run on an owned runtime.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.runtime.as_ref().is_some_and(|runtime| {
            runtime
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .0
                .is_none()
        })
    }
}

/// Await a blocking-pool task, converting a panic or cancellation into an
/// error message.
///
/// # Errors
/// Returns a description of the join failure.
pub async fn join_blocking<R>(handle: JoinHandle<R>) -> Result<R, String> {
    handle
        .await
        .map_err(|e| format!("blocking task failed: {e}"))
}
