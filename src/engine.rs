//! The narrow capability surface the CLI and the Python module are built on.
//!
//! An [`Engine`] owns the executor, the store and the runner stack:
//!
//! ```text
//! cache::CommandRunner      action cache (local, plus remote if configured)
//!   └─ bounded::CommandRunner   at most `local.parallelism` at once
//!        └─ local::CommandRunner   one sandbox per process
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fs::{FsError, RelativePath};
use hashing::Digest;
use process_execution::{
    CommandRunner, Context, FallibleProcessResultWithPlatform, NamedCaches, Process, ProcessError,
    bounded, cache, local,
};
use store::{
    ActionCacheProvider, ByteStoreProvider, EntryType, RemoteActionCache, RemoteStore, Store,
    StoreError,
};
use task_executor::Executor;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::entry_point::{self, EntryPoint, EntryPointError, ResolvedPexEntryPoint};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    EntryPoint(#[from] EntryPointError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("{0}")]
    Join(String),
}

/// Remote backends to attach at construction. Both are optional; the remote
/// action cache is only consulted when a remote store is present too, since
/// cached results are useless without their outputs.
#[derive(Clone, Default)]
pub struct Remotes {
    pub store: Option<Arc<dyn ByteStoreProvider>>,
    pub action_cache: Option<Arc<dyn ActionCacheProvider>>,
}

#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    executor: Executor,
    store: Store,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// An engine with its own runtime and no remotes, for synchronous
    /// callers.
    ///
    /// # Errors
    /// Returns [`EngineError::Runtime`] if the runtime cannot start and
    /// [`EngineError::Store`] if the store directory cannot be created.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let executor = Executor::new().map_err(EngineError::Runtime)?;
        Self::with_remotes(executor, config, Remotes::default())
    }

    /// # Errors
    /// Returns [`EngineError::Store`] if the store directory cannot be
    /// created.
    pub fn with_remotes(
        executor: Executor,
        config: EngineConfig,
        remotes: Remotes,
    ) -> Result<Self, EngineError> {
        let mut store = Store::local_only(executor.clone(), &config.store.path)?;
        if let Some(provider) = remotes.store {
            store = store.with_remote(RemoteStore::new(provider, config.remote.store_options()));
            if let Some(provider) = remotes.action_cache {
                store = store.with_remote_action_cache(RemoteActionCache::new(
                    provider,
                    config.remote.cache_options(),
                ));
            }
        } else if remotes.action_cache.is_some() {
            tracing::warn!("ignoring remote action cache: no remote store is configured");
        }

        let local = local::CommandRunner::new(
            store.clone(),
            executor.clone(),
            config.local.work_dir.clone(),
            NamedCaches::new(&config.local.named_caches_dir),
            config.local.keep_sandboxes,
        );
        let bounded = bounded::CommandRunner::new(Arc::new(local), config.local.parallelism);
        let runner = cache::CommandRunner::new(Arc::new(bounded), store.clone());
        tracing::debug!(
            store = %config.store.path.display(),
            parallelism = config.local.parallelism,
            remote = store.has_remote(),
            "engine ready"
        );
        Ok(Self {
            config,
            executor,
            store,
            runner: Arc::new(runner),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Run `process` through the cache, the concurrency limit and a local
    /// sandbox. A non-zero exit code is a successful run.
    ///
    /// # Errors
    /// Returns [`EngineError::Process`] if the process could not be run at
    /// all.
    pub async fn run_process(
        &self,
        context: Context,
        mut process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, EngineError> {
        if process.execution_slot_variable.is_none() {
            process
                .execution_slot_variable
                .clone_from(&self.config.local.execution_slot_variable);
        }
        Ok(self.runner.run(context, process).await?)
    }

    /// # Errors
    /// Returns [`EngineError::Store`] on write failure.
    pub async fn store_bytes(&self, bytes: Bytes) -> Result<Digest, EngineError> {
        Ok(self.store.store_file_bytes(bytes).await?)
    }

    /// File contents for `digest`, or `None` if no store has them.
    ///
    /// # Errors
    /// Returns [`EngineError::Store`] on read failure.
    pub async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, EngineError> {
        Ok(self.store.load_bytes(EntryType::File, digest).await?)
    }

    /// Capture the files under `root` matching `globs` as an input tree.
    ///
    /// # Errors
    /// Returns [`EngineError::Fs`] for invalid globs and
    /// [`EngineError::Store`] for unreadable files.
    pub async fn capture(&self, root: PathBuf, globs: Vec<String>) -> Result<Digest, EngineError> {
        let scan_root = root.clone();
        let paths = self
            .blocking(move || fs::expand_globs(&scan_root, &globs))
            .await??;
        tracing::debug!(root = %root.display(), files = paths.len(), "capturing inputs");
        Ok(self
            .store
            .snapshot_of(root, paths.into_iter().collect::<BTreeSet<_>>())
            .await?)
    }

    /// Write the tree `digest` to `destination`.
    ///
    /// # Errors
    /// Returns [`EngineError::Store`] if the tree is incomplete or cannot be
    /// written.
    pub async fn materialize(&self, destination: PathBuf, digest: Digest) -> Result<(), EngineError> {
        Ok(self.store.materialize_directory(destination, digest).await?)
    }

    /// Resolve a `pex_binary` entry point found in `spec_path`.
    ///
    /// # Errors
    /// Returns [`EngineError::EntryPoint`] for malformed or unresolvable
    /// values.
    pub async fn resolve_entry_point(
        &self,
        value: &str,
        spec_path: RelativePath,
        build_root: &Path,
        source_roots: Vec<RelativePath>,
    ) -> Result<ResolvedPexEntryPoint, EngineError> {
        let origin = format!("{}'s `entry_point` field", spec_path.as_path().display());
        let entry_point = EntryPoint::parse(value, Some(&origin))?;
        let build_root = build_root.to_owned();
        let resolved = self
            .blocking(move || {
                entry_point::resolve_pex_entry_point(
                    &entry_point,
                    &spec_path,
                    &build_root,
                    &source_roots,
                    &origin,
                )
            })
            .await??;
        Ok(resolved)
    }

    /// Stop an owned runtime. Must be called from synchronous code.
    pub fn shutdown(&self, timeout: Duration) {
        self.executor.shutdown(timeout);
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        task_executor::join_blocking(self.executor.spawn_blocking(f))
            .await
            .map_err(EngineError::Join)
    }
}
