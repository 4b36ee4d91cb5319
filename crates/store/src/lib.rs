//! Content-addressed storage for the engine.
//!
//! [`Store`] is the facade the rest of the engine uses. It always has a
//! [`LocalStore`] on disk and may have a [`RemoteStore`] (remote CAS) and a
//! [`RemoteActionCache`]. Local misses fall through to the remote, and
//! remote hits are written back locally.
//!
//! Local filesystem work runs on the executor's blocking pool; remote work is
//! admission-controlled by the remote clients themselves (see [`remote`]).

pub mod local;
pub mod remote;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fs::{Directory, DirectoryTreeBuilder, FsError, PathStat, RelativePath};
use hashing::Digest;
use task_executor::Executor;
use thiserror::Error;

pub use local::LocalStore;
pub use remote::{
    ActionCacheProvider, ByteStoreProvider, RemoteActionCache, RemoteOptions, RemoteStore,
};

// ---------------------------------------------------------------------------
// EntryType
// ---------------------------------------------------------------------------

/// What kind of blob a digest refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
}

impl EntryType {
    pub(crate) const fn dir_name(self) -> &'static str {
        match self {
            Self::File => "files",
            Self::Directory => "directories",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from [`Store`] and its components.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A digest needed to complete an operation is in neither store.
    #[error("{entry_type} {digest} is missing from the store")]
    MissingDigest {
        /// Kind of the missing entry.
        entry_type: EntryType,
        /// The missing digest.
        digest: Digest,
    },

    /// Bytes on disk no longer match the digest they are stored under.
    #[error(
        "local store entry {} is corrupt: expected {expected}, found {actual}. \
         Delete the file and re-run to refetch it.",
        path.display()
    )]
    Corrupt {
        /// The digest the entry is stored under.
        expected: Digest,
        /// The digest of the bytes actually found.
        actual: Digest,
        /// Location of the corrupt entry.
        path: PathBuf,
    },

    /// The remote returned bytes that do not match the requested digest.
    #[error("remote store returned wrong bytes for {expected} (got {actual})")]
    RemoteCorrupt {
        /// The requested digest.
        expected: Digest,
        /// The digest of what came back.
        actual: Digest,
    },

    /// An auxiliary local entry (e.g. the action cache) could not be parsed.
    #[error("malformed store entry {}: {detail}", path.display())]
    MalformedEntry {
        /// Location of the entry.
        path: PathBuf,
        /// What was wrong.
        detail: String,
    },

    /// A remote request failed.
    #[error("remote {operation} failed: {message}")]
    Remote {
        /// The request kind.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// A remote request did not complete in time.
    #[error("remote {operation} timed out after {timeout:?}")]
    Timeout {
        /// The request kind.
        operation: &'static str,
        /// The configured limit.
        timeout: Duration,
    },

    /// Path or directory validation failed.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// A local I/O error.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A blocking task panicked or was cancelled.
    #[error("{0}")]
    Join(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Store {
    local: Arc<LocalStore>,
    remote: Option<RemoteStore>,
    action_cache: Option<RemoteActionCache>,
    executor: Executor,
}

impl Store {
    /// A store backed only by the local disk at `path`.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] if the store directory cannot be created.
    pub fn local_only(executor: Executor, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            local: Arc::new(LocalStore::new(path)?),
            remote: None,
            action_cache: None,
            executor,
        })
    }

    #[must_use]
    pub fn with_remote(mut self, remote: RemoteStore) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_remote_action_cache(mut self, action_cache: RemoteActionCache) -> Self {
        self.action_cache = Some(action_cache);
        self
    }

    #[must_use]
    pub const fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub fn local_root(&self) -> &Path {
        self.local.root()
    }

    #[must_use]
    pub const fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&LocalStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let local = Arc::clone(&self.local);
        let handle = self.executor.spawn_blocking(move || f(&local));
        task_executor::join_blocking(handle)
            .await
            .map_err(StoreError::Join)?
    }

    // -- bytes -------------------------------------------------------------

    /// Store bytes locally.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] on write failure.
    pub async fn store_bytes(&self, entry_type: EntryType, bytes: Bytes) -> Result<Digest, StoreError> {
        self.blocking(move |local| local.store_bytes(entry_type, &bytes))
            .await
    }

    /// Store file contents locally.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] on write failure.
    pub async fn store_file_bytes(&self, bytes: Bytes) -> Result<Digest, StoreError> {
        self.store_bytes(EntryType::File, bytes).await
    }

    /// Load bytes, consulting the remote (and backfilling locally) on a
    /// local miss.
    ///
    /// # Errors
    /// Propagates local and remote failures. A miss is `Ok(None)`.
    pub async fn load_bytes(
        &self,
        entry_type: EntryType,
        digest: Digest,
    ) -> Result<Option<Bytes>, StoreError> {
        let local = self
            .blocking(move |local| local.load_bytes(entry_type, digest))
            .await?;
        if let Some(bytes) = local {
            return Ok(Some(Bytes::from(bytes)));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(bytes) = remote.load(digest).await? else {
            return Ok(None);
        };
        tracing::debug!(%digest, %entry_type, "backfilling from remote store");
        self.store_bytes(entry_type, bytes.clone()).await?;
        Ok(Some(bytes))
    }

    /// Load file contents and apply `f` to them.
    ///
    /// # Errors
    /// Propagates failures from [`load_bytes`](Self::load_bytes).
    pub async fn load_file_bytes_with<T, F>(&self, digest: Digest, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&[u8]) -> T,
    {
        Ok(self
            .load_bytes(EntryType::File, digest)
            .await?
            .map(|bytes| f(&bytes)))
    }

    // -- directories -------------------------------------------------------

    /// # Errors
    /// Returns [`StoreError::Io`] on write failure.
    pub async fn record_directory(&self, directory: &Directory) -> Result<Digest, StoreError> {
        self.store_bytes(EntryType::Directory, Bytes::from(directory.to_bytes()))
            .await
    }

    /// # Errors
    /// Propagates load failures and decoding errors.
    pub async fn load_directory(&self, digest: Digest) -> Result<Option<Directory>, StoreError> {
        match self.load_bytes(EntryType::Directory, digest).await? {
            Some(bytes) => Ok(Some(Directory::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn require_directory(&self, digest: Digest) -> Result<Directory, StoreError> {
        self.load_directory(digest)
            .await?
            .ok_or(StoreError::MissingDigest {
                entry_type: EntryType::Directory,
                digest,
            })
    }

    /// Every entry reachable from the directory `root`, including `root`.
    ///
    /// # Errors
    /// Returns [`StoreError::MissingDigest`] if any directory is absent.
    pub async fn expand_directory(&self, root: Digest) -> Result<Vec<(EntryType, Digest)>, StoreError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut pending = vec![root];
        while let Some(digest) = pending.pop() {
            if !seen.insert(digest) {
                continue;
            }
            out.push((EntryType::Directory, digest));
            let directory = self.require_directory(digest).await?;
            out.extend(
                directory
                    .files
                    .iter()
                    .map(|f| (EntryType::File, f.digest)),
            );
            pending.extend(directory.directories.iter().map(|d| d.digest));
        }
        Ok(out)
    }

    /// Write the tree `digest` to `destination`, which is created if needed.
    ///
    /// # Errors
    /// Returns [`StoreError::MissingDigest`] if part of the tree is absent and
    /// [`StoreError::Io`] on write failure.
    pub async fn materialize_directory(
        &self,
        destination: PathBuf,
        digest: Digest,
    ) -> Result<(), StoreError> {
        let mut pending = vec![(destination, digest)];
        while let Some((dir_path, dir_digest)) = pending.pop() {
            let directory = self.require_directory(dir_digest).await?;
            let mut files = Vec::with_capacity(directory.files.len());
            for file in &directory.files {
                let bytes = self
                    .load_bytes(EntryType::File, file.digest)
                    .await?
                    .ok_or(StoreError::MissingDigest {
                        entry_type: EntryType::File,
                        digest: file.digest,
                    })?;
                files.push((dir_path.join(&file.name), bytes, file.is_executable));
            }
            let target = dir_path.clone();
            self.blocking(move |_| write_files(&target, files)).await?;
            pending.extend(
                directory
                    .directories
                    .iter()
                    .map(|d| (dir_path.join(&d.name), d.digest)),
            );
        }
        Ok(())
    }

    /// Capture `paths` under `root` into the store, returning the digest of
    /// the resulting tree. Paths that do not exist are skipped.
    ///
    /// # Errors
    /// Returns [`StoreError::Fs`] for path collisions and
    /// [`StoreError::Io`] for unreadable files.
    pub async fn snapshot_of(
        &self,
        root: PathBuf,
        paths: BTreeSet<RelativePath>,
    ) -> Result<Digest, StoreError> {
        self.blocking(move |local| {
            let mut builder = DirectoryTreeBuilder::new();
            for path in &paths {
                for stat in fs::scan(&root, path)? {
                    match stat {
                        PathStat::Dir { path } => builder.add_directory(&path)?,
                        PathStat::File {
                            path,
                            is_executable,
                        } => {
                            let abs = root.join(&path);
                            let bytes =
                                std::fs::read(&abs).map_err(|e| StoreError::io(&abs, e))?;
                            let digest = local.store_bytes(EntryType::File, &bytes)?;
                            builder.add_file(&path, digest, is_executable)?;
                        }
                    }
                }
            }
            let tree = builder.build()?;
            for (_, directory) in &tree.directories {
                local.store_bytes(EntryType::Directory, &directory.to_bytes())?;
            }
            Ok(tree.root)
        })
        .await
    }

    // -- remote ------------------------------------------------------------

    /// Upload every entry reachable from the directories `roots` that the
    /// remote lacks. A no-op without a remote.
    ///
    /// # Errors
    /// Propagates local misses and remote failures.
    pub async fn ensure_remote_has_recursive(&self, roots: Vec<Digest>) -> Result<(), StoreError> {
        if self.remote.is_none() {
            return Ok(());
        }
        let mut entries = Vec::new();
        for root in roots {
            entries.extend(self.expand_directory(root).await?);
        }
        self.upload_missing(entries).await
    }

    /// Upload the given file digests if the remote lacks them.
    ///
    /// # Errors
    /// Propagates local misses and remote failures.
    pub async fn ensure_remote_has_files(&self, digests: Vec<Digest>) -> Result<(), StoreError> {
        self.upload_missing(digests.into_iter().map(|d| (EntryType::File, d)).collect())
            .await
    }

    async fn upload_missing(&self, entries: Vec<(EntryType, Digest)>) -> Result<(), StoreError> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let missing = remote
            .list_missing_digests(entries.iter().map(|(_, d)| *d).collect())
            .await?;
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = missing.len(), "uploading missing digests");
        let mut uploaded = HashSet::new();
        let uploads = entries
            .into_iter()
            .filter(|(_, digest)| missing.contains(digest) && uploaded.insert(*digest))
            .map(|(entry_type, digest)| async move {
                let bytes = self
                    .blocking(move |local| local.load_bytes(entry_type, digest))
                    .await?
                    .ok_or(StoreError::MissingDigest { entry_type, digest })?;
                remote.store_bytes(digest, Bytes::from(bytes)).await
            });
        futures::future::try_join_all(uploads).await?;
        Ok(())
    }

    // -- action cache ------------------------------------------------------

    /// Look up the result recorded for `action`, locally then remotely.
    ///
    /// # Errors
    /// Propagates local and remote failures.
    pub async fn load_action_result(&self, action: Digest) -> Result<Option<Digest>, StoreError> {
        if let Some(result) = self
            .blocking(move |local| local.load_action_result(action))
            .await?
        {
            return Ok(Some(result));
        }
        let Some(cache) = &self.action_cache else {
            return Ok(None);
        };
        let found = cache.get_action_result(action).await?;
        if let Some(result) = found {
            self.blocking(move |local| local.record_action_result(action, result))
                .await?;
        }
        Ok(found)
    }

    /// Record `result` for `action` locally and, if configured, remotely.
    ///
    /// # Errors
    /// Propagates local and remote failures.
    pub async fn record_action_result(&self, action: Digest, result: Digest) -> Result<(), StoreError> {
        self.blocking(move |local| local.record_action_result(action, result))
            .await?;
        if let Some(cache) = &self.action_cache {
            cache.update_action_result(action, result).await?;
        }
        Ok(())
    }
}

fn write_files(dir: &Path, files: Vec<(PathBuf, Bytes, bool)>) -> Result<(), StoreError> {
    fs::safe_create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    for (path, bytes, is_executable) in files {
        std::fs::write(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        if is_executable {
            set_executable(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}
