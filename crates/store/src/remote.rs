//! Clients for a remote CAS and action cache.
//!
//! The wire protocol is behind [`ByteStoreProvider`] and
//! [`ActionCacheProvider`]; this module adds the admission control every
//! remote request goes through: at most `concurrency_limit` requests are in
//! flight per client, and each is bounded by `timeout`. Callers beyond the
//! limit wait for a permit rather than fail. Dropping a waiting or running
//! request releases its slot.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::Digest;
use tokio::sync::Semaphore;

use crate::StoreError;

/// A remote content-addressed store.
///
/// Files and directories share one keyspace remotely.
#[async_trait]
pub trait ByteStoreProvider: Send + Sync + 'static {
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String>;

    async fn load(&self, digest: Digest) -> Result<Option<Bytes>, String>;

    /// Return the subset of `digests` the remote does not have.
    async fn list_missing_digests(&self, digests: Vec<Digest>) -> Result<HashSet<Digest>, String>;
}

/// A remote map from action digests to result digests.
#[async_trait]
pub trait ActionCacheProvider: Send + Sync + 'static {
    async fn get_action_result(&self, action: Digest) -> Result<Option<Digest>, String>;

    async fn update_action_result(&self, action: Digest, result: Digest) -> Result<(), String>;
}

/// Limits applied to one remote client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteOptions {
    pub concurrency_limit: usize,
    pub timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 128,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Semaphore-based admission control shared by the remote clients.
#[derive(Debug)]
struct RequestLimiter {
    permits: Semaphore,
    limit: usize,
    timeout: Duration,
    started: AtomicUsize,
}

impl RequestLimiter {
    fn new(options: RemoteOptions) -> Self {
        let limit = options.concurrency_limit.max(1);
        Self {
            permits: Semaphore::new(limit),
            limit,
            timeout: options.timeout,
            started: AtomicUsize::new(0),
        }
    }

    async fn run<T, F>(&self, operation: &'static str, request: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, String>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Remote {
                operation,
                message: "request limiter was closed".to_owned(),
            })?;
        self.started.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => {
                tracing::warn!(operation, %message, "remote request failed");
                Err(StoreError::Remote { operation, message })
            }
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "remote request timed out");
                Err(StoreError::Timeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

/// A concurrency-limited client for a remote CAS.
#[derive(Clone)]
pub struct RemoteStore {
    provider: Arc<dyn ByteStoreProvider>,
    limiter: Arc<RequestLimiter>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    pub fn new(provider: Arc<dyn ByteStoreProvider>, options: RemoteOptions) -> Self {
        Self {
            provider,
            limiter: Arc::new(RequestLimiter::new(options)),
        }
    }

    /// Upload `bytes`, which must hash to `digest`.
    ///
    /// # Errors
    /// Returns [`StoreError::Remote`] or [`StoreError::Timeout`].
    pub async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), StoreError> {
        self.limiter
            .run("store_bytes", self.provider.store_bytes(digest, bytes))
            .await
    }

    /// Download `digest`, verifying the returned bytes.
    ///
    /// # Errors
    /// Returns [`StoreError::Remote`], [`StoreError::Timeout`], or
    /// [`StoreError::RemoteCorrupt`] if the remote returned the wrong bytes.
    pub async fn load(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
        let loaded = self.limiter.run("load", self.provider.load(digest)).await?;
        if let Some(bytes) = &loaded {
            let actual = Digest::of_bytes(bytes);
            if actual != digest {
                return Err(StoreError::RemoteCorrupt {
                    expected: digest,
                    actual,
                });
            }
        }
        Ok(loaded)
    }

    /// # Errors
    /// Returns [`StoreError::Remote`] or [`StoreError::Timeout`].
    pub async fn list_missing_digests(
        &self,
        digests: Vec<Digest>,
    ) -> Result<HashSet<Digest>, StoreError> {
        if digests.is_empty() {
            return Ok(HashSet::new());
        }
        self.limiter
            .run(
                "list_missing_digests",
                self.provider.list_missing_digests(digests),
            )
            .await
    }

    /// Requests currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limiter.in_flight()
    }

    /// Requests that have been admitted since creation.
    #[must_use]
    pub fn requests_started(&self) -> usize {
        self.limiter.started.load(Ordering::Relaxed)
    }
}

/// A concurrency-limited client for a remote action cache.
#[derive(Clone)]
pub struct RemoteActionCache {
    provider: Arc<dyn ActionCacheProvider>,
    limiter: Arc<RequestLimiter>,
}

impl std::fmt::Debug for RemoteActionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteActionCache")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RemoteActionCache {
    pub fn new(provider: Arc<dyn ActionCacheProvider>, options: RemoteOptions) -> Self {
        Self {
            provider,
            limiter: Arc::new(RequestLimiter::new(options)),
        }
    }

    /// # Errors
    /// Returns [`StoreError::Remote`] or [`StoreError::Timeout`].
    pub async fn get_action_result(&self, action: Digest) -> Result<Option<Digest>, StoreError> {
        self.limiter
            .run("get_action_result", self.provider.get_action_result(action))
            .await
    }

    /// # Errors
    /// Returns [`StoreError::Remote`] or [`StoreError::Timeout`].
    pub async fn update_action_result(
        &self,
        action: Digest,
        result: Digest,
    ) -> Result<(), StoreError> {
        self.limiter
            .run(
                "update_action_result",
                self.provider.update_action_result(action, result),
            )
            .await
    }

    #[must_use]
    pub fn requests_started(&self) -> usize {
        self.limiter.started.load(Ordering::Relaxed)
    }
}
