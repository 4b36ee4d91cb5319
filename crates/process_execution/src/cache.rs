//! Serves process results from the action cache.
//!
//! The action cache maps a process's [`Process::action_digest`] to the
//! digest of a small JSON record of its result. Lookups go to the local
//! store first and then the remote action cache (see
//! [`Store::load_action_result`]). Cache failures are logged and treated as
//! misses: they never fail the process.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::Digest;
use serde::{Deserialize, Serialize};
use store::Store;
use tracing::Instrument as _;

use crate::{
    Context, FallibleProcessResultWithPlatform, Platform, Process, ProcessCacheScope,
    ProcessError, ProcessResultMetadata,
};

/// The stored form of a cached result.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CachedResult {
    stdout_digest: Digest,
    stderr_digest: Digest,
    exit_code: i32,
    output_directory: Digest,
    platform: Platform,
}

impl From<&FallibleProcessResultWithPlatform> for CachedResult {
    fn from(result: &FallibleProcessResultWithPlatform) -> Self {
        Self {
            stdout_digest: result.stdout_digest,
            stderr_digest: result.stderr_digest,
            exit_code: result.exit_code,
            output_directory: result.output_directory,
            platform: result.platform,
        }
    }
}

impl CachedResult {
    fn into_result(self) -> FallibleProcessResultWithPlatform {
        FallibleProcessResultWithPlatform {
            stdout_digest: self.stdout_digest,
            stderr_digest: self.stderr_digest,
            exit_code: self.exit_code,
            output_directory: self.output_directory,
            platform: self.platform,
            metadata: ProcessResultMetadata::cached(),
        }
    }
}

pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    store: Store,
}

impl CommandRunner {
    #[must_use]
    pub fn new(inner: Arc<dyn crate::CommandRunner>, store: Store) -> Self {
        Self { inner, store }
    }

    async fn lookup(&self, action: Digest) -> Result<Option<CachedResult>, ProcessError> {
        let Some(record) = self.store.load_action_result(action).await? else {
            return Ok(None);
        };
        let decoded = self
            .store
            .load_file_bytes_with(record, |bytes| serde_json::from_slice::<CachedResult>(bytes))
            .await?;
        match decoded {
            Some(Ok(cached)) => Ok(Some(cached)),
            Some(Err(e)) => Err(ProcessError::MalformedCachedResult {
                digest: record,
                detail: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn record(
        &self,
        action: Digest,
        result: &FallibleProcessResultWithPlatform,
    ) -> Result<(), ProcessError> {
        let bytes = serde_json::to_vec(&CachedResult::from(result)).map_err(|e| {
            ProcessError::MalformedCachedResult {
                digest: action,
                detail: e.to_string(),
            }
        })?;
        let record = self.store.store_file_bytes(Bytes::from(bytes)).await?;
        // Everything a remote hit will need must be uploaded before the
        // entry that points at it.
        if self.store.has_remote() {
            self.store
                .ensure_remote_has_recursive(vec![result.output_directory])
                .await?;
            self.store
                .ensure_remote_has_files(vec![result.stdout_digest, result.stderr_digest, record])
                .await?;
        }
        self.store.record_action_result(action, record).await?;
        Ok(())
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let scope = process.cache_scope;
        if scope == ProcessCacheScope::Never {
            return self.inner.run(context, process).await;
        }

        let action = process.action_digest();
        let span = tracing::debug_span!("action_cache", %action, description = %process.description);
        match self.lookup(action).instrument(span.clone()).await {
            Ok(Some(cached)) => {
                tracing::debug!(parent: &span, "action cache hit");
                return Ok(cached.into_result());
            }
            Ok(None) => tracing::debug!(parent: &span, "action cache miss"),
            Err(e) => tracing::warn!(parent: &span, error = %e, "action cache lookup failed"),
        }

        let result = self.inner.run(context, process).await?;
        let cacheable = match scope {
            ProcessCacheScope::Always => true,
            ProcessCacheScope::Successful => result.exit_code == 0,
            ProcessCacheScope::Never => false,
        };
        if cacheable {
            if let Err(e) = self.record(action, &result).instrument(span.clone()).await {
                tracing::warn!(parent: &span, error = %e, "failed to write action cache entry");
            }
        }
        Ok(result)
    }
}
