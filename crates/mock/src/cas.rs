use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::Digest;
use store::{ActionCacheProvider, ByteStoreProvider};

use crate::{TestData, TestDirectory};

/// Counts concurrent requests; decrements when dropped.
struct InFlight<'a> {
    counters: &'a Counters,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Counters {
    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight { counters: self }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-memory remote CAS.
pub struct StubCAS {
    blobs: Mutex<HashMap<Digest, Bytes>>,
    latency: Option<Duration>,
    always_errors: bool,
    counters: Counters,
}

#[derive(Default)]
pub struct StubCASBuilder {
    blobs: HashMap<Digest, Bytes>,
    latency: Option<Duration>,
    always_errors: bool,
}

impl StubCASBuilder {
    #[must_use]
    pub fn file(mut self, data: &TestData) -> Self {
        self.blobs.insert(data.digest(), data.bytes());
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: &TestDirectory) -> Self {
        self.blobs.insert(directory.digest(), directory.bytes());
        self
    }

    /// Sleep this long inside every request.
    #[must_use]
    pub const fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every request.
    #[must_use]
    pub const fn always_errors(mut self) -> Self {
        self.always_errors = true;
        self
    }

    #[must_use]
    pub fn build(self) -> StubCAS {
        StubCAS {
            blobs: Mutex::new(self.blobs),
            latency: self.latency,
            always_errors: self.always_errors,
            counters: Counters::default(),
        }
    }
}

impl StubCAS {
    #[must_use]
    pub fn builder() -> StubCASBuilder {
        StubCASBuilder::default()
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn contains(&self, digest: Digest) -> bool {
        self.lock().contains_key(&digest)
    }

    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn read_request_count(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn write_request_count(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn list_request_count(&self) -> usize {
        self.counters.list_calls.load(Ordering::SeqCst)
    }

    /// The largest number of requests that were ever in progress at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Digest, Bytes>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate(&self) -> Result<(), String> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.always_errors {
            return Err("StubCAS is configured to always fail".to_owned());
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStoreProvider for StubCAS {
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let _guard = self.counters.enter();
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        if Digest::of_bytes(&bytes) != digest {
            return Err(format!("digest mismatch for upload of {digest}"));
        }
        self.lock().insert(digest, bytes);
        Ok(())
    }

    async fn load(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        let _guard = self.counters.enter();
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.lock().get(&digest).cloned())
    }

    async fn list_missing_digests(&self, digests: Vec<Digest>) -> Result<HashSet<Digest>, String> {
        let _guard = self.counters.enter();
        self.counters.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        let blobs = self.lock();
        Ok(digests
            .into_iter()
            .filter(|d| !blobs.contains_key(d))
            .collect())
    }
}

/// An in-memory remote action cache.
#[derive(Default)]
pub struct StubActionCache {
    results: Mutex<HashMap<Digest, Digest>>,
    always_errors: bool,
    counters: Counters,
}

impl StubActionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn always_errors() -> Self {
        Self {
            always_errors: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn get(&self, action: Digest) -> Option<Digest> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&action)
            .copied()
    }

    pub fn insert(&self, action: Digest, result: Digest) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action, result);
    }

    #[must_use]
    pub fn read_request_count(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn write_request_count(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionCacheProvider for StubActionCache {
    async fn get_action_result(&self, action: Digest) -> Result<Option<Digest>, String> {
        let _guard = self.counters.enter();
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if self.always_errors {
            return Err("StubActionCache is configured to always fail".to_owned());
        }
        Ok(self.get(action))
    }

    async fn update_action_result(&self, action: Digest, result: Digest) -> Result<(), String> {
        let _guard = self.counters.enter();
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if self.always_errors {
            return Err("StubActionCache is configured to always fail".to_owned());
        }
        self.insert(action, result);
        Ok(())
    }
}
