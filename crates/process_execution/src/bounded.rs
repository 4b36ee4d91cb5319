//! Limits how many processes run at once.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::Instrument as _;

use crate::{Context, FallibleProcessResultWithPlatform, Process, ProcessError};

/// Wraps another runner and admits at most `concurrency` processes at a
/// time. Each admitted process holds a numbered slot in `1..=concurrency`,
/// exported through its `execution_slot_variable` when it sets one.
pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    semaphore: Arc<Semaphore>,
    free_slots: Arc<Mutex<BTreeSet<usize>>>,
}

/// Returns its slot to the pool when dropped.
struct Slot {
    id: usize,
    free_slots: Arc<Mutex<BTreeSet<usize>>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.free_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id);
    }
}

impl CommandRunner {
    /// A `concurrency` of zero is treated as one.
    #[must_use]
    pub fn new(inner: Arc<dyn crate::CommandRunner>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            free_slots: Arc::new(Mutex::new((1..=concurrency).collect())),
        }
    }

    /// Slots not currently held by a running process.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn take_slot(&self) -> Slot {
        let mut free = self
            .free_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A held permit guarantees a free slot.
        let id = free.pop_first().unwrap_or(0);
        Slot {
            id,
            free_slots: Arc::clone(&self.free_slots),
        }
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        mut process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let _permit = self
            .semaphore
            .acquire()
            .instrument(tracing::debug_span!("acquire_execution_slot"))
            .await
            .map_err(|_| ProcessError::SlotsClosed)?;
        let slot = self.take_slot();
        tracing::debug!(slot = slot.id, description = %process.description, "acquired execution slot");
        if let Some(variable) = &process.execution_slot_variable {
            process.env.insert(variable.clone(), slot.id.to_string());
        }
        let result = self.inner.run(context, process).await;
        drop(slot);
        result
    }
}
