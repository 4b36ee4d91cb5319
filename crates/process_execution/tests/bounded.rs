use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hashing::EMPTY_DIGEST;
use process_execution::{
    CommandRunner, Context, FallibleProcessResultWithPlatform, Platform, Process, ProcessError,
    ProcessResultMetadata, bounded,
};

/// Sleeps, recording peak concurrency and the slot ids it was handed.
#[derive(Default)]
struct SlowRunner {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    slots_seen: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for SlowRunner {
    async fn run(
        &self,
        _context: Context,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(slot) = process.env.get("SLOT") {
            self.slots_seen.lock().unwrap().push(slot.clone());
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(FallibleProcessResultWithPlatform {
            stdout_digest: EMPTY_DIGEST,
            stderr_digest: EMPTY_DIGEST,
            exit_code: 0,
            output_directory: EMPTY_DIGEST,
            platform: Platform::current().unwrap(),
            metadata: ProcessResultMetadata::ran(Duration::from_millis(30)),
        })
    }
}

fn slotted_process() -> Process {
    let mut process = Process::new(vec!["/bin/true".to_owned()]);
    process.execution_slot_variable = Some("SLOT".to_owned());
    process
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_is_bounded() {
    let inner = Arc::new(SlowRunner::default());
    let runner = bounded::CommandRunner::new(inner.clone(), 2);

    let runs = (0..6).map(|_| runner.run(Context::default(), slotted_process()));
    for result in join_all(runs).await {
        assert_eq!(result.unwrap().exit_code, 0);
    }

    assert_eq!(inner.peak.load(Ordering::SeqCst), 2);
    assert_eq!(runner.available_slots(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slot_ids_are_one_based_and_bounded() {
    let inner = Arc::new(SlowRunner::default());
    let runner = bounded::CommandRunner::new(inner.clone(), 3);

    let runs = (0..9).map(|_| runner.run(Context::default(), slotted_process()));
    join_all(runs).await;

    let seen: BTreeSet<String> = inner.slots_seen.lock().unwrap().iter().cloned().collect();
    assert!(!seen.is_empty());
    assert!(seen.is_subset(&["1", "2", "3"].iter().map(|s| (*s).to_owned()).collect()));
}

#[tokio::test]
async fn zero_concurrency_still_runs() {
    let inner = Arc::new(SlowRunner::default());
    let runner = bounded::CommandRunner::new(inner.clone(), 0);
    let result = runner
        .run(Context::default(), slotted_process())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(inner.slots_seen.lock().unwrap().as_slice(), ["1"]);
}

#[tokio::test]
async fn processes_without_a_slot_variable_get_no_env() {
    let inner = Arc::new(SlowRunner::default());
    let runner = bounded::CommandRunner::new(inner.clone(), 1);
    runner
        .run(Context::default(), Process::new(vec!["/bin/true".to_owned()]))
        .await
        .unwrap();
    assert!(inner.slots_seen.lock().unwrap().is_empty());
}
