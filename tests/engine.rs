#![cfg(unix)]

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use fs::RelativePath;
use mock::{StubActionCache, StubCAS, TestData};
use native_engine::config::{EngineConfig, LocalConfig, RemoteConfig, StoreConfig};
use native_engine::entry_point::EntryPoint;
use native_engine::{Engine, EngineError, Remotes};
use process_execution::local::KeepSandboxes;
use process_execution::{Context, Process, ProcessResultSource};
use task_executor::Executor;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    engine: Engine,
}

impl Harness {
    fn new(remotes: Remotes, configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig {
            store: StoreConfig {
                path: dir.path().join("store"),
            },
            remote: RemoteConfig::default(),
            local: LocalConfig {
                parallelism: 2,
                keep_sandboxes: KeepSandboxes::Never,
                work_dir: dir.path().join("sandboxes"),
                named_caches_dir: dir.path().join("named_caches"),
                execution_slot_variable: None,
            },
        };
        std::fs::create_dir_all(&config.local.work_dir).unwrap();
        configure(&mut config);
        let engine = Engine::with_remotes(Executor::from_current(), config, remotes).unwrap();
        Self { dir, engine }
    }

    fn local() -> Self {
        Self::new(Remotes::default(), |_| {})
    }

    async fn stdout(&self, digest: hashing::Digest) -> String {
        let bytes = self.engine.load_bytes(digest).await.unwrap().unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

fn sh(script: &str) -> Process {
    Process::new(vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()])
}

fn paths(paths: &[&str]) -> BTreeSet<RelativePath> {
    paths.iter().map(|p| RelativePath::new(p).unwrap()).collect()
}

#[tokio::test]
async fn bytes_round_trip_through_the_store() {
    let harness = Harness::local();
    let digest = harness
        .engine
        .store_bytes(TestData::catnip().bytes())
        .await
        .unwrap();
    assert_eq!(digest, TestData::catnip().digest());
    assert_eq!(
        harness.engine.load_bytes(digest).await.unwrap(),
        Some(TestData::catnip().bytes())
    );
    assert_eq!(
        harness
            .engine
            .load_bytes(TestData::robin().digest())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn repeated_runs_hit_the_action_cache() {
    let harness = Harness::local();
    let process = || sh("echo -n hello").description("greet");

    let first = harness
        .engine
        .run_process(Context::default(), process())
        .await
        .unwrap();
    assert_eq!(first.exit_code, 0);
    assert_eq!(first.metadata.source, ProcessResultSource::Ran);
    assert_eq!(harness.stdout(first.stdout_digest).await, "hello");

    let second = harness
        .engine
        .run_process(Context::default(), process())
        .await
        .unwrap();
    assert_eq!(second.metadata.source, ProcessResultSource::Cached);
    assert_eq!(second.stdout_digest, first.stdout_digest);
}

#[tokio::test]
async fn captured_inputs_run_and_outputs_materialize() {
    let harness = Harness::local();
    let src = harness.dir.path().join("src");
    std::fs::create_dir_all(src.join("pkg")).unwrap();
    std::fs::write(src.join("pkg/a.txt"), "alpha\n").unwrap();
    std::fs::write(src.join("pkg/b.txt"), "beta\n").unwrap();
    std::fs::write(src.join("ignored.md"), "nope\n").unwrap();

    let inputs = harness
        .engine
        .capture(src, vec!["pkg/*.txt".to_owned()])
        .await
        .unwrap();
    let process = sh("/bin/mkdir out && /bin/cat pkg/a.txt pkg/b.txt > out/joined.txt && /bin/ls")
        .input_files(inputs)
        .output_directories(paths(&["out"]));
    let result = harness
        .engine
        .run_process(Context::default(), process)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(harness.stdout(result.stdout_digest).await, "out\npkg\n");

    let dest = harness.dir.path().join("dest");
    harness
        .engine
        .materialize(dest.clone(), result.output_directory)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(dest.join("out/joined.txt")).unwrap(),
        "alpha\nbeta\n"
    );
}

#[tokio::test]
async fn configured_slot_variable_reaches_the_process() {
    let harness = Harness::new(Remotes::default(), |config| {
        config.local.execution_slot_variable = Some("SLOT".to_owned());
        config.local.parallelism = 1;
    });
    let result = harness
        .engine
        .run_process(Context::default(), sh("echo -n $SLOT"))
        .await
        .unwrap();
    assert_eq!(harness.stdout(result.stdout_digest).await, "1");
}

#[tokio::test]
async fn unrunnable_process_is_an_error() {
    let harness = Harness::local();
    let err = harness
        .engine
        .run_process(Context::default(), Process::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Process(_)), "{err:?}");
}

#[tokio::test]
async fn remote_results_are_shared_between_engines() {
    let cas = Arc::new(StubCAS::empty());
    let action_cache = Arc::new(StubActionCache::new());
    let remotes = || Remotes {
        store: Some(cas.clone()),
        action_cache: Some(action_cache.clone()),
    };
    let process = || sh("echo -n shared");

    let producer = Harness::new(remotes(), |_| {});
    let produced = producer
        .engine
        .run_process(Context::default(), process())
        .await
        .unwrap();
    assert_eq!(produced.metadata.source, ProcessResultSource::Ran);
    assert_eq!(action_cache.write_request_count(), 1);

    let consumer = Harness::new(remotes(), |_| {});
    let consumed = consumer
        .engine
        .run_process(Context::default(), process())
        .await
        .unwrap();
    assert_eq!(consumed.metadata.source, ProcessResultSource::Cached);
    assert_eq!(consumer.stdout(consumed.stdout_digest).await, "shared");
}

#[tokio::test]
async fn action_cache_without_store_is_ignored() {
    let action_cache = Arc::new(StubActionCache::new());
    let harness = Harness::new(
        Remotes {
            store: None,
            action_cache: Some(action_cache.clone()),
        },
        |_| {},
    );
    assert!(!harness.engine.store().has_remote());
    harness
        .engine
        .run_process(Context::default(), sh("true"))
        .await
        .unwrap();
    assert_eq!(action_cache.read_request_count(), 0);
    assert_eq!(action_cache.write_request_count(), 0);
}

#[tokio::test]
async fn entry_point_file_is_resolved_on_disk() {
    let harness = Harness::local();
    let root = harness.dir.path().join("repo");
    std::fs::create_dir_all(root.join("src/python/project")).unwrap();
    std::fs::write(root.join("src/python/project/app.py"), "").unwrap();

    let resolved = harness
        .engine
        .resolve_entry_point(
            "app.py:main",
            RelativePath::new("src/python/project").unwrap(),
            &root,
            vec![RelativePath::new("src/python").unwrap()],
        )
        .await
        .unwrap();
    assert!(resolved.file_name_used);
    assert_eq!(
        resolved.entry_point,
        Some(EntryPoint::parse("project.app:main", None).unwrap())
    );

    let err = harness
        .engine
        .resolve_entry_point(
            "app.py:",
            RelativePath::new("src/python/project").unwrap(),
            &root,
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("provided by src/python/project"), "{err}");
}

#[test]
fn bytes_survive_an_owned_runtime() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        store: StoreConfig {
            path: dir.path().join("store"),
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let digest = engine
        .executor()
        .block_on(engine.store_bytes(Bytes::from_static(b"owned")))
        .unwrap();
    let loaded = engine.executor().block_on(engine.load_bytes(digest)).unwrap();
    assert_eq!(loaded.as_deref(), Some(&b"owned"[..]));
}
