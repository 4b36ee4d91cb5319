#![cfg(unix)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use nailgun::{Request, Server, client_execute};
use native_engine::nail::{COMMAND_NOT_FOUND, SubprocessNail};

async fn execute(server: &Server, request: &Request, stdin: &[u8]) -> (i32, String, String) {
    let mut stdin = stdin;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = client_execute(
        server.local_addr(),
        request,
        &mut stdin,
        &mut stdout,
        &mut stderr,
    )
    .await
    .unwrap();
    (
        code,
        String::from_utf8(stdout).unwrap(),
        String::from_utf8(stderr).unwrap(),
    )
}

async fn start() -> Server {
    Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::new(SubprocessNail))
        .await
        .unwrap()
}

fn sh(script: &str, env: &[(&str, &str)], working_dir: PathBuf) -> Request {
    Request {
        command: "/bin/sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        env: env
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<BTreeMap<_, _>>(),
        working_dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subprocess_sees_stdin_env_and_cwd() {
    let server = start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

    let request = sh(
        "/bin/cat; /bin/cat marker.txt; echo \" $GREETING\" >&2; exit 3",
        &[("GREETING", "hi")],
        dir.path().to_owned(),
    );
    let (code, stdout, stderr) = execute(&server, &request, b"piped ").await;

    assert_eq!(code, 3);
    assert_eq!(stdout, "piped here");
    assert_eq!(stderr, " hi\n");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_output_is_streamed_back() {
    let server = start().await;
    let request = sh(
        "i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done",
        &[],
        PathBuf::new(),
    );
    let (code, stdout, stderr) = execute(&server, &request, b"").await;

    assert_eq!(code, 0);
    assert!(stderr.is_empty());
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2000);
    assert_eq!(lines[1999], "line-1999");
    server.shutdown().await;
}

#[tokio::test]
async fn missing_command_exits_127() {
    let server = start().await;
    let request = Request {
        command: "/nonexistent/tool".to_owned(),
        ..Request::default()
    };
    let (code, stdout, stderr) = execute(&server, &request, b"").await;

    assert_eq!(code, COMMAND_NOT_FOUND);
    assert!(stdout.is_empty());
    assert!(stderr.contains("failed to execute /nonexistent/tool"), "{stderr}");
    server.shutdown().await;
}

#[tokio::test]
async fn killed_subprocess_reports_negative_signal() {
    let server = start().await;
    let request = sh("kill -TERM $$", &[], PathBuf::new());
    let (code, _, _) = execute(&server, &request, b"").await;
    assert_eq!(code, -15);
    server.shutdown().await;
}
