use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nailgun::{Nail, NailgunError, Request, Server, Session, client_execute};

/// Echoes stdin to stdout, describes the request on stderr, and exits with
/// `$EXIT_CODE`.
struct EchoNail;

#[async_trait]
impl Nail for EchoNail {
    async fn run(&self, request: Request, session: &mut Session) -> Result<i32, NailgunError> {
        let input = session.read_all_stdin().await?;
        session.write_stdout(&input).await?;
        let summary = format!(
            "{} {} in {}",
            request.command,
            request.args.join(","),
            request.working_dir.display()
        );
        session.write_stderr(summary.as_bytes()).await?;
        Ok(request
            .env
            .get("EXIT_CODE")
            .and_then(|code| code.parse().ok())
            .unwrap_or(0))
    }
}

struct FailingNail;

#[async_trait]
impl Nail for FailingNail {
    async fn run(&self, _request: Request, _session: &mut Session) -> Result<i32, NailgunError> {
        Err(NailgunError::Protocol("nail exploded".to_owned()))
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn request(command: &str, args: &[&str], env: &[(&str, &str)]) -> Request {
    Request {
        command: command.to_owned(),
        args: args.iter().map(|s| (*s).to_owned()).collect(),
        env: env
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<BTreeMap<_, _>>(),
        working_dir: PathBuf::from("/work/dir"),
    }
}

#[tokio::test]
async fn round_trip_streams_and_exit_code() {
    let server = Server::bind(loopback(), Arc::new(EchoNail)).await.unwrap();

    let mut stdin: &[u8] = b"hello nail";
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = client_execute(
        server.local_addr(),
        &request("echo", &["a", "b"], &[("EXIT_CODE", "7")]),
        &mut stdin,
        &mut stdout,
        &mut stderr,
    )
    .await
    .unwrap();

    assert_eq!(code, 7);
    assert_eq!(stdout, b"hello nail");
    assert_eq!(String::from_utf8(stderr).unwrap(), "echo a,b in /work/dir");
    server.shutdown().await;
}

#[tokio::test]
async fn large_stdin_arrives_in_several_chunks() {
    let server = Server::bind(loopback(), Arc::new(EchoNail)).await.unwrap();

    let input: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let mut stdin = input.as_slice();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = client_execute(
        server.local_addr(),
        &request("echo", &[], &[]),
        &mut stdin,
        &mut stdout,
        &mut stderr,
    )
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(stdout, input);
    server.shutdown().await;
}

#[tokio::test]
async fn nail_errors_become_exit_code_one() {
    let server = Server::bind(loopback(), Arc::new(FailingNail)).await.unwrap();

    let mut stdin: &[u8] = b"";
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = client_execute(
        server.local_addr(),
        &request("boom", &[], &[]),
        &mut stdin,
        &mut stdout,
        &mut stderr,
    )
    .await
    .unwrap();

    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(String::from_utf8(stderr).unwrap().contains("nail exploded"));
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_are_served_independently() {
    let server = Server::bind(loopback(), Arc::new(EchoNail)).await.unwrap();
    let addr = server.local_addr();

    let clients = (0..8).map(|i| {
        tokio::spawn(async move {
            let payload = format!("client {i}");
            let mut stdin = payload.as_bytes();
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let code = client_execute(
                addr,
                &request("echo", &[], &[("EXIT_CODE", &i.to_string())]),
                &mut stdin,
                &mut stdout,
                &mut stderr,
            )
            .await
            .unwrap();
            (i, code, String::from_utf8(stdout).unwrap())
        })
    });

    for client in clients {
        let (i, code, stdout) = client.await.unwrap();
        assert_eq!(code, i);
        assert_eq!(stdout, format!("client {i}"));
    }
    server.shutdown().await;
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() {
    let server = Server::bind(loopback(), Arc::new(EchoNail)).await.unwrap();
    let addr = server.local_addr();
    server.shutdown().await;

    let mut stdin: &[u8] = b"";
    let err = client_execute(
        addr,
        &request("echo", &[], &[]),
        &mut stdin,
        &mut Vec::new(),
        &mut Vec::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, NailgunError::Connect { .. }));
}
