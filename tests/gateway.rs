//! End-to-end tests: a real server on a loopback port, a fake transcoder
//! script standing in for avconv, and reqwest as the client.

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::timeout;

use mpegts_proxy::router::{self, AppState};
use mpegts_proxy::sources::{SourceDescriptor, SourceRegistry};
use mpegts_proxy::worker::{ExitPolicy, WorkerCommand};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    dir: TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// One pid per worker spawned so far.
    fn pids(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("pids"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn descriptor() -> SourceDescriptor {
    SourceDescriptor {
        route: "/tv".to_string(),
        upstream: "rtsp://camera.local/live".to_string(),
        provider: "Acme".to_string(),
        name: "Channel One".to_string(),
    }
}

fn write_fake_avconv(dir: &Path, tail: &str) -> PathBuf {
    let script = dir.join("avconv");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho $$ >> '{0}/pids'\nprintf '%s\\n' \"$@\" > '{0}/args'\n{1}\n",
            dir.display(),
            tail
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

async fn start_server(worker_tail: &str) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let avconv = write_fake_avconv(dir.path(), worker_tail);

    let registry = SourceRegistry::from_descriptors(vec![descriptor()]).unwrap();
    let state = Arc::new(AppState::new(
        registry,
        avconv.display().to_string(),
        ExitPolicy::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        router::serve(listener, state, async move {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    TestServer {
        addr,
        dir,
        _shutdown: tx,
    }
}

async fn read_until(response: &mut reqwest::Response, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    while !received.windows(needle.len()).any(|w| w == needle) {
        let chunk = timeout(WAIT, response.chunk())
            .await
            .expect("timed out waiting for stream data")
            .unwrap()
            .expect("stream ended early");
        received.extend_from_slice(&chunk);
    }
    received
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn wait_for_exit(pid: &str) {
    timeout(WAIT, async {
        while process_alive(pid) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("worker {} was not killed", pid));
}

#[tokio::test]
async fn registered_route_streams_mpegts() {
    let server = start_server("printf TSDATA\nwhile true; do sleep 0.1; printf .; done").await;

    let mut response = reqwest::get(server.url("/tv")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "video/mp2t");
    assert_eq!(response.headers()["transfer-encoding"], "chunked");
    assert!(response.headers().get("content-length").is_none());

    let received = read_until(&mut response, b"TSDATA").await;
    assert!(received.starts_with(b"TSDATA"));

    assert_eq!(server.pids().len(), 1);
    let args = fs::read_to_string(server.dir.path().join("args")).unwrap();
    let expected = WorkerCommand::for_source("avconv", &descriptor()).args;
    assert_eq!(args.lines().collect::<Vec<_>>(), expected);

    // Client disconnect kills the worker without a replacement.
    let pid = server.pids()[0].clone();
    drop(response);
    wait_for_exit(&pid).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.pids().len(), 1);
}

#[tokio::test]
async fn unknown_route_is_404_without_worker() {
    let server = start_server("exec sleep 30").await;

    for path in ["/radio", "/tv/", "/tv?quality=hd"] {
        let response = reqwest::get(server.url(path)).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.text().await.unwrap(), "404 Not Found\n");
    }

    assert!(server.pids().is_empty());
}

#[tokio::test]
async fn transient_exit_continues_same_response() {
    // First worker emits "A" and fails transiently, the second keeps going.
    let server = start_server(concat!(
        "if [ $(wc -l < \"$(dirname \"$0\")/pids\") -lt 2 ]; then printf A; exit 255; fi\n",
        "printf B\n",
        "while true; do sleep 0.1; printf .; done",
    ))
    .await;

    let mut response = reqwest::get(server.url("/tv")).await.unwrap();
    assert_eq!(response.status(), 200);

    let received = read_until(&mut response, b"B").await;
    assert!(received.starts_with(b"AB"));
    assert_eq!(server.pids().len(), 2);

    let pid = server.pids()[1].clone();
    drop(response);
    wait_for_exit(&pid).await;
}

#[tokio::test]
async fn fatal_exit_ends_response() {
    let server = start_server("printf partial\nexit 1").await;

    let response = reqwest::get(server.url("/tv")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body = timeout(WAIT, response.bytes()).await.unwrap().unwrap();
    assert_eq!(&body[..], b"partial");
    assert_eq!(server.pids().len(), 1);
}

#[tokio::test]
async fn concurrent_clients_get_independent_workers() {
    let server = start_server("while true; do printf tick; sleep 0.05; done").await;

    let mut first = reqwest::get(server.url("/tv")).await.unwrap();
    read_until(&mut first, b"tick").await;
    let mut second = reqwest::get(server.url("/tv")).await.unwrap();
    read_until(&mut second, b"tick").await;

    let pids = server.pids();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[0], pids[1]);

    drop(first);
    wait_for_exit(&pids[0]).await;

    assert!(process_alive(&pids[1]));
    read_until(&mut second, b"ticktick").await;

    drop(second);
    wait_for_exit(&pids[1]).await;
    assert_eq!(server.pids().len(), 2);
}
