//! End-to-end attach tests: a real agent dialing a real attach server

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use portlayer_attach::{AttachServer, SharedInteractor};
use tether_agent::Tether;
use tether_core::config::{AgentConfig, AttachConfig, BackoffConfig, Cmd, ExecutorConfig, SessionConfig};
use tether_core::ContainerId;
use tether_protocol::WindowSize;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    server: AttachServer,
    tether: Arc<Tether>,
    cancel: CancellationToken,
    agent: Option<tokio::task::JoinHandle<()>>,
}

impl Harness {
    async fn new(sessions: Vec<SessionConfig>) -> Self {
        let server = AttachServer::new(AttachConfig {
            port: 0,
            ..Default::default()
        });
        server.start(false).await.unwrap();
        let url = server.url().await.unwrap();

        let config = AgentConfig {
            controller_address: url.trim_start_matches("tcp://").to_string(),
            container_id_path: "/nonexistent/container-id".into(),
            backoff: BackoffConfig {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut executor = ExecutorConfig {
            id: "c1".into(),
            ..Default::default()
        };
        for session in sessions {
            executor.sessions.insert(session.id.clone(), session);
        }
        executor.validate().unwrap();

        let tether = Arc::new(Tether::new(config, executor));
        tether.start().await.unwrap();

        Self {
            server,
            tether,
            cancel: CancellationToken::new(),
            agent: None,
        }
    }

    fn connect_agent(&mut self) {
        let backchannel = self.tether.backchannel_with_key().unwrap();
        let cancel = self.cancel.clone();
        let (_forks, forks) = mpsc::channel(1);
        self.agent = Some(tokio::spawn(async move {
            backchannel.run(cancel, forks).await
        }));
    }

    async fn get(&self, id: &str) -> SharedInteractor {
        self.server
            .get(&CancellationToken::new(), &ContainerId::new(id), WAIT)
            .await
            .unwrap()
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(agent) = self.agent.take() {
            let _ = agent.await;
        }
        self.tether.stop().await;
        self.server.stop().await;
    }
}

fn session(id: &str, script: &str) -> SessionConfig {
    SessionConfig {
        id: id.into(),
        cmd: Cmd::new("/bin/sh", ["sh", "-c", script]),
        attach: true,
        ..Default::default()
    }
}

async fn read_all(interactor: &SharedInteractor) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, interactor.stdout().read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(out).unwrap()
}

async fn read_until(interactor: &SharedInteractor, needle: &str) -> String {
    let mut stdout = interactor.stdout();
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let n = stdout.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap();
    String::from_utf8_lossy(&seen).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_attach_echo() {
    let mut harness = Harness::new(vec![session("c1", "echo hi")]).await;
    harness.connect_agent();

    let interactor = harness.get("c1").await;
    assert_eq!(read_all(&interactor).await, "hi\n");
    assert_eq!(
        tokio::time::timeout(WAIT, interactor.exit_status()).await.unwrap().unwrap(),
        0
    );

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_block_holds_until_attached() {
    let mut blocked = session("c1", "echo ready");
    blocked.run_block = true;
    let mut harness = Harness::new(vec![blocked]).await;
    harness.connect_agent();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = harness.tether.process().session("c1").unwrap();
    assert!(session.pid().is_none());
    assert!(!session.is_finished());

    let interactor = harness.get("c1").await;
    assert_eq!(read_all(&interactor).await, "ready\n");
    assert_eq!(
        tokio::time::timeout(WAIT, interactor.exit_status()).await.unwrap().unwrap(),
        0
    );

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_interaction() {
    let mut blocked = session("c1", "echo ready");
    blocked.run_block = true;
    let mut harness = Harness::new(vec![blocked]).await;
    let connector = harness.server.connector().await.unwrap();

    let mut callers = Vec::new();
    for _ in 0..500 {
        let connector = connector.clone();
        callers.push(tokio::spawn(async move {
            connector
                .interaction_within(&CancellationToken::new(), &ContainerId::new("c1"), WAIT)
                .await
                .unwrap()
        }));
    }
    // Let every caller join the pending wait before the agent shows up
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.connect_agent();

    let mut interactors = Vec::new();
    for caller in callers {
        interactors.push(caller.await.unwrap());
    }
    let first = &interactors[0];
    assert!(interactors.iter().all(|i| Arc::ptr_eq(i, first)));
    assert_eq!(harness.tether.interaction().unblock_count(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pty_resize_reaches_child() {
    let mut tty = session("c1", "read line; stty size");
    tty.tty = true;
    tty.open_stdin = true;
    tty.run_block = true;
    let mut harness = Harness::new(vec![tty]).await;
    harness.connect_agent();

    let interactor = harness.get("c1").await;
    interactor.resize(WindowSize::new(80, 24)).await.unwrap();
    interactor.resize(WindowSize::new(132, 50)).await.unwrap();

    let mut stdin = interactor.stdin();
    stdin.write_all(b"\n").await.unwrap();
    stdin.flush().await.unwrap();

    assert!(read_until(&interactor, "50 132").await.contains("50 132"));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_window_size_on_tty() {
    let mut tty = session("c1", "read line; stty size");
    tty.tty = true;
    tty.open_stdin = true;
    tty.run_block = true;
    let mut harness = Harness::new(vec![tty]).await;
    harness.connect_agent();

    let interactor = harness.get("c1").await;
    interactor.resize(WindowSize::new(0, 0)).await.unwrap();
    interactor.resize(WindowSize::new(120, 0)).await.unwrap();

    let mut stdin = interactor.stdin();
    stdin.write_all(b"\n").await.unwrap();
    stdin.flush().await.unwrap();

    assert!(read_until(&interactor, "24 80").await.contains("24 80"));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stdin_written_right_after_attach() {
    let mut cat = session("c1", "cat");
    cat.open_stdin = true;
    cat.run_block = true;
    let mut harness = Harness::new(vec![cat]).await;
    harness.connect_agent();

    let interactor = harness.get("c1").await;
    let mut stdin = interactor.stdin();
    stdin.write_all(b"hello\n").await.unwrap();
    stdin.flush().await.unwrap();
    interactor.close_stdin().await.unwrap();

    assert_eq!(read_all(&interactor).await, "hello\n");
    assert_eq!(
        tokio::time::timeout(WAIT, interactor.exit_status()).await.unwrap().unwrap(),
        0
    );
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_stdin_before_launch() {
    let mut cat = session("c1", "cat");
    cat.open_stdin = true;
    cat.run_block = true;
    let mut harness = Harness::new(vec![cat]).await;
    harness.connect_agent();

    // Held by run_block, so the close has no child to reach yet
    let session = harness.tether.process().session("c1").unwrap();
    assert!(session.pid().is_none());
    session.close_stdin();

    let interactor = harness.get("c1").await;
    assert_eq!(read_all(&interactor).await, "");
    assert_eq!(
        tokio::time::timeout(WAIT, interactor.exit_status()).await.unwrap().unwrap(),
        0
    );
    harness.shutdown().await;
}
