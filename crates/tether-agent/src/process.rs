//! Process plugin
//!
//! Owns the session table and the lifecycle of every child: prepare its I/O,
//! hold it behind the run-block gate, spawn it through the reaper, and on
//! exit drain its output, then either relaunch it or close its channels.
//! The I/O side and the release gate are provided by other components
//! through the [`Terminal`] and [`Releaser`] traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::config::ExecutorConfig;
use tether_core::SessionError;

use crate::launch::Launch;
use crate::plugin::{Capabilities, Plugin};
use crate::reaper::Reaper;
use crate::session::Session;
use crate::signals;

/// Bound on draining a child's output after it exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before relaunching a restarting session
const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Exit status reported for a child that could not be spawned
pub const SPAWN_FAILURE_STATUS: u32 = 127;

/// Releases sessions held by the run-block gate
#[async_trait]
pub trait Releaser: Send + Sync {
    /// Send one token on `out` once `session` may start
    async fn release(&self, session: Arc<Session>, out: oneshot::Sender<()>);
}

/// Blocks until a release token arrives
#[async_trait]
pub trait Waiter: Send + Sync {
    /// `false` when the wait was abandoned
    async fn wait(&self, session: &Session, gate: oneshot::Receiver<()>) -> bool;
}

/// Session I/O: wires a child to its session and tears the wiring down
#[async_trait]
pub trait Terminal: Send + Sync {
    fn pseudo_terminal(&self, session: &Arc<Session>) -> Result<Launch, SessionError>;

    fn non_interact(&self, session: &Arc<Session>) -> Result<Launch, SessionError>;

    /// Final exit: deliver `status` to every channel bound to `session`
    async fn close(&self, session: &Arc<Session>, status: u32);
}

struct Inner {
    uuid: Uuid,
    sessions: DashMap<String, Arc<Session>>,
    /// session id -> pid of the live child
    running: DashMap<String, i32>,
    releaser: Arc<dyn Releaser>,
    terminal: Arc<dyn Terminal>,
    stopping: CancellationToken,
}

/// The process manager
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    pub fn new(releaser: Arc<dyn Releaser>, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            inner: Arc::new(Inner {
                uuid: Uuid::new_v4(),
                sessions: DashMap::new(),
                running: DashMap::new(),
                releaser,
                terminal,
                stopping: CancellationToken::new(),
            }),
        }
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|s| s.value().clone())
    }

    /// Every configured session, ordered by id
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner.running.contains_key(id)
    }

    pub fn pid_to_session(&self, pid: i32) -> Option<Arc<Session>> {
        let id = self
            .inner
            .running
            .iter()
            .find(|entry| *entry.value() == pid)
            .map(|entry| entry.key().clone())?;
        self.session(&id)
    }

    /// Deliver the session's stop signal to its child
    pub fn kill(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .session(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let name = session.config.stop_signal();
        let signal =
            signals::lookup(name).ok_or_else(|| SessionError::UnknownSignal(name.to_string()))?;
        session.signal(signal)
    }

    /// Launch one session's child, relaunching it while it is set to restart
    pub fn start_session(&self, session: Arc<Session>) -> JoinHandle<()> {
        let process = self.clone();
        tokio::spawn(async move { process.run_session(session).await })
    }

    async fn run_session(&self, session: Arc<Session>) {
        let mut gated = session.config.run_block;

        loop {
            let prepared = if session.config.tty {
                self.inner.terminal.pseudo_terminal(&session)
            } else {
                self.inner.terminal.non_interact(&session)
            };
            let launch = match prepared {
                Ok(launch) => launch,
                Err(e) => {
                    tracing::error!(session = %session.id, "Failed to prepare session: {}", e);
                    self.finish(&session, SPAWN_FAILURE_STATUS).await;
                    return;
                }
            };

            if gated {
                gated = false;
                tracing::info!(session = %session.id, "Holding session until released");
                let (tx, rx) = oneshot::channel();
                let releaser = self.inner.releaser.clone();
                let held = session.clone();
                tokio::spawn(async move { releaser.release(held, tx).await });
                if !self.wait(&session, rx).await {
                    tracing::info!(session = %session.id, "Release abandoned");
                    return;
                }
            }

            let spawned = Reaper::global()
                .track(|| launch.start(&session).map(|started| (started.pid, started)));
            let (started, exit) = match spawned {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::error!(session = %session.id, "Failed to start session: {}", e);
                    self.finish(&session, SPAWN_FAILURE_STATUS).await;
                    return;
                }
            };

            tracing::info!(session = %session.id, pid = started.pid, "Session started");
            self.inner.running.insert(session.id.clone(), started.pid);

            let status = match exit.await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(session = %session.id, "Lost track of child");
                    255
                }
            };

            if !self.stop_session(&session, started.done, status).await {
                return;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }

    /// Drain the exited child's output and record its status
    ///
    /// Returns `true` when the session should be relaunched.
    async fn stop_session(&self, session: &Arc<Session>, done: JoinHandle<()>, status: u32) -> bool {
        if tokio::time::timeout(DRAIN_TIMEOUT, done).await.is_err() {
            tracing::warn!(session = %session.id, "Output still open after child exit");
        }
        session.exited(status);
        self.inner.running.remove(&session.id);

        if session.config.restart && !self.inner.stopping.is_cancelled() {
            tracing::info!(
                session = %session.id,
                resurrections = session.resurrection_count() + 1,
                "Child exited with {}, restarting",
                status
            );
            return true;
        }

        self.finish(session, status).await;
        false
    }

    async fn finish(&self, session: &Arc<Session>, status: u32) {
        session.exited(status);
        self.inner.terminal.close(session, status).await;
    }
}

#[async_trait]
impl Waiter for Process {
    async fn wait(&self, session: &Session, gate: oneshot::Receiver<()>) -> bool {
        tokio::select! {
            released = gate => {
                if released.is_ok() {
                    tracing::info!(session = %session.id, "Session released");
                }
                released.is_ok()
            }
            _ = self.inner.stopping.cancelled() => false,
        }
    }
}

#[async_trait]
impl Plugin for Process {
    fn name(&self) -> &str {
        "process"
    }

    fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            configure: true,
            start: true,
            stop: true,
            reaper: true,
            ..Default::default()
        }
    }

    async fn configure(&self, config: &ExecutorConfig) -> anyhow::Result<()> {
        for (id, session) in &config.sessions {
            let mut session = session.clone();
            if session.id.is_empty() {
                session.id = id.clone();
            }
            tracing::debug!(session = %session.id, "Configured session");
            self.inner
                .sessions
                .insert(session.id.clone(), Session::new(session));
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        Reaper::global();
        for session in self.sessions() {
            self.start_session(session);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.stopping.cancel();
        tracing::info!(running = self.inner.running.len(), "Process manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::config::{Cmd, SessionConfig};
    use tokio::sync::watch;

    struct Gate {
        open: watch::Sender<bool>,
    }

    #[async_trait]
    impl Releaser for Gate {
        async fn release(&self, _session: Arc<Session>, out: oneshot::Sender<()>) {
            let mut open = self.open.subscribe();
            if open.wait_for(|open| *open).await.is_ok() {
                let _ = out.send(());
            }
        }
    }

    struct Pipes;

    #[async_trait]
    impl Terminal for Pipes {
        fn pseudo_terminal(&self, session: &Arc<Session>) -> Result<Launch, SessionError> {
            Launch::pty(&session.config)
        }

        fn non_interact(&self, session: &Arc<Session>) -> Result<Launch, SessionError> {
            Launch::pipes(&session.config)
        }

        async fn close(&self, session: &Arc<Session>, status: u32) {
            session.finish(status).await;
        }
    }

    fn executor(sessions: Vec<SessionConfig>) -> ExecutorConfig {
        let mut config = ExecutorConfig {
            id: "c1".into(),
            ..Default::default()
        };
        for session in sessions {
            config.sessions.insert(session.id.clone(), session);
        }
        config
    }

    fn session(id: &str, cmd: Cmd) -> SessionConfig {
        SessionConfig {
            id: id.into(),
            cmd,
            attach: true,
            ..Default::default()
        }
    }

    async fn process(config: &ExecutorConfig) -> (Process, Arc<Gate>) {
        let gate = Arc::new(Gate {
            open: watch::channel(false).0,
        });
        let process = Process::new(gate.clone(), Arc::new(Pipes));
        process.configure(config).await.unwrap();
        (process, gate)
    }

    async fn wait(session: &Session) -> u32 {
        tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let config = executor(vec![session("c1", Cmd::new("/bin/echo", ["echo", "hi"]))]);
        let (process, _) = process(&config).await;
        process.start().await.unwrap();

        let s = process.session("c1").unwrap();
        assert_eq!(wait(&s).await, 0);
        assert_eq!(&s.stdout.backlog().await[..], b"hi\n");
        assert!(!process.is_running("c1"));
        assert!(process.session("c1").is_some());
    }

    #[tokio::test]
    async fn test_exit_code_recorded() {
        let config = executor(vec![session(
            "c1",
            Cmd::new("/bin/sh", ["sh", "-c", "exit 3"]),
        )]);
        let (process, _) = process(&config).await;
        process.start().await.unwrap();
        assert_eq!(wait(&process.session("c1").unwrap()).await, 3);
    }

    #[tokio::test]
    async fn test_run_block_holds_child() {
        let mut cfg = session("c1", Cmd::new("/bin/echo", ["echo", "ready"]));
        cfg.run_block = true;
        let config = executor(vec![cfg]);
        let (process, gate) = process(&config).await;
        process.start().await.unwrap();

        let s = process.session("c1").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!s.started());

        gate.open.send_replace(true);
        assert_eq!(wait(&s).await, 0);
        assert_eq!(&s.stdout.backlog().await[..], b"ready\n");
    }

    #[tokio::test]
    async fn test_stop_abandons_gate() {
        let mut cfg = session("c1", Cmd::new("/bin/true", ["true"]));
        cfg.run_block = true;
        let config = executor(vec![cfg]);
        let (process, _) = process(&config).await;
        let handle = process.start_session(process.session("c1").unwrap());

        process.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!process.session("c1").unwrap().started());
    }

    #[tokio::test]
    async fn test_restart_relaunches() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let script = format!(
            "echo run >> {0}; [ $(wc -l < {0}) -ge 3 ] && exit 0; exit 1",
            marker.display()
        );
        let mut cfg = session("c1", Cmd::new("/bin/sh", ["sh", "-c", script.as_str()]));
        cfg.restart = true;
        let config = executor(vec![cfg]);
        let (process, _) = process(&config).await;
        process.start().await.unwrap();

        let s = process.session("c1").unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while s.resurrection_count() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        process.stop().await.unwrap();
        assert_eq!(wait(&s).await, 0);
        assert!(s.resurrection_count() >= 2);
    }

    #[tokio::test]
    async fn test_kill_uses_stop_signal() {
        let mut cfg = session("c1", Cmd::new("/bin/sleep", ["sleep", "30"]));
        cfg.stop_signal = Some("KILL".into());
        let config = executor(vec![cfg]);
        let (process, _) = process(&config).await;
        process.start().await.unwrap();

        let s = process.session("c1").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !process.is_running("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let pid = s.pid().unwrap();
        assert_eq!(process.pid_to_session(pid).unwrap().id, "c1");
        process.kill("c1").unwrap();
        assert_eq!(wait(&s).await, 137);
    }

    #[tokio::test]
    async fn test_spawn_failure_finishes_session() {
        let config = executor(vec![session(
            "c1",
            Cmd::new("/nonexistent/program", ["program"]),
        )]);
        let (process, _) = process(&config).await;
        process.start().await.unwrap();
        assert_eq!(
            wait(&process.session("c1").unwrap()).await,
            SPAWN_FAILURE_STATUS
        );
    }

    #[tokio::test]
    async fn test_kill_unknown_session() {
        let (process, _) = process(&executor(vec![])).await;
        assert!(matches!(process.kill("nope"), Err(SessionError::NotFound(_))));
    }
}
