//! Child process launch
//!
//! A [`Launch`] is a prepared command, either over plain pipes or over a
//! pseudo-terminal. [`Launch::start`] spawns it and wires the child's
//! streams to the owning [`Session`]: output is read on dedicated threads
//! and pushed through the session's writers, stdin is drained from the
//! session's feed into the child.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use bytes::Bytes;
use nix::unistd::{Group, User};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::config::SessionConfig;
use tether_core::SessionError;
use tether_protocol::WindowSize;

use crate::session::{MultiWriter, Session};

/// Search path used when the session does not set `PATH`
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_HOME: &str = "/root";
const DEFAULT_TERM: &str = "xterm-256color";
const READ_CHUNK: usize = 8192;

enum Kind {
    Pipes(Command),
    Pty(CommandBuilder),
}

/// A prepared, not yet spawned, child
pub struct Launch {
    program: PathBuf,
    open_stdin: bool,
    kind: Kind,
}

/// A spawned child
pub struct Started {
    pub pid: i32,
    /// Resolves once every output stream of the child reached EOF
    pub done: JoinHandle<()>,
}

impl Launch {
    /// Prepare a child with piped stdout and stderr
    pub fn pipes(config: &SessionConfig) -> Result<Self, SessionError> {
        let env = environment(config);
        let program = resolve_program(&config.cmd.path, lookup(&env, "PATH"));

        let mut command = Command::new(&program);
        if let Some(arg0) = config.cmd.args.first() {
            command.arg0(arg0);
        }
        command
            .args(config.cmd.argv_tail())
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(if config.open_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let (uid, gid) = credentials(config)?;
        if let Some(gid) = gid {
            command.gid(gid);
        }
        if let Some(uid) = uid {
            command.uid(uid);
        }

        Ok(Self {
            program,
            open_stdin: config.open_stdin,
            kind: Kind::Pipes(command),
        })
    }

    /// Prepare a child on a pseudo-terminal
    ///
    /// The pty itself is allocated at start, sized to the session's last
    /// requested window (80x24 when none was requested).
    pub fn pty(config: &SessionConfig) -> Result<Self, SessionError> {
        let mut env = environment(config);
        if lookup(&env, "TERM").is_none() {
            env.push(("TERM".to_string(), DEFAULT_TERM.to_string()));
        }
        let program = resolve_program(&config.cmd.path, lookup(&env, "PATH"));

        if config.user.is_some() || config.group.is_some() {
            tracing::warn!(session = %config.id, "user and group are not applied to tty sessions");
        }

        let mut command = CommandBuilder::new(&program);
        command.args(config.cmd.argv_tail());
        command.env_clear();
        for (key, value) in &env {
            command.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            command.cwd(dir);
        }

        Ok(Self {
            program,
            open_stdin: config.open_stdin,
            kind: Kind::Pty(command),
        })
    }

    pub fn is_pty(&self) -> bool {
        matches!(self.kind, Kind::Pty(_))
    }

    /// Spawn the child and wire its streams to `session`
    ///
    /// Must run inside a tokio runtime.
    pub fn start(self, session: &Arc<Session>) -> Result<Started, SessionError> {
        let label = self.program.display().to_string();
        let spawn_err = |e: &dyn std::fmt::Display| SessionError::Spawn(format!("{}: {}", label, e));

        match self.kind {
            Kind::Pipes(mut command) => {
                let mut child = command.spawn().map_err(|e| spawn_err(&e))?;
                let pid = child.id() as i32;

                let stdin = child
                    .stdin
                    .take()
                    .map(|s| Box::new(s) as Box<dyn Write + Send>);
                let mut outputs = Vec::with_capacity(2);
                if let Some(stdout) = child.stdout.take() {
                    outputs.push(pump(session.clone(), Box::new(stdout), false));
                }
                if let Some(stderr) = child.stderr.take() {
                    outputs.push(pump(session.clone(), Box::new(stderr), true));
                }

                session.launched(pid, stdin.map(feed), None);
                Ok(Started {
                    pid,
                    done: join(outputs),
                })
            }
            Kind::Pty(command) => {
                let size = session.window().unwrap_or_else(|| WindowSize::new(80, 24));
                let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
                let pair = native_pty_system()
                    .openpty(PtySize {
                        rows: clamp(size.rows),
                        cols: clamp(size.cols),
                        pixel_width: clamp(size.width_px),
                        pixel_height: clamp(size.height_px),
                    })
                    .map_err(|e| SessionError::Pty(format!("Failed to open PTY: {}", e)))?;

                let PtyPair { master, slave } = pair;
                let child = slave.spawn_command(command).map_err(|e| spawn_err(&e))?;
                let pid = child
                    .process_id()
                    .ok_or_else(|| spawn_err(&"child has no pid"))? as i32;
                // The master only sees EOF once every slave handle is closed
                drop(slave);

                let reader = master
                    .try_clone_reader()
                    .map_err(|e| SessionError::Pty(e.to_string()))?;
                let stdin = if self.open_stdin {
                    Some(
                        master
                            .take_writer()
                            .map_err(|e| SessionError::Pty(e.to_string()))?,
                    )
                } else {
                    None
                };

                let output = pump(session.clone(), reader, false);
                session.launched(pid, stdin.map(feed), Some(master));

                Ok(Started {
                    pid,
                    done: join(vec![output]),
                })
            }
        }
    }
}

/// Copy one child output stream into the session
fn pump(session: Arc<Session>, mut reader: Box<dyn Read + Send>, stderr: bool) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(16);
    let id = session.id.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("{}-{}", id, if stderr { "err" } else { "out" }))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    // A pty master reports EIO once the slave side is gone
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!(session = %id, "Failed to start output reader: {}", e);
    }

    tokio::spawn(async move {
        let writer: &MultiWriter = if stderr {
            &session.stderr
        } else {
            &session.stdout
        };
        while let Some(chunk) = rx.recv().await {
            writer.write(&chunk).await;
        }
    })
}

/// Drain queued stdin into the child; dropping the sender closes its stdin
fn feed(mut sink: Box<dyn Write + Send>) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                if sink.write_all(&data).and_then(|_| sink.flush()).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start stdin writer: {}", e);
    }
    tx
}

fn join(handles: Vec<JoinHandle<()>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
    })
}

/// The session's environment as pairs, with `HOME` defaulted
fn environment(config: &SessionConfig) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((k, v)) if !k.is_empty() => Some((k.to_string(), v.to_string())),
            _ => {
                tracing::warn!(session = %config.id, "Ignoring malformed env entry {:?}", entry);
                None
            }
        })
        .collect();
    if lookup(&env, "HOME").is_none() {
        env.push(("HOME".to_string(), DEFAULT_HOME.to_string()));
    }
    env
}

fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Resolve a bare program name through `path`
pub fn resolve_program(program: &str, path: Option<&str>) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    path.unwrap_or(DEFAULT_PATH)
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// uid and gid for the child; a named user without a group gets its primary group
fn credentials(config: &SessionConfig) -> Result<(Option<u32>, Option<u32>), SessionError> {
    let (uid, primary_gid) = match config.user.as_deref() {
        Some(user) => {
            let (uid, gid) = resolve_user(user)?;
            (Some(uid), gid)
        }
        None => (None, None),
    };
    let gid = match config.group.as_deref() {
        Some(group) => Some(resolve_group(group)?),
        None => primary_gid,
    };
    Ok((uid, gid))
}

fn resolve_user(name: &str) -> Result<(u32, Option<u32>), SessionError> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok((uid, None));
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid.as_raw(), Some(user.gid.as_raw()))),
        Ok(None) => Err(SessionError::UnknownUser(name.to_string())),
        Err(e) => Err(SessionError::UnknownUser(format!("{}: {}", name, e))),
    }
}

fn resolve_group(name: &str) -> Result<u32, SessionError> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(SessionError::UnknownUser(name.to_string())),
        Err(e) => Err(SessionError::UnknownUser(format!("{}: {}", name, e))),
    }
}

impl std::fmt::Debug for Launch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launch")
            .field("program", &self.program)
            .field("pty", &self.is_pty())
            .finish()
    }
}
