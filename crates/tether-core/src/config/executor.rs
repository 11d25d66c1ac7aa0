//! Executor and session configuration consumed by the agent

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Program to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cmd {
    /// Executable; a bare name is resolved through the session's `PATH`
    pub path: String,

    /// Full argument vector, `args[0]` included
    pub args: Vec<String>,
}

impl Cmd {
    pub fn new<I, S>(path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments after `argv[0]`
    pub fn argv_tail(&self) -> &[String] {
        self.args.get(1..).unwrap_or(&[])
    }
}

/// One process to run inside the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub id: String,

    pub name: String,

    pub cmd: Cmd,

    /// `KEY=VALUE` entries
    pub env: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// The session accepts attach channels
    pub attach: bool,

    /// Stdin is forwarded from attached channels
    pub open_stdin: bool,

    /// Defer starting the child until the controller sends `unblock`
    pub run_block: bool,

    /// Allocate a pseudo-terminal
    pub tty: bool,

    /// Relaunch the child when it exits
    pub restart: bool,

    /// Signal used to stop the session (default `TERM`)
    pub stop_signal: Option<String>,

    pub user: Option<String>,

    pub group: Option<String>,
}

impl SessionConfig {
    /// Value of `key` in the configured environment
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().rev().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn stop_signal(&self) -> &str {
        self.stop_signal.as_deref().unwrap_or("TERM")
    }
}

/// The sessions of one container plus its identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub id: String,

    pub name: String,

    pub sessions: BTreeMap<String, SessionConfig>,

    /// Path to a control-channel private key
    pub key: Option<PathBuf>,
}

impl ExecutorConfig {
    /// Check the configuration and fill session ids from their map keys
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (id, session) in self.sessions.iter_mut() {
            if id.is_empty() {
                return Err(ConfigError::Invalid("session with empty id".into()));
            }
            if session.id.is_empty() {
                session.id = id.clone();
            } else if session.id != *id {
                return Err(ConfigError::Invalid(format!(
                    "session key {} does not match id {}",
                    id, session.id
                )));
            }
            if session.cmd.path.is_empty() {
                return Err(ConfigError::MissingField(format!("sessions.{}.cmd.path", id)));
            }
            if let Some(bad) = session.env.iter().find(|kv| !kv.contains('=')) {
                return Err(ConfigError::Invalid(format!(
                    "session {} env entry {:?} is not KEY=VALUE",
                    id, bad
                )));
            }
        }
        Ok(())
    }
}
