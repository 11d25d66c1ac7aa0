//! Agent state
//!
//! Wires the plugins together around one executor configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use russh_keys::key::KeyPair;

use tether_core::config::{self, AgentConfig, ExecutorConfig};
use tether_core::ContainerId;

use crate::backchannel::{self, Backchannel};
use crate::dispatcher::Dispatcher;
use crate::interaction::Interaction;
use crate::plugin::Registrar;
use crate::process::Process;
use crate::session::Session;

/// Everything one agent instance runs
pub struct Tether {
    pub config: AgentConfig,
    pub executor: ExecutorConfig,
    process: Process,
    interaction: Interaction,
    registrar: Registrar,
}

impl Tether {
    pub fn new(config: AgentConfig, executor: ExecutorConfig) -> Self {
        let interaction = Interaction::new();
        let process = Process::new(Arc::new(interaction.clone()), Arc::new(interaction.clone()));

        let mut registrar = Registrar::new();
        registrar.register(Arc::new(process.clone()));
        registrar.register(Arc::new(interaction.clone()));

        Self {
            config,
            executor,
            process,
            interaction,
            registrar,
        }
    }

    /// Load and validate the executor configuration named by `config`
    pub fn load(config: AgentConfig) -> anyhow::Result<Self> {
        let mut executor: ExecutorConfig = config::load_config(&config.executor_config_path)
            .with_context(|| {
                format!(
                    "Failed to load executor config from {:?}",
                    config.executor_config_path
                )
            })?;
        executor.validate()?;
        Ok(Self::new(config, executor))
    }

    /// Identity this agent reports: the id file, then the executor id, then the host name
    pub fn container_id(&self) -> ContainerId {
        match ContainerId::from_file(&self.config.container_id_path) {
            Ok(Some(id)) => return id,
            Ok(None) => {}
            Err(e) => tracing::debug!(
                "No container id at {:?}: {}",
                self.config.container_id_path,
                e
            ),
        }
        if !self.executor.id.is_empty() {
            return ContainerId::new(self.executor.id.clone());
        }
        ContainerId::from_hostname()
    }

    /// The session named after this container, once configured
    pub fn primary(&self) -> Option<Arc<Session>> {
        self.process.session(self.container_id().as_str())
    }

    /// Final exit status of the primary session
    ///
    /// Never resolves when no session carries the container's identity.
    pub async fn primary_exit(&self) -> u32 {
        match self.primary() {
            Some(session) => session.wait().await,
            None => std::future::pending().await,
        }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.process.clone(), self.interaction.clone())
    }

    /// Control-channel key path: command line or agent config first, then the executor's
    pub fn key_path(&self) -> Option<PathBuf> {
        self.config
            .key_path
            .clone()
            .or_else(|| self.executor.key.clone())
    }

    pub fn backchannel(&self, key: KeyPair) -> Backchannel {
        Backchannel::new(self.config.clone(), self.dispatcher(), key)
    }

    /// Backchannel with the configured host key, or an ephemeral one
    pub fn backchannel_with_key(&self) -> anyhow::Result<Backchannel> {
        let key = backchannel::load_host_key(self.key_path().as_deref())?;
        Ok(self.backchannel(key))
    }

    /// Configure and start every plugin
    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(
            container_id = %self.container_id(),
            sessions = self.executor.sessions.len(),
            "Starting tether"
        );
        self.registrar.configure_all(&self.executor).await?;
        self.registrar.start_all().await
    }

    pub async fn stop(&self) {
        self.registrar.stop_all().await;
    }
}
