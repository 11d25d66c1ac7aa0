//! Plugin lifecycle
//!
//! The agent is assembled from plugins that declare which lifecycle stages
//! they take part in. The [`Registrar`] drives them: configure and start in
//! registration order, stop in reverse.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use tether_core::config::ExecutorConfig;

/// Lifecycle stages a plugin takes part in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub configure: bool,
    pub start: bool,
    pub stop: bool,
    pub signaler: bool,
    pub reaper: bool,
    pub collector: bool,
    pub reporter: bool,
}

impl Capabilities {
    /// Names of the stages this record claims
    pub fn roles(&self) -> Vec<&'static str> {
        [
            (self.configure, "configure"),
            (self.start, "start"),
            (self.stop, "stop"),
            (self.signaler, "signaler"),
            (self.reaper, "reaper"),
            (self.collector, "collector"),
            (self.reporter, "reporter"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn uuid(&self) -> Uuid;

    fn capabilities(&self) -> Capabilities;

    async fn configure(&self, _config: &ExecutorConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of plugins
#[derive(Default)]
pub struct Registrar {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        tracing::debug!(
            plugin = plugin.name(),
            uuid = %plugin.uuid(),
            roles = ?plugin.capabilities().roles(),
            "Registered plugin"
        );
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn configure_all(&self, config: &ExecutorConfig) -> anyhow::Result<()> {
        for plugin in self.plugins.iter().filter(|p| p.capabilities().configure) {
            tracing::debug!(plugin = plugin.name(), "Configuring");
            plugin.configure(config).await?;
        }
        Ok(())
    }

    /// Plugins claiming the stage picked by `stage`, in registration order
    pub fn with(&self, stage: fn(&Capabilities) -> bool) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .filter(|p| stage(&p.capabilities()))
            .cloned()
            .collect()
    }

    /// Start every plugin in order
    ///
    /// Child reaping is process-wide, so at most one plugin may claim it.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        let reapers = self.with(|c| c.reaper);
        if reapers.len() > 1 {
            let names: Vec<_> = reapers.iter().map(|p| p.name().to_string()).collect();
            anyhow::bail!("More than one reaper plugin: {}", names.join(", "));
        }
        for plugin in self.plugins.iter().filter(|p| p.capabilities().start) {
            tracing::debug!(plugin = plugin.name(), "Starting");
            plugin.start().await?;
        }
        Ok(())
    }

    /// Stop every plugin in reverse order; failures are logged, not fatal
    pub async fn stop_all(&self) {
        for plugin in self.plugins.iter().rev().filter(|p| p.capabilities().stop) {
            tracing::debug!(plugin = plugin.name(), "Stopping");
            if let Err(e) = plugin.stop().await {
                tracing::warn!(plugin = plugin.name(), "Stop failed: {}", e);
            }
        }
    }
}
