//! Link health monitoring

use std::time::Duration;

use tether_protocol::MuxHandle;
use tokio::time::MissedTickBehavior;

/// Keeps an agent link honest with periodic keepalives
///
/// A keepalive that goes unanswered for `timeout` tears the link down, which
/// in turn evicts every interaction announced over it.
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    /// Keepalive interval
    pub interval: Duration,
    /// How long one keepalive may stay unanswered
    pub timeout: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Start monitoring `mux`; the task ends when the mux closes
    pub fn spawn_monitor(&self, mux: MuxHandle) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = mux.closed() => break,
                    _ = ticker.tick() => {}
                }

                match tokio::time::timeout(timeout, mux.keepalive()).await {
                    Ok(Ok(())) => tracing::trace!(mux = mux.id(), "Keepalive answered"),
                    Ok(Err(e)) => {
                        tracing::debug!(mux = mux.id(), "Keepalive failed: {}", e);
                        mux.close();
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(
                            mux = mux.id(),
                            "No keepalive reply within {:?}, dropping link",
                            timeout
                        );
                        mux.close();
                        break;
                    }
                }
            }
        })
    }
}
