//! Agent dispatcher
//!
//! Answers the controller's requests on one mux: global `containers` and
//! `version` requests, and `attach` channel opens, which are handed to the
//! interaction plugin.

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use tether_protocol::msgs;
use tether_protocol::{GlobalRequest, MuxHandle, NewChannel, OpenFailureReason, PROTOCOL_VERSION};

use crate::interaction::Interaction;
use crate::process::Process;

#[derive(Clone)]
pub struct Dispatcher {
    process: Process,
    interaction: Interaction,
}

impl Dispatcher {
    pub fn new(process: Process, interaction: Interaction) -> Self {
        Self {
            process,
            interaction,
        }
    }

    /// Ids of the sessions that accept attach channels, sorted
    pub fn containers(&self) -> Vec<String> {
        self.process
            .sessions()
            .into_iter()
            .filter(|s| s.config.attach)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Serve `mux` until it closes
    pub async fn serve(
        &self,
        mux: MuxHandle,
        mut globals: UnboundedReceiver<GlobalRequest>,
        mut opens: UnboundedReceiver<NewChannel>,
    ) {
        tracing::info!(mux = mux.id(), "Dispatching controller requests");
        loop {
            tokio::select! {
                Some(req) = globals.recv() => self.answer_global(req),
                Some(open) = opens.recv() => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move { dispatcher.answer_open(open).await });
                }
                _ = mux.closed() => break,
                else => break,
            }
        }
        tracing::info!(mux = mux.id(), "Control connection closed");
    }

    fn answer_global(&self, req: GlobalRequest) {
        match req.name() {
            msgs::CONTAINERS_REQ => {
                let ids = self.containers();
                tracing::debug!("Reporting containers {:?}", ids);
                req.reply(true, msgs::encode_containers(&ids));
            }
            msgs::VERSION_REQ => req.reply(true, msgs::encode_u32(PROTOCOL_VERSION)),
            other => {
                tracing::debug!("Refusing global request {}", other);
                req.reply(false, Bytes::new());
            }
        }
    }

    async fn answer_open(&self, open: NewChannel) {
        if open.channel_type() != msgs::ATTACH_CHANNEL {
            tracing::warn!("Rejecting channel of type {}", open.channel_type());
            let message = format!("unknown channel type {}", open.channel_type());
            open.reject(OpenFailureReason::UnknownChannelType, &message);
            return;
        }

        let id = String::from_utf8_lossy(open.extra()).into_owned();
        let session = match self.process.session(&id) {
            Some(session) if session.config.attach => session,
            _ => {
                tracing::warn!(container_id = %id, "Rejecting attach to unknown session");
                open.reject(
                    OpenFailureReason::AdministrativelyProhibited,
                    &format!("session {} is invalid", id),
                );
                return;
            }
        };

        match open.accept() {
            Ok(channel) => {
                tracing::info!(container_id = %id, channel = %channel.id(), "Attached");
                self.interaction.attach(session, channel).await;
            }
            Err(e) => tracing::warn!(container_id = %id, "Failed to accept attach: {}", e),
        }
    }
}
