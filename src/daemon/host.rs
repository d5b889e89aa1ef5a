use std::sync::Arc;

use anyhow::Result;
use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    messages::Response,
    port::{HostMessage, HostReply, MessagePort, MAX_OUTBOUND_FRAME},
};

use super::services::TrackerServices;

/// Reads host messages until the host goes away or the daemon shuts down. Every request is
/// answered, in arrival order.
pub struct HostSession {
    port: Box<dyn MessagePort>,
    services: Arc<TrackerServices>,
    shutdown: CancellationToken,
    reconnected: Arc<Notify>,
}

impl HostSession {
    pub fn new(
        port: Box<dyn MessagePort>,
        services: Arc<TrackerServices>,
        shutdown: CancellationToken,
        reconnected: Arc<Notify>,
    ) -> Self {
        Self {
            port,
            services,
            shutdown,
            reconnected,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let frame = select! {
                _ = self.shutdown.cancelled() => break,
                frame = self.port.recv() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Host closed the channel");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from host {e:?}");
                    self.shutdown.cancel();
                    return Err(e);
                }
            };
            match serde_json::from_slice::<HostMessage>(&frame) {
                Ok(message) => self.dispatch(message).await?,
                Err(e) => warn!("Ignoring malformed host message: {e}"),
            }
        }
        // Without a host there is nothing left to track.
        self.shutdown.cancel();
        Ok(())
    }

    async fn dispatch(&mut self, message: HostMessage) -> Result<()> {
        match message {
            HostMessage::Event { event } => {
                self.services.registry.observe(&event);
                self.services.monitor.handle(&event).await;
            }
            HostMessage::Request { id, request } => {
                let response = self.services.facade.handle(request).await;
                self.reply(HostReply { id, response }).await?;
            }
            HostMessage::Snapshot {
                windows,
                tabs,
                focused_window,
            } => {
                debug!("Received snapshot of {} tabs", tabs.len());
                self.services
                    .registry
                    .apply_snapshot(windows, tabs, focused_window);
                self.services.monitor.resume().await;
            }
            HostMessage::Connectivity { online } => {
                if let Some(sync) = &self.services.sync {
                    if sync.set_online(online) {
                        self.reconnected.notify_one();
                    }
                }
            }
        }
        Ok(())
    }

    async fn reply(&mut self, reply: HostReply) -> Result<()> {
        let mut frame = serde_json::to_vec(&reply)?;
        if frame.len() > MAX_OUTBOUND_FRAME {
            warn!("Reply {} is {} bytes, too large to send", reply.id, frame.len());
            frame = serde_json::to_vec(&HostReply {
                id: reply.id,
                response: Response::Error {
                    code: "TOO_LARGE".into(),
                    message: format!(
                        "reply exceeds {MAX_OUTBOUND_FRAME} bytes, request a shorter date span"
                    ),
                },
            })?;
        }
        self.port.send(&frame).await
    }
}
