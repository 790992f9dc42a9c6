//! Event Bus (C1) — typed in-process pub/sub with five channels:
//! `ingress.raw`, `data.parsed`, `data.normalized`, `command.request`,
//! and `error`.
//!
//! Each channel is a [`tokio::sync::broadcast`] channel. Broadcast gives
//! every subscriber its own receiver, so a slow or failing subscriber
//! cannot block or starve another — exactly the "at-least-once,
//! fire-and-forget, no retained/replayed messages" contract the spec
//! asks for. A subscriber that falls behind sees `RecvError::Lagged`
//! rather than blocking the publisher; that is the accepted best-effort
//! boundary, not a bug to paper over.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::types::{CanonicalEvent, CommandRequest, IntermediateForm};

/// Raw bytes received from the transport, before parser dispatch.
#[derive(Debug, Clone)]
pub struct IngressRaw {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// An error tagged with the component that raised it, the payload of
/// the `error` channel.
#[derive(Debug, Clone, Serialize)]
pub struct BusError {
    pub source_component: &'static str,
    pub error: String,
}

impl BusError {
    pub fn new(source_component: &'static str, error: impl std::fmt::Display) -> Self {
        Self {
            source_component,
            error: error.to_string(),
        }
    }
}

const CHANNEL_CAPACITY: usize = 4096;

/// The five named channels, each a broadcast sender. Cloning an
/// `EventBus` clones the senders (cheap, `Arc`-backed internally) — every
/// component gets its own handle from the composition root rather than
/// reaching for a global.
#[derive(Clone)]
pub struct EventBus {
    ingress_raw: broadcast::Sender<IngressRaw>,
    data_parsed: broadcast::Sender<IntermediateForm>,
    data_normalized: broadcast::Sender<CanonicalEvent>,
    command_request: broadcast::Sender<CommandRequest>,
    error: broadcast::Sender<BusError>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            ingress_raw: broadcast::channel(CHANNEL_CAPACITY).0,
            data_parsed: broadcast::channel(CHANNEL_CAPACITY).0,
            data_normalized: broadcast::channel(CHANNEL_CAPACITY).0,
            command_request: broadcast::channel(CHANNEL_CAPACITY).0,
            error: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_ingress_raw(&self, msg: IngressRaw) {
        let _ = self.ingress_raw.send(msg);
    }

    pub fn subscribe_ingress_raw(&self) -> broadcast::Receiver<IngressRaw> {
        self.ingress_raw.subscribe()
    }

    pub fn publish_parsed(&self, msg: IntermediateForm) {
        trace!(message_type = ?msg.message_type, device_id = %msg.device_id, "publish data.parsed");
        let _ = self.data_parsed.send(msg);
    }

    pub fn subscribe_parsed(&self) -> broadcast::Receiver<IntermediateForm> {
        self.data_parsed.subscribe()
    }

    pub fn publish_normalized(&self, msg: CanonicalEvent) {
        trace!(message_type = ?msg.message_type, device_id = %msg.device_id, "publish data.normalized");
        let _ = self.data_normalized.send(msg);
    }

    pub fn subscribe_normalized(&self) -> broadcast::Receiver<CanonicalEvent> {
        self.data_normalized.subscribe()
    }

    pub fn publish_command(&self, msg: CommandRequest) {
        let _ = self.command_request.send(msg);
    }

    pub fn subscribe_command(&self) -> broadcast::Receiver<CommandRequest> {
        self.command_request.subscribe()
    }

    /// Publish an error tagged with its originating component. Errors
    /// never propagate across a channel boundary by return value — this
    /// is the only way a component's failure becomes visible to the
    /// rest of the pipeline.
    pub fn publish_error(&self, source_component: &'static str, error: impl std::fmt::Display) {
        warn!(component = source_component, error = %error, "component error");
        let _ = self.error.send(BusError::new(source_component, error));
    }

    pub fn subscribe_error(&self) -> broadcast::Receiver<BusError> {
        self.error.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a task that renders every `error` channel message through
/// `tracing`. This is the "logger subscribed to error" collaborator
/// called out in the error-handling design.
pub fn spawn_error_logger(
    bus: EventBus,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut errors = bus.subscribe_error();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                recv = errors.recv() => {
                    match recv {
                        Ok(err) => {
                            tracing::error!(component = err.source_component, error = %err.error, "error channel");
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "error logger lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceType, MessageType};
    use serde_json::json;

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_normalized();
        let mut b = bus.subscribe_normalized();

        let ce = CanonicalEvent::new(MessageType::Heartbeat, "dev1", DeviceType::B, vec![json!({})]);
        bus.publish_normalized(ce);

        assert_eq!(a.recv().await.unwrap().device_id, "dev1");
        assert_eq!(b.recv().await.unwrap().device_id, "dev1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_error("Test", "boom");
    }

    #[tokio::test]
    async fn error_channel_carries_source_component() {
        let bus = EventBus::new();
        let mut errors = bus.subscribe_error();
        bus.publish_error("ParserB", "truncated frame");
        let err = errors.recv().await.unwrap();
        assert_eq!(err.source_component, "ParserB");
        assert_eq!(err.error, "truncated frame");
    }
}
