//! Broadcast/push channel — the WebSocket surface that mirrors
//! `data.normalized` to connected clients and accepts inbound command
//! intents back onto `command.request`.
//!
//! Each client gets its own subscription to the Event Bus (the same
//! fan-out discipline as every other bus consumer); a slow client lags
//! and misses frames rather than stalling the others.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::types::CommandRequest;

const COMPONENT: &str = "BroadcastPush";

#[derive(Clone)]
pub struct PushState {
    pub bus: EventBus,
}

#[derive(Serialize)]
struct DataFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Value,
    timestamp: chrono::DateTime<Utc>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<PushState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: PushState) {
    if socket
        .send(Message::Text(json!({ "type": "connected" }).to_string()))
        .await
        .is_err()
    {
        return;
    }

    let mut events = state.bus.subscribe_normalized();

    if socket
        .send(Message::Text(json!({ "type": "ready" }).to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_inbound(&text, &state.bus),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket recv error");
                        break;
                    }
                }
            }

            recv = events.recv() => {
                match recv {
                    Ok(ce) => {
                        let data = serde_json::to_value(&ce).unwrap_or(Value::Null);
                        let frame = DataFrame { kind: "data", data: &data, timestamp: Utc::now() };
                        let text = serde_json::to_string(&frame).unwrap_or_default();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "websocket client lagged behind data.normalized");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn handle_inbound(text: &str, bus: &EventBus) {
    let parsed: Result<Value, _> = serde_json::from_str(text);
    let Ok(value) = parsed else {
        bus.publish_error(COMPONENT, format!("inbound ws message was not valid json: {text}"));
        return;
    };

    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    if msg_type != "command" {
        return;
    }

    let Some(command) = value.get("command").cloned() else {
        bus.publish_error(COMPONENT, "inbound command frame missing `command` field");
        return;
    };

    match serde_json::from_value::<CommandRequest>(command) {
        Ok(cmd) => bus.publish_command(cmd),
        Err(e) => bus.publish_error(COMPONENT, format!("inbound command did not parse: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceType, MessageType};

    #[test]
    fn handle_inbound_ignores_non_command_frames() {
        let bus = EventBus::new();
        let mut commands = bus.subscribe_command();
        handle_inbound(r#"{"type":"ping"}"#, &bus);
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn handle_inbound_republishes_valid_command() {
        let bus = EventBus::new();
        let mut commands = bus.subscribe_command();
        let frame = json!({
            "type": "command",
            "command": {
                "deviceId": "dev1",
                "deviceType": "V5008",
                "messageType": "QRY_RFID_SNAPSHOT",
                "payload": { "moduleIndex": 0 }
            }
        });
        handle_inbound(&frame.to_string(), &bus);

        let cmd = commands.try_recv().expect("command should be republished");
        assert_eq!(cmd.device_id, "dev1");
        assert_eq!(cmd.device_type, DeviceType::B);
        assert_eq!(cmd.message_type, MessageType::QryRfidSnapshot);
    }

    #[test]
    fn handle_inbound_reports_malformed_command_on_error_channel() {
        let bus = EventBus::new();
        let mut errors = bus.subscribe_error();
        handle_inbound(r#"{"type":"command","command":{"deviceId":"x"}}"#, &bus);
        assert!(errors.try_recv().is_ok());
    }
}
