//! Command Translator (C7) — subscribes to `command.request`, validates
//! the abstract intent, and translates it into family-specific wire
//! payloads published on the egress topic.
//!
//! The publish side is an `Egress` trait rather than a concrete MQTT
//! client so the translation logic can be unit-tested without a broker;
//! `MqttEgress` is the `rumqttc::AsyncClient`-backed production impl,
//! the same seam the ingress adapter uses for its own publish-time
//! QoS/timeout policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::bus::EventBus;
use crate::common::AtomicCounters;
use crate::parser_b::constants::{
    OPCODE_CLEAN_ALARM, OPCODE_QRY_DEVICE_INFO, OPCODE_QRY_MODULE_INFO, OPCODE_QRY_RFID_SNAPSHOT,
    OPCODE_SET_COLOR,
};
use crate::types::{CommandRequest, DeviceType, MessageType};

const COMPONENT: &str = "CommandTranslator";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unsupported message type {0:?} for device type {1:?}")]
    Unsupported(MessageType, DeviceType),
}

/// Egress publish seam: binary payloads go to `V5008Download/{deviceId}`,
/// JSON payloads to `V6800Download/{deviceId}`.
#[async_trait]
pub trait Egress: Send + Sync {
    async fn publish_bytes(&self, topic: &str, qos: u8, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn publish_json(&self, topic: &str, qos: u8, payload: Value) -> anyhow::Result<()>;
}

/// Production egress backed by an `rumqttc::AsyncClient`.
pub struct MqttEgress {
    client: rumqttc::AsyncClient,
}

impl MqttEgress {
    pub fn new(client: rumqttc::AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Egress for MqttEgress {
    async fn publish_bytes(&self, topic: &str, qos: u8, payload: Vec<u8>) -> anyhow::Result<()> {
        let qos = qos_from_u8(qos);
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    async fn publish_json(&self, topic: &str, qos: u8, payload: Value) -> anyhow::Result<()> {
        let qos = qos_from_u8(qos);
        let bytes = serde_json::to_vec(&payload)?;
        self.client.publish(topic, qos, false, bytes).await?;
        Ok(())
    }
}

fn qos_from_u8(qos: u8) -> rumqttc::QoS {
    match qos {
        0 => rumqttc::QoS::AtMostOnce,
        2 => rumqttc::QoS::ExactlyOnce,
        _ => rumqttc::QoS::AtLeastOnce,
    }
}

pub struct CommandTranslator<E: Egress> {
    egress: E,
    bus: EventBus,
    counters: Arc<AtomicCounters>,
}

impl<E: Egress> CommandTranslator<E> {
    pub fn new(egress: E, bus: EventBus) -> Self {
        Self { egress, bus, counters: Arc::new(AtomicCounters::new()) }
    }

    /// Shared with the composition root for a periodic stats summary;
    /// the same counters `handle` below increments.
    pub fn counters(&self) -> Arc<AtomicCounters> {
        self.counters.clone()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut commands = self.bus.subscribe_command();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                recv = commands.recv() => {
                    match recv {
                        Ok(cmd) => self.handle(cmd).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "command translator lagged on command.request");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Translate and publish one command intent. Public so integration
    /// tests can drive the translator directly without going through
    /// the bus's async `run` loop.
    pub async fn handle(&self, cmd: CommandRequest) {
        self.counters.inc_received();
        let result = match cmd.device_type {
            DeviceType::B => self.send_family_b(&cmd).await,
            DeviceType::J => self.send_family_j(&cmd).await,
        };
        match result {
            Ok(()) => self.counters.inc_processed(),
            Err(e) => {
                self.counters.inc_dropped();
                self.bus.publish_error(COMPONENT, format!("{} for device {}: {}", e, cmd.device_id, e));
            }
        }
    }

    async fn publish_with_timeout_bytes(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        match timeout(PUBLISH_TIMEOUT, self.egress.publish_bytes(topic, 1, payload)).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("command publish to {} timed out", topic),
        }
    }

    async fn publish_with_timeout_json(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        match timeout(PUBLISH_TIMEOUT, self.egress.publish_json(topic, 1, payload)).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("command publish to {} timed out", topic),
        }
    }

    async fn send_family_b(&self, cmd: &CommandRequest) -> anyhow::Result<()> {
        let topic = format!("V5008Download/{}", cmd.device_id);

        match cmd.message_type {
            MessageType::QryRfidSnapshot => {
                let module_index = require_u8(&cmd.payload, "moduleIndex")?;
                self.publish_with_timeout_bytes(&topic, vec![OPCODE_QRY_RFID_SNAPSHOT, 0x01, module_index]).await
            }
            MessageType::SetColor => {
                let module_index = require_u8(&cmd.payload, "moduleIndex")?;
                let pairs = color_pairs(&cmd.payload)?;
                let mut buf = vec![OPCODE_SET_COLOR, module_index];
                for (slot, code) in pairs {
                    buf.push(slot);
                    buf.push(code);
                }
                self.publish_with_timeout_bytes(&topic, buf).await
            }
            MessageType::CleanAlarm => {
                let module_index = require_u8(&cmd.payload, "moduleIndex")?;
                let slot_index = require_u8(&cmd.payload, "sensorIndex")?;
                self.publish_with_timeout_bytes(&topic, vec![OPCODE_CLEAN_ALARM, module_index, slot_index]).await
            }
            MessageType::QryDevModInfo => {
                let (h0, h1) = OPCODE_QRY_DEVICE_INFO;
                self.publish_with_timeout_bytes(&topic, vec![h0, h1, 0x00]).await?;
                let (h0, h1) = OPCODE_QRY_MODULE_INFO;
                self.publish_with_timeout_bytes(&topic, vec![h0, h1, 0x00]).await
            }
            MessageType::QryDeviceInfo => {
                let (h0, h1) = OPCODE_QRY_DEVICE_INFO;
                self.publish_with_timeout_bytes(&topic, vec![h0, h1, 0x00]).await
            }
            MessageType::QryModuleInfo => {
                let (h0, h1) = OPCODE_QRY_MODULE_INFO;
                self.publish_with_timeout_bytes(&topic, vec![h0, h1, 0x00]).await
            }
            other => Err(TranslateError::Unsupported(other, DeviceType::B).into()),
        }
    }

    async fn send_family_j(&self, cmd: &CommandRequest) -> anyhow::Result<()> {
        let topic = format!("V6800Download/{}", cmd.device_id);

        match cmd.message_type {
            MessageType::QryRfidSnapshot => {
                let module_index = cmd.payload.get("moduleIndex").cloned().unwrap_or(Value::Null);
                self.publish_with_timeout_json(&topic, json!({
                    "msg_type": "query_u_state_req",
                    "module_index": module_index,
                })).await
            }
            MessageType::SetColor => {
                let module_index = require_u8(&cmd.payload, "moduleIndex")?;
                let pairs = color_pairs(&cmd.payload)?;
                let u_color_data: Vec<Value> = pairs
                    .iter()
                    .map(|(slot, code)| json!({ "index": slot, "color_code": code }))
                    .collect();
                self.publish_with_timeout_json(&topic, json!({
                    "msg_type": "set_module_property_req",
                    "module_index": module_index,
                    "u_color_data": u_color_data,
                })).await
            }
            MessageType::CleanAlarm => {
                let module_index = require_u8(&cmd.payload, "moduleIndex")?;
                let slot_index = require_u8(&cmd.payload, "sensorIndex")?;
                self.publish_with_timeout_json(&topic, json!({
                    "msg_type": "clear_u_warning",
                    "module_index": module_index,
                    "index": slot_index,
                })).await
            }
            MessageType::QryDevModInfo => {
                self.publish_with_timeout_json(&topic, json!({ "msg_type": "query_dev_mod_info_req" })).await
            }
            other => Err(TranslateError::Unsupported(other, DeviceType::J).into()),
        }
    }
}

fn require_u8(payload: &Value, field: &'static str) -> Result<u8, TranslateError> {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .map(|v| v as u8)
        .ok_or(TranslateError::MissingField(field))
}

/// `SET_COLOR` accepts either a `colorMap[]` of `{sensorIndex, colorCode}`
/// or a single `{sensorIndex, colorCode}` pair at the top level.
fn color_pairs(payload: &Value) -> Result<Vec<(u8, u8)>, TranslateError> {
    if let Some(map) = payload.get("colorMap").and_then(Value::as_array) {
        if map.is_empty() {
            return Err(TranslateError::MissingField("colorMap"));
        }
        return map
            .iter()
            .map(|entry| {
                let slot = entry.get("sensorIndex").and_then(Value::as_u64).ok_or(TranslateError::MissingField("sensorIndex"))? as u8;
                let code = entry.get("colorCode").and_then(Value::as_u64).ok_or(TranslateError::MissingField("colorCode"))? as u8;
                Ok((slot, code))
            })
            .collect();
    }
    let slot = require_u8(payload, "sensorIndex")?;
    let code = require_u8(payload, "colorCode")?;
    Ok(vec![(slot, code)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEgress {
        bytes: Mutex<Vec<(String, Vec<u8>)>>,
        json: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Egress for RecordingEgress {
        async fn publish_bytes(&self, topic: &str, _qos: u8, payload: Vec<u8>) -> anyhow::Result<()> {
            self.bytes.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
        async fn publish_json(&self, topic: &str, _qos: u8, payload: Value) -> anyhow::Result<()> {
            self.json.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_color_family_b_builds_exact_bytes() {
        let bus = EventBus::new();
        let egress = RecordingEgress::default();
        let translator = CommandTranslator::new(egress, bus.clone());

        let cmd = CommandRequest {
            device_id: "X".into(),
            device_type: DeviceType::B,
            message_type: MessageType::SetColor,
            payload: json!({ "moduleIndex": 1, "sensorIndex": 10, "colorCode": 1 }),
            command_id: None,
        };
        translator.handle(cmd).await;

        let recorded = translator.egress.bytes.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "V5008Download/X");
        assert_eq!(recorded[0].1, vec![0xE1, 0x01, 0x0A, 0x01]);
    }

    #[tokio::test]
    async fn qry_dev_mod_info_family_b_sends_two_frames() {
        let bus = EventBus::new();
        let egress = RecordingEgress::default();
        let translator = CommandTranslator::new(egress, bus.clone());

        let cmd = CommandRequest {
            device_id: "X".into(),
            device_type: DeviceType::B,
            message_type: MessageType::QryDevModInfo,
            payload: Value::Null,
            command_id: None,
        };
        translator.handle(cmd).await;

        let recorded = translator.egress.bytes.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].1, vec![0xEF, 0x01, 0x00]);
        assert_eq!(recorded[1].1, vec![0xEF, 0x02, 0x00]);
    }

    #[tokio::test]
    async fn missing_required_field_is_reported_on_error_channel_not_thrown() {
        let bus = EventBus::new();
        let mut errors = bus.subscribe_error();
        let egress = RecordingEgress::default();
        let translator = CommandTranslator::new(egress, bus.clone());

        let cmd = CommandRequest {
            device_id: "X".into(),
            device_type: DeviceType::B,
            message_type: MessageType::SetColor,
            payload: json!({ "moduleIndex": 1 }),
            command_id: None,
        };
        translator.handle(cmd).await;

        let err = errors.try_recv().expect("validation failure should publish on error channel");
        assert_eq!(err.source_component, COMPONENT);
    }

    #[tokio::test]
    async fn set_color_family_j_builds_json_envelope() {
        let bus = EventBus::new();
        let egress = RecordingEgress::default();
        let translator = CommandTranslator::new(egress, bus.clone());

        let cmd = CommandRequest {
            device_id: "Y".into(),
            device_type: DeviceType::J,
            message_type: MessageType::SetColor,
            payload: json!({ "moduleIndex": 1, "sensorIndex": 10, "colorCode": 1 }),
            command_id: None,
        };
        translator.handle(cmd).await;

        let recorded = translator.egress.json.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "V6800Download/Y");
        assert_eq!(recorded[0].1["msg_type"], "set_module_property_req");
    }

    #[tokio::test]
    async fn unknown_device_type_message_type_pair_errors_without_panicking() {
        let bus = EventBus::new();
        let mut errors = bus.subscribe_error();
        let egress = RecordingEgress::default();
        let translator = CommandTranslator::new(egress, bus.clone());

        let cmd = CommandRequest {
            device_id: "X".into(),
            device_type: DeviceType::B,
            message_type: MessageType::Heartbeat,
            payload: Value::Null,
            command_id: None,
        };
        translator.handle(cmd).await;
        assert!(errors.try_recv().is_ok());
    }
}
