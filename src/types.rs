//! Shared data model: device/module identity, the intermediate form (IF)
//! produced by the parsers, and the canonical event (CE) produced by the
//! normalizer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Device family / wire encoding. Serializes as the model name
/// (`V5008`/`V6800`), matching the external REST/WebSocket wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum DeviceType {
    /// Family-B: binary framing over `V5008Upload`/`V5008Download`.
    #[serde(rename = "V5008")]
    B,
    /// Family-J: JSON envelopes over `V6800Upload`/`V6800Download`.
    #[serde(rename = "V6800")]
    J,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::B => write!(f, "V5008"),
            DeviceType::J => write!(f, "V6800"),
        }
    }
}

/// The closed set of message types flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Heartbeat,
    RfidSnapshot,
    RfidEvent,
    TempHum,
    NoiseLevel,
    DoorState,
    DeviceInfo,
    ModuleInfo,
    DevModInfo,
    UtotalChanged,
    QryClrResp,
    SetClrResp,
    ClnAlmResp,
    QryTempHumResp,
    QryDoorStateResp,
    DeviceMetadata,
    MetaChangedEvent,
    /// Abstract command intents carried on `command.request` only.
    QryDevModInfo,
    QryDeviceInfo,
    QryModuleInfo,
    QryRfidSnapshot,
    SetColor,
    CleanAlarm,
    Unknown,
}

/// RFID attach/detach direction, as emitted on `RFID_EVENT` CEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RfidAction {
    Attached,
    Detached,
}

/// Envelope metadata carried alongside parser output: the originating
/// topic and, for diagnostics, a copy of the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfMeta {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Intermediate form: the common shape both parsers reduce their wire
/// protocol down to. `data` is deliberately `serde_json::Value` rather
/// than a per-variant Rust type — the normalizer is the layer that knows
/// the per-message-type shape of `data`, the parsers only need to agree
/// on the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateForm {
    pub device_type: DeviceType,
    pub device_id: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub meta: IfMeta,
    pub data: Value,
}

impl IntermediateForm {
    pub fn new(
        device_type: DeviceType,
        device_id: impl Into<String>,
        message_type: MessageType,
        topic: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            device_type,
            device_id: device_id.into(),
            message_type,
            message_id: None,
            meta: IfMeta {
                topic: topic.into(),
                raw: None,
            },
            data,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Canonical event: the normalizer's single output shape. `payload` is
/// always an array (invariant 5) even when it logically holds a single
/// record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub message_type: MessageType,
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub payload: Vec<Value>,
}

impl CanonicalEvent {
    pub fn new(
        message_type: MessageType,
        device_id: impl Into<String>,
        device_type: DeviceType,
        payload: Vec<Value>,
    ) -> Self {
        Self {
            message_type,
            device_id: device_id.into(),
            device_type,
            module_index: None,
            module_id: None,
            message_id: None,
            payload,
        }
    }

    pub fn with_module(mut self, module_index: u32, module_id: impl Into<String>) -> Self {
        self.module_index = Some(module_index);
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }
}

/// An abstract control intent, built by REST handlers or the
/// broadcast-push inbound path, consumed by the Command Translator.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub device_id: String,
    pub device_type: DeviceType,
    pub message_type: MessageType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}
