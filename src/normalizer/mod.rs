//! Normalizer (C5) — converts intermediate-form messages into canonical
//! events, reconciles device/module metadata, diffs RFID state, and
//! issues repair/resync command requests.
//!
//! One worker owns the single-writer discipline on the cache for this
//! stage: it dispatches on `IntermediateForm::message_type` with a
//! `match`, each arm a private method taking `&IntermediateForm` and
//! reading/writing the shared `StateCache`. Debounce state for repair
//! triggers lives in two small `DashMap`s owned by the normalizer
//! itself rather than the cache — it is bookkeeping about this
//! component's own emission behavior, not device state, following the
//! teacher's habit of keeping concurrent side-tables in `dashmap`
//! rather than growing the mutex-guarded struct.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::bus::EventBus;
use crate::cache::{DevicePatch, ModuleDescriptor, RfidSlot, StateCache};
use crate::common::AtomicCounters;
use crate::types::{CanonicalEvent, CommandRequest, DeviceType, IntermediateForm, MessageType};

const COMPONENT: &str = "Normalizer";

pub struct Normalizer {
    cache: Arc<StateCache>,
    bus: EventBus,
    heartbeat_interval: Duration,
    device_info_debounce: DashMap<String, Instant>,
    fw_ver_debounce: DashMap<(String, u32), Instant>,
    counters: Arc<AtomicCounters>,
}

impl Normalizer {
    pub fn new(cache: Arc<StateCache>, bus: EventBus, heartbeat_interval: Duration) -> Self {
        Self {
            cache,
            bus,
            heartbeat_interval,
            device_info_debounce: DashMap::new(),
            fw_ver_debounce: DashMap::new(),
            counters: Arc::new(AtomicCounters::new()),
        }
    }

    /// Shared with the composition root for a periodic stats summary;
    /// the same counters `dispatch` below increments.
    pub fn counters(&self) -> Arc<AtomicCounters> {
        self.counters.clone()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut parsed = self.bus.subscribe_parsed();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                recv = parsed.recv() => {
                    match recv {
                        Ok(ifm) => self.dispatch(&ifm),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "normalizer lagged on data.parsed");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Dispatch one intermediate-form message by `messageType`. Exposed
    /// (rather than private) so integration tests can drive the
    /// normalizer directly from parser output without going through the
    /// bus's async `run` loop.
    pub fn dispatch(&self, ifm: &IntermediateForm) {
        self.counters.inc_received();
        self.counters.inc_processed();
        match ifm.message_type {
            MessageType::Heartbeat => self.on_heartbeat(ifm),
            MessageType::DeviceInfo => self.on_device_info(ifm),
            MessageType::ModuleInfo => self.on_module_info(ifm),
            MessageType::DevModInfo => self.on_dev_mod_info(ifm, false),
            MessageType::UtotalChanged => self.on_dev_mod_info(ifm, true),
            MessageType::TempHum => self.on_temp_hum(ifm),
            MessageType::NoiseLevel => self.on_noise(ifm),
            MessageType::DoorState => self.on_door_state(ifm),
            MessageType::RfidSnapshot => self.on_rfid_snapshot(ifm),
            MessageType::RfidEvent => self.on_rfid_event(ifm),
            MessageType::QryClrResp
            | MessageType::SetClrResp
            | MessageType::ClnAlmResp
            | MessageType::QryTempHumResp
            | MessageType::QryDoorStateResp => self.on_command_response(ifm),
            MessageType::Unknown => {
                self.bus.publish_error(COMPONENT, format!("unrecognized message from {}", ifm.device_id));
            }
            other => {
                warn!(?other, device_id = %ifm.device_id, "normalizer has no handler for this message type");
            }
        }
    }

    // -- HEARTBEAT ------------------------------------------------------

    fn on_heartbeat(&self, ifm: &IntermediateForm) {
        let modules = match ifm.data.as_array() {
            Some(arr) => arr,
            None => return,
        };

        let descriptors: Vec<ModuleDescriptor> = modules
            .iter()
            .filter_map(|m| {
                Some(ModuleDescriptor {
                    module_index: m.get("moduleIndex")?.as_u64()? as u32,
                    module_id: m.get("moduleId")?.as_str()?.to_string(),
                    u_total: m.get("uTotal").and_then(Value::as_u64).map(|v| v as u32),
                    fw_ver: None,
                })
            })
            .collect();

        self.cache.set_device_type(&ifm.device_id, ifm.device_type);
        let changes = self.cache.reconcile_metadata(&ifm.device_id, &descriptors);
        for desc in &descriptors {
            self.cache.update_heartbeat(&ifm.device_id, desc.module_index, &desc.module_id, desc.u_total.unwrap_or_default());
        }

        let ce = CanonicalEvent::new(MessageType::Heartbeat, ifm.device_id.clone(), ifm.device_type, modules.clone())
            .with_message_id(ifm.message_id.clone());
        self.bus.publish_normalized(ce);

        self.emit_device_metadata(ifm.device_id.clone(), ifm.device_type);
        if !changes.is_empty() {
            self.emit_meta_changed(ifm.device_id.clone(), ifm.device_type, &changes);
        }

        if self.cache.is_device_info_missing(&ifm.device_id)
            && self.debounce_ready(&self.device_info_debounce, ifm.device_id.clone())
        {
            self.bus.publish_command(CommandRequest {
                device_id: ifm.device_id.clone(),
                device_type: ifm.device_type,
                message_type: MessageType::QryDevModInfo,
                payload: Value::Null,
                command_id: None,
            });
        }

        for module_index in self.cache.get_modules_missing_fw_ver(&ifm.device_id) {
            let key = (ifm.device_id.clone(), module_index);
            if self.debounce_ready(&self.fw_ver_debounce, key) {
                self.bus.publish_command(CommandRequest {
                    device_id: ifm.device_id.clone(),
                    device_type: ifm.device_type,
                    message_type: MessageType::QryModuleInfo,
                    payload: serde_json::json!({ "moduleIndex": module_index }),
                    command_id: None,
                });
            }
        }
    }

    // -- DEVICE_INFO / MODULE_INFO / DEV_MOD_INFO / UTOTAL_CHANGED -----

    fn on_device_info(&self, ifm: &IntermediateForm) {
        let patch = DevicePatch {
            ip: ifm.data.get("ip").and_then(Value::as_str).map(str::to_string),
            mac: ifm.data.get("mac").and_then(Value::as_str).map(str::to_string),
            fw_ver: ifm.data.get("fwVer").and_then(Value::as_str).map(str::to_string),
            mask: ifm.data.get("mask").and_then(Value::as_str).map(str::to_string),
            gateway: ifm.data.get("gateway").and_then(Value::as_str).map(str::to_string),
            model: ifm.data.get("model").and_then(Value::as_str).map(str::to_string),
        };
        self.cache.set_device_type(&ifm.device_id, ifm.device_type);
        let changes = self.cache.upsert_metadata(&ifm.device_id, patch);
        self.emit_device_metadata(ifm.device_id.clone(), ifm.device_type);
        if !changes.is_empty() {
            self.emit_meta_changed(ifm.device_id.clone(), ifm.device_type, &changes);
        }
    }

    fn on_module_info(&self, ifm: &IntermediateForm) {
        let modules = match ifm.data.as_array() {
            Some(arr) => arr,
            None => return,
        };
        let mut changes = Vec::new();
        for m in modules {
            let Some(module_index) = m.get("moduleIndex").and_then(Value::as_u64).map(|v| v as u32) else {
                continue;
            };
            let fw_ver = m.get("fwVer").and_then(Value::as_str).map(str::to_string);
            changes.extend(self.cache.upsert_module(&ifm.device_id, module_index, None, None, fw_ver));
        }
        self.cache.set_device_type(&ifm.device_id, ifm.device_type);
        self.emit_device_metadata(ifm.device_id.clone(), ifm.device_type);
        if !changes.is_empty() {
            self.emit_meta_changed(ifm.device_id.clone(), ifm.device_type, &changes);
        }
    }

    fn on_dev_mod_info(&self, ifm: &IntermediateForm, always_emit: bool) {
        let patch = DevicePatch {
            ip: ifm.data.get("ip").and_then(Value::as_str).map(str::to_string),
            mac: ifm.data.get("mac").and_then(Value::as_str).map(str::to_string),
            ..Default::default()
        };
        self.cache.set_device_type(&ifm.device_id, ifm.device_type);
        let mut changes = self.cache.upsert_metadata(&ifm.device_id, patch);

        if let Some(modules) = ifm.data.get("modules").and_then(Value::as_array) {
            for m in modules {
                let Some(module_index) = m.get("moduleIndex").and_then(Value::as_u64).map(|v| v as u32) else {
                    continue;
                };
                let module_id = m.get("moduleId").and_then(Value::as_str).map(str::to_string);
                let u_total = m.get("uTotal").and_then(Value::as_u64).map(|v| v as u32);
                let fw_ver = m.get("fwVer").and_then(Value::as_str).map(str::to_string);
                changes.extend(self.cache.upsert_module(&ifm.device_id, module_index, module_id, u_total, fw_ver));
            }
        }

        self.emit_device_metadata(ifm.device_id.clone(), ifm.device_type);
        if always_emit || !changes.is_empty() {
            if changes.is_empty() {
                changes.push("module configuration unchanged".to_string());
            }
            self.emit_meta_changed(ifm.device_id.clone(), ifm.device_type, &changes);
        }
    }

    // -- TEMP_HUM / NOISE_LEVEL ------------------------------------------

    fn on_temp_hum(&self, ifm: &IntermediateForm) {
        for (module_index, module_id, records) in temp_hum_groups(&ifm.data) {
            let slots = records
                .iter()
                .map(|(idx, temp, hum)| (*idx, crate::cache::TempHumReading { temp: *temp, hum: *hum }))
                .collect();
            self.cache.update_temp_hum(&ifm.device_id, module_index, slots);

            let payload: Vec<Value> = records
                .iter()
                .map(|(idx, temp, hum)| serde_json::json!({ "sensorIndex": idx, "temp": temp, "hum": hum }))
                .collect();
            let mut ce = CanonicalEvent::new(MessageType::TempHum, ifm.device_id.clone(), ifm.device_type, payload)
                .with_message_id(ifm.message_id.clone());
            ce = ce.with_module(module_index, module_id.unwrap_or_default());
            self.bus.publish_normalized(ce);
        }
    }

    fn on_noise(&self, ifm: &IntermediateForm) {
        for (module_index, module_id, records) in noise_groups(&ifm.data) {
            let slots = records.iter().cloned().collect();
            self.cache.update_noise(&ifm.device_id, module_index, slots);

            let payload: Vec<Value> = records
                .iter()
                .map(|(idx, noise)| serde_json::json!({ "sensorIndex": idx, "noise": noise }))
                .collect();
            let mut ce = CanonicalEvent::new(MessageType::NoiseLevel, ifm.device_id.clone(), ifm.device_type, payload)
                .with_message_id(ifm.message_id.clone());
            ce = ce.with_module(module_index, module_id.unwrap_or_default());
            self.bus.publish_normalized(ce);
        }
    }

    // -- DOOR_STATE -------------------------------------------------------

    fn on_door_state(&self, ifm: &IntermediateForm) {
        let Some(module_index) = ifm.data.get("moduleIndex").and_then(Value::as_u64).map(|v| v as u32) else {
            return;
        };
        let module_id = ifm.data.get("moduleId").and_then(Value::as_str).unwrap_or_default().to_string();
        let (single, dual) = door_fields(&ifm.data);
        self.cache.update_door(&ifm.device_id, module_index, single, dual);

        let payload = match dual {
            Some((d1, d2)) => serde_json::json!({ "door1State": d1, "door2State": d2 }),
            None => serde_json::json!({ "doorState": single }),
        };
        let ce = CanonicalEvent::new(MessageType::DoorState, ifm.device_id.clone(), ifm.device_type, vec![payload])
            .with_module(module_index, module_id)
            .with_message_id(ifm.message_id.clone());
        self.bus.publish_normalized(ce);
    }

    // -- RFID_SNAPSHOT / RFID_EVENT ----------------------------------------

    fn on_rfid_snapshot(&self, ifm: &IntermediateForm) {
        for (module_index, module_id, slots) in rfid_groups(&ifm.data) {
            let previous = self.cache.update_rfid(&ifm.device_id, module_index, slots.clone());
            let diff = StateCache::diff_rfid(&previous, &slots);

            let snapshot_payload: Vec<Value> = slots
                .iter()
                .map(|s| serde_json::json!({ "slotIndex": s.slot_index, "tagId": s.tag_id, "alarm": s.alarm }))
                .collect();
            let ce = CanonicalEvent::new(MessageType::RfidSnapshot, ifm.device_id.clone(), ifm.device_type, snapshot_payload)
                .with_module(module_index, module_id.clone())
                .with_message_id(ifm.message_id.clone());
            self.bus.publish_normalized(ce);

            for slot in &diff.attached {
                self.emit_rfid_event(ifm, module_index, &module_id, slot, "ATTACHED");
            }
            for slot in &diff.detached {
                self.emit_rfid_event(ifm, module_index, &module_id, slot, "DETACHED");
            }
        }
    }

    fn emit_rfid_event(&self, ifm: &IntermediateForm, module_index: u32, module_id: &str, slot: &RfidSlot, action: &str) {
        let payload = serde_json::json!({ "slotIndex": slot.slot_index, "tagId": slot.tag_id, "action": action });
        let ce = CanonicalEvent::new(MessageType::RfidEvent, ifm.device_id.clone(), ifm.device_type, vec![payload])
            .with_module(module_index, module_id.to_string())
            .with_message_id(ifm.message_id.clone());
        self.bus.publish_normalized(ce);
    }

    /// Family-J device-reported RFID events are not authoritative: ask
    /// the device for a fresh snapshot instead of trusting the event,
    /// and return without touching the cache or emitting a CE. The
    /// resulting `RFID_SNAPSHOT`, processed normally, produces the
    /// correct diff.
    fn on_rfid_event(&self, ifm: &IntermediateForm) {
        let module_index = ifm.data.get("moduleIndex").and_then(Value::as_u64).map(|v| v as u32);
        self.bus.publish_command(CommandRequest {
            device_id: ifm.device_id.clone(),
            device_type: ifm.device_type,
            message_type: MessageType::QryRfidSnapshot,
            payload: serde_json::json!({ "moduleIndex": module_index }),
            command_id: None,
        });
    }

    // -- command responses -------------------------------------------------

    /// `QRY_CLR_RESP`/`SET_CLR_RESP`/`CLN_ALM_RESP` are pure passthrough;
    /// `QRY_TEMP_HUM_RESP`/`QRY_DOOR_STATE_RESP` additionally update the
    /// cache with the sensor/door values the response carries.
    fn on_command_response(&self, ifm: &IntermediateForm) {
        match ifm.message_type {
            MessageType::QryTempHumResp => {
                for (module_index, _module_id, records) in temp_hum_groups(&ifm.data) {
                    let slots = records
                        .iter()
                        .map(|(idx, temp, hum)| (*idx, crate::cache::TempHumReading { temp: *temp, hum: *hum }))
                        .collect();
                    self.cache.update_temp_hum(&ifm.device_id, module_index, slots);
                }
            }
            MessageType::QryDoorStateResp => {
                if let Some(module_index) = ifm.data.get("moduleIndex").and_then(Value::as_u64).map(|v| v as u32) {
                    let (single, dual) = door_fields(&ifm.data);
                    self.cache.update_door(&ifm.device_id, module_index, single, dual);
                }
            }
            _ => {}
        }

        let ce = CanonicalEvent::new(ifm.message_type, ifm.device_id.clone(), ifm.device_type, vec![ifm.data.clone()])
            .with_message_id(ifm.message_id.clone());
        self.bus.publish_normalized(ce);
    }

    // -- helpers -------------------------------------------------------

    fn emit_device_metadata(&self, device_id: String, device_type: DeviceType) {
        let Some(device) = self.cache.snapshot_device(&device_id) else {
            return;
        };
        let payload = serde_json::to_value(&device).unwrap_or(Value::Null);
        let ce = CanonicalEvent::new(MessageType::DeviceMetadata, device_id, device_type, vec![payload]);
        self.bus.publish_normalized(ce);
    }

    fn emit_meta_changed(&self, device_id: String, device_type: DeviceType, changes: &[String]) {
        let payload: Vec<Value> = changes.iter().map(|c| serde_json::json!({ "description": c })).collect();
        let ce = CanonicalEvent::new(MessageType::MetaChangedEvent, device_id, device_type, payload);
        self.bus.publish_normalized(ce);
    }

    fn debounce_ready<K: Eq + Hash + Clone>(&self, map: &DashMap<K, Instant>, key: K) -> bool {
        let now = Instant::now();
        if let Some(last) = map.get(&key) {
            if now.duration_since(*last) < self.heartbeat_interval {
                return false;
            }
        }
        map.insert(key, now);
        true
    }
}

fn rfid_groups(data: &Value) -> Vec<(u32, String, Vec<RfidSlot>)> {
    let slots_from = |v: &Value| -> Vec<RfidSlot> {
        v.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| {
                        Some(RfidSlot {
                            slot_index: s.get("slotIndex")?.as_u64()? as u32,
                            tag_id: s.get("tagId")?.as_str()?.to_string(),
                            alarm: s.get("alarm").and_then(Value::as_bool).unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    match data {
        Value::Array(groups) => groups
            .iter()
            .filter_map(|g| {
                let module_index = g.get("moduleIndex")?.as_u64()? as u32;
                let module_id = g.get("moduleId").and_then(Value::as_str).unwrap_or_default().to_string();
                Some((module_index, module_id, slots_from(g.get("slots").unwrap_or(&Value::Null))))
            })
            .collect(),
        obj @ Value::Object(_) => obj
            .get("moduleIndex")
            .and_then(Value::as_u64)
            .map(|idx| {
                let module_id = obj.get("moduleId").and_then(Value::as_str).unwrap_or_default().to_string();
                vec![(idx as u32, module_id, slots_from(obj.get("slots").unwrap_or(&Value::Null)))]
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

type TempHumRecord = (u32, Option<f64>, Option<f64>);

fn temp_hum_groups(data: &Value) -> Vec<(u32, Option<String>, Vec<TempHumRecord>)> {
    let records_from = |v: &Value| -> Vec<TempHumRecord> {
        v.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let idx = r.get("thIndex").and_then(Value::as_u64)? as u32;
                        let temp = r.get("temp").and_then(Value::as_f64);
                        let hum = r.get("hum").and_then(Value::as_f64);
                        Some((idx, temp, hum))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    match data {
        Value::Array(groups) => groups
            .iter()
            .filter_map(|g| {
                let module_index = g.get("moduleIndex")?.as_u64()? as u32;
                let module_id = g.get("moduleId").and_then(Value::as_str).map(str::to_string);
                Some((module_index, module_id, records_from(g.get("records").unwrap_or(&Value::Null))))
            })
            .collect(),
        obj @ Value::Object(_) => obj
            .get("moduleIndex")
            .and_then(Value::as_u64)
            .map(|idx| {
                let module_id = obj.get("moduleId").and_then(Value::as_str).map(str::to_string);
                vec![(idx as u32, module_id, records_from(obj.get("records").unwrap_or(&Value::Null)))]
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

type NoiseRecord = (u32, Option<f64>);

fn noise_groups(data: &Value) -> Vec<(u32, Option<String>, Vec<NoiseRecord>)> {
    let records_from = |v: &Value| -> Vec<NoiseRecord> {
        v.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let idx = r.get("nsIndex").and_then(Value::as_u64)? as u32;
                        let noise = r.get("noise").and_then(Value::as_f64);
                        Some((idx, noise))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    match data {
        obj @ Value::Object(_) => obj
            .get("moduleIndex")
            .and_then(Value::as_u64)
            .map(|idx| {
                let module_id = obj.get("moduleId").and_then(Value::as_str).map(str::to_string);
                vec![(idx as u32, module_id, records_from(obj.get("records").unwrap_or(&Value::Null)))]
            })
            .unwrap_or_default(),
        Value::Array(groups) => groups
            .iter()
            .filter_map(|g| {
                let module_index = g.get("moduleIndex")?.as_u64()? as u32;
                let module_id = g.get("moduleId").and_then(Value::as_str).map(str::to_string);
                Some((module_index, module_id, records_from(g.get("records").unwrap_or(&Value::Null))))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `door1State`/`door2State` present -> dual-door frame; otherwise a
/// single `state` (family-B) or `doorState` (family-J) field.
fn door_fields(data: &Value) -> (Option<u8>, Option<(Option<u8>, Option<u8>)>) {
    if data.get("door1State").is_some() || data.get("door2State").is_some() {
        let d1 = data.get("door1State").and_then(Value::as_u64).map(|v| v as u8);
        let d2 = data.get("door2State").and_then(Value::as_u64).map(|v| v as u8);
        (None, Some((d1, d2)))
    } else {
        let state = data
            .get("state")
            .or_else(|| data.get("doorState"))
            .and_then(Value::as_u64)
            .map(|v| v as u8);
        (state, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StateCache;

    fn normalizer() -> (Arc<Normalizer>, EventBus) {
        let bus = EventBus::new();
        let cache = Arc::new(StateCache::new());
        (Arc::new(Normalizer::new(cache, bus.clone(), Duration::from_secs(30))), bus)
    }

    #[tokio::test]
    async fn heartbeat_emits_metadata_ce_and_repair_command() {
        let (normalizer, bus) = normalizer();
        let mut normalized = bus.subscribe_normalized();
        let mut commands = bus.subscribe_command();

        let ifm = IntermediateForm::new(
            DeviceType::B,
            "dev1",
            MessageType::Heartbeat,
            "V5008Upload/dev1/OpeAck",
            serde_json::json!([{ "moduleIndex": 1, "moduleId": "100", "uTotal": 6 }]),
        );
        normalizer.dispatch(&ifm);

        let ce = normalized.recv().await.unwrap();
        assert_eq!(ce.message_type, MessageType::Heartbeat);

        let metadata_ce = normalized.recv().await.unwrap();
        assert_eq!(metadata_ce.message_type, MessageType::DeviceMetadata);

        let meta_changed = normalized.recv().await.unwrap();
        assert_eq!(meta_changed.message_type, MessageType::MetaChangedEvent);

        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.message_type, MessageType::QryDevModInfo);
    }

    #[tokio::test]
    async fn heartbeat_repair_command_is_debounced() {
        let (normalizer, bus) = normalizer();
        let mut commands = bus.subscribe_command();

        let ifm = IntermediateForm::new(
            DeviceType::B,
            "dev1",
            MessageType::Heartbeat,
            "V5008Upload/dev1/OpeAck",
            serde_json::json!([{ "moduleIndex": 1, "moduleId": "100", "uTotal": 6 }]),
        );
        normalizer.dispatch(&ifm);
        normalizer.dispatch(&ifm);

        let _first = commands.recv().await.unwrap();
        assert!(commands.try_recv().is_err(), "second repair command should be debounced");
    }

    #[tokio::test]
    async fn rfid_snapshot_emits_snapshot_then_attach_event() {
        let (normalizer, bus) = normalizer();
        let mut normalized = bus.subscribe_normalized();

        let ifm = IntermediateForm::new(
            DeviceType::B,
            "dev1",
            MessageType::RfidSnapshot,
            "V5008Upload/dev1/LabelState",
            serde_json::json!({
                "moduleIndex": 1,
                "moduleId": "100",
                "uTotal": 6,
                "slots": [{ "slotIndex": 1, "alarm": false, "tagId": "42" }],
            }),
        );
        normalizer.dispatch(&ifm);

        let snapshot_ce = normalized.recv().await.unwrap();
        assert_eq!(snapshot_ce.message_type, MessageType::RfidSnapshot);
        let event_ce = normalized.recv().await.unwrap();
        assert_eq!(event_ce.message_type, MessageType::RfidEvent);
        assert_eq!(event_ce.payload[0]["action"], "ATTACHED");
    }

    #[tokio::test]
    async fn rfid_event_triggers_resync_without_cache_update() {
        let (normalizer, bus) = normalizer();
        let mut commands = bus.subscribe_command();

        let ifm = IntermediateForm::new(
            DeviceType::J,
            "dev1",
            MessageType::RfidEvent,
            "V6800Upload/dev1/x",
            serde_json::json!({ "moduleIndex": 1, "slotIndex": 1, "tagId": "42", "action": "ATTACHED" }),
        );
        normalizer.dispatch(&ifm);

        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.message_type, MessageType::QryRfidSnapshot);
    }

    #[tokio::test]
    async fn door_state_dual_fields_update_cache() {
        let (normalizer, bus) = normalizer();
        let mut normalized = bus.subscribe_normalized();

        let ifm = IntermediateForm::new(
            DeviceType::J,
            "dev1",
            MessageType::DoorState,
            "V6800Upload/dev1/x",
            serde_json::json!({ "moduleIndex": 1, "door1State": 1, "door2State": 0 }),
        );
        normalizer.dispatch(&ifm);

        let ce = normalized.recv().await.unwrap();
        assert_eq!(ce.payload[0]["door1State"], 1);
        assert_eq!(ce.payload[0]["door2State"], 0);
    }
}
