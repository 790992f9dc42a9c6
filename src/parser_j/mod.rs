//! Parser J (C4) — decodes self-describing JSON envelopes for Family-J
//! devices into the intermediate form.
//!
//! The envelope is parsed into a `serde_json::Value` first rather than
//! one strict `#[derive(Deserialize)]` struct: the alias-and-fallback
//! rules below need to probe several mutually exclusive key names per
//! field, and some fallbacks depend on *other* fields or on the topic
//! string — something `#[serde(alias = ...)]` alone cannot express.
//! Small typed structs are deserialized out of the relevant `Value`
//! subtrees once the right one has been located.

use serde_json::Value;

use crate::types::{DeviceType, IntermediateForm, MessageType};

/// Discriminator table. Includes the known typo `"devies_init_req"`
/// verbatim — real devices emit this spelling and it must not be
/// "fixed".
fn message_type_for(msg_type: &str) -> MessageType {
    match msg_type {
        "heart_beat_req" => MessageType::Heartbeat,
        "u_state_resp" => MessageType::RfidSnapshot,
        "u_state_changed_notify_req" => MessageType::RfidEvent,
        "th_data_req" | "th_data_resp" => MessageType::TempHum,
        "door_state_notify_req" | "door_state_resp" => MessageType::DoorState,
        "device_info_req" | "devies_init_req" => MessageType::DevModInfo,
        "utotal_changed_notify_req" => MessageType::UtotalChanged,
        "query_u_color_resp" => MessageType::QryClrResp,
        "set_module_property_resp" => MessageType::SetClrResp,
        "clear_u_warning_resp" => MessageType::ClnAlmResp,
        "query_th_data_resp" => MessageType::QryTempHumResp,
        "query_door_state_resp" => MessageType::QryDoorStateResp,
        _ => MessageType::Unknown,
    }
}

/// Pull a string field out of the envelope trying each key in order,
/// the shape every "checked in order" alias rule in the spec follows.
fn first_string(envelope: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| envelope.get(key).and_then(Value::as_str))
        .map(|s| s.to_string())
}

fn extract_device_id(envelope: &Value, msg_type: &str, topic: &str) -> Option<String> {
    if msg_type == "heart_beat_req" && envelope.get("module_type").and_then(Value::as_str) == Some("mt_gw") {
        if let Some(sn) = envelope.get("module_sn").and_then(Value::as_str) {
            return Some(sn.to_string());
        }
    }

    if let Some(id) = first_string(envelope, &["gateway_sn", "gateway_id", "device_id", "dev_id", "sn"]) {
        return Some(id);
    }

    // Fallback: `V6800Upload/{deviceId}/...`
    topic.split('/').nth(1).map(|s| s.to_string())
}

fn module_index_of(item: &Value) -> Option<u32> {
    item.get("module_index")
        .or_else(|| item.get("host_gateway_port_index"))
        .or_else(|| item.get("index"))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
}

fn module_id_of(item: &Value) -> Option<String> {
    item.get("module_sn")
        .or_else(|| item.get("extend_module_sn"))
        .or_else(|| item.get("module_id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// `0`/`true` -> "Success", `1`/`false` -> "Failure", matching the
/// result-normalization rule for command responses.
fn normalize_result(envelope: &Value) -> Option<&'static str> {
    let value = envelope.get("result")?;
    if let Some(b) = value.as_bool() {
        return Some(if b { "Success" } else { "Failure" });
    }
    if let Some(n) = value.as_i64() {
        return Some(if n == 0 { "Success" } else { "Failure" });
    }
    None
}

/// Decode a Family-J JSON envelope. Returns `None` on any malformed or
/// unparseable input; never panics.
pub fn parse(topic: &str, text: &str) -> Option<IntermediateForm> {
    let envelope: Value = serde_json::from_str(text).ok()?;
    parse_value(topic, &envelope)
}

pub fn parse_value(topic: &str, envelope: &Value) -> Option<IntermediateForm> {
    let msg_type_str = envelope.get("msg_type").and_then(Value::as_str).unwrap_or("");
    let message_type = message_type_for(msg_type_str);
    let device_id = extract_device_id(envelope, msg_type_str, topic)?;
    let message_id = envelope
        .get("uuid_number")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    let data = match message_type {
        MessageType::Unknown => envelope.clone(),
        MessageType::Heartbeat => build_heartbeat(envelope),
        MessageType::RfidSnapshot => build_rfid_snapshot(envelope),
        MessageType::RfidEvent => build_rfid_event(envelope),
        MessageType::TempHum => build_temp_hum(envelope),
        MessageType::DoorState => build_door_state(envelope),
        MessageType::DevModInfo => build_dev_mod_info(envelope),
        MessageType::UtotalChanged => build_dev_mod_info(envelope),
        MessageType::QryClrResp | MessageType::SetClrResp | MessageType::ClnAlmResp => build_cmd_resp(envelope),
        MessageType::QryTempHumResp => build_qry_temp_hum_resp(envelope),
        MessageType::QryDoorStateResp => build_qry_door_state_resp(envelope),
        _ => envelope.clone(),
    };

    let mut ifm = IntermediateForm::new(DeviceType::J, device_id, message_type, topic, data);
    if let Some(mid) = message_id {
        ifm = ifm.with_message_id(mid);
    }
    Some(ifm)
}

fn build_heartbeat(envelope: &Value) -> Value {
    let modules: Vec<Value> = envelope
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let module_index = module_index_of(item)?;
                    let module_id = module_id_of(item)?;
                    let u_total = item.get("u_total").and_then(Value::as_u64);
                    Some(serde_json::json!({
                        "moduleIndex": module_index,
                        "moduleId": module_id,
                        "uTotal": u_total,
                    }))
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(modules)
}

fn inner_array<'a>(module: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| module.get(key)).and_then(Value::as_array)
}

fn build_rfid_snapshot(envelope: &Value) -> Value {
    let empty = Vec::new();
    let modules = envelope.get("data").and_then(Value::as_array).unwrap_or(&empty);
    let groups: Vec<Value> = modules
        .iter()
        .filter_map(|module| {
            let module_index = module_index_of(module)?;
            let module_id = module_id_of(module);
            let slots = inner_array(module, &["data", "u_data"]).cloned().unwrap_or_default();
            let slots: Vec<Value> = slots
                .into_iter()
                .filter(|s| {
                    s.get("tag_code")
                        .and_then(Value::as_str)
                        .map(|t| !t.is_empty())
                        .unwrap_or(false)
                })
                .map(|s| {
                    let slot_index = s.get("slot_index").or_else(|| s.get("index")).cloned();
                    let tag_id = s.get("tag_code").cloned();
                    let alarm = s.get("warning").and_then(Value::as_i64) == Some(1);
                    serde_json::json!({ "slotIndex": slot_index, "tagId": tag_id, "alarm": alarm })
                })
                .collect();
            Some(serde_json::json!({
                "moduleIndex": module_index,
                "moduleId": module_id,
                "slots": slots,
            }))
        })
        .collect();
    Value::Array(groups)
}

fn build_rfid_event(envelope: &Value) -> Value {
    let module_index = module_index_of(envelope);
    let module_id = module_id_of(envelope);
    let slot_index = envelope.get("slot_index").or_else(|| envelope.get("index")).cloned();
    let tag_id = envelope.get("tag_code").cloned();
    let new_state = envelope.get("new_state").and_then(Value::as_i64);
    let old_state = envelope.get("old_state").and_then(Value::as_i64);

    let action = match (new_state, old_state) {
        (Some(1), Some(0)) => "ATTACHED",
        (Some(0), Some(1)) => "DETACHED",
        (Some(1), _) => "ATTACHED",
        _ => "DETACHED",
    };

    serde_json::json!({
        "moduleIndex": module_index,
        "moduleId": module_id,
        "slotIndex": slot_index,
        "tagId": tag_id,
        "action": action,
    })
}

fn build_temp_hum(envelope: &Value) -> Value {
    let empty = Vec::new();
    let modules = envelope.get("data").and_then(Value::as_array).unwrap_or(&empty);
    let groups: Vec<Value> = modules
        .iter()
        .filter_map(|module| {
            let module_index = module_index_of(module)?;
            let module_id = module_id_of(module);
            let records = inner_array(module, &["data", "th_data"]).cloned().unwrap_or_default();
            let records: Vec<Value> = records
                .into_iter()
                .map(|r| {
                    let coerce = |v: Option<&Value>| -> Value {
                        match v.and_then(Value::as_f64) {
                            Some(x) if x != 0.0 => serde_json::json!(x),
                            _ => Value::Null,
                        }
                    };
                    let th_index = r.get("index").or_else(|| r.get("th_index")).cloned();
                    serde_json::json!({
                        "thIndex": th_index,
                        "temp": coerce(r.get("temp")),
                        "hum": coerce(r.get("hum")),
                    })
                })
                .collect();
            Some(serde_json::json!({ "moduleIndex": module_index, "moduleId": module_id, "records": records }))
        })
        .collect();
    Value::Array(groups)
}

fn build_door_state(envelope: &Value) -> Value {
    let module_index = module_index_of(envelope);
    let new_state1 = envelope.get("new_state1").and_then(Value::as_i64);
    let new_state2 = envelope.get("new_state2").and_then(Value::as_i64);

    if new_state1.is_some() || new_state2.is_some() {
        serde_json::json!({
            "moduleIndex": module_index,
            "door1State": new_state1,
            "door2State": new_state2,
        })
    } else {
        let state = envelope.get("new_state").and_then(Value::as_i64);
        serde_json::json!({ "moduleIndex": module_index, "doorState": state })
    }
}

fn build_dev_mod_info(envelope: &Value) -> Value {
    let ip = envelope.get("gateway_ip").cloned();
    let mac = envelope.get("gateway_mac").cloned();
    let empty = Vec::new();
    let modules: Vec<Value> = envelope
        .get("data")
        .and_then(Value::as_array)
        .unwrap_or(&empty)
        .iter()
        .filter_map(|item| {
            let module_index = module_index_of(item)?;
            let module_id = module_id_of(item);
            let u_total = item.get("u_total").and_then(Value::as_u64);
            let fw_ver = item.get("fw_ver").and_then(Value::as_str).map(|s| s.to_string());
            Some(serde_json::json!({
                "moduleIndex": module_index,
                "moduleId": module_id,
                "uTotal": u_total,
                "fwVer": fw_ver,
            }))
        })
        .collect();
    serde_json::json!({ "ip": ip, "mac": mac, "modules": modules })
}

fn build_cmd_resp(envelope: &Value) -> Value {
    serde_json::json!({
        "result": normalize_result(envelope),
        "moduleIndex": module_index_of(envelope),
    })
}

/// Like `build_cmd_resp`, but carries the actual temp/hum readings the
/// gateway reported so the cache can be updated from the response.
fn build_qry_temp_hum_resp(envelope: &Value) -> Value {
    let result = normalize_result(envelope);
    match build_temp_hum(envelope) {
        Value::Array(groups) => Value::Array(
            groups
                .into_iter()
                .map(|mut g| {
                    if let Value::Object(ref mut map) = g {
                        map.insert("result".to_string(), serde_json::json!(result));
                    }
                    g
                })
                .collect(),
        ),
        other => other,
    }
}

/// Like `build_cmd_resp`, but carries the door state the gateway reported
/// so the cache can be updated from the response.
fn build_qry_door_state_resp(envelope: &Value) -> Value {
    let result = normalize_result(envelope);
    let mut door = build_door_state(envelope);
    if let Value::Object(ref mut map) = door {
        map.insert("result".to_string(), serde_json::json!(result));
    }
    door
}
