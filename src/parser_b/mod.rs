//! Parser B (C3) — decodes length-implicit binary frames for Family-B
//! devices into the intermediate form.
//!
//! Structured the way the teacher's `psd2` decoder is: a `constants`
//! submodule of named offsets so the schema table in the design doc
//! reads directly off the field accesses below, a `classify` step that
//! is a pure function of `(topic, bytes)`, and decode functions that
//! return `None` on any bounds or shape failure instead of panicking.

pub(crate) mod constants;

use constants::*;
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{DeviceType, IfMeta, IntermediateForm, MessageType};

#[derive(Debug, Error)]
pub enum ParserBError {
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unrecognized frame shape")]
    Unrecognized,
}

/// Precedence-ordered dispatch (design §4.3, level 1-5). Topic suffix
/// wins over byte signature, which is why this takes the topic first.
fn classify(topic: &str, bytes: &[u8]) -> MessageType {
    if topic.ends_with("/LabelState") {
        return MessageType::RfidSnapshot;
    }
    if topic.ends_with("/TemHum") {
        return MessageType::TempHum;
    }
    if topic.ends_with("/Noise") {
        return MessageType::NoiseLevel;
    }

    let Some(&b0) = bytes.first() else {
        return MessageType::Unknown;
    };

    match b0 {
        HEADER_DOOR_STATE => return MessageType::DoorState,
        HEADER_HEARTBEAT_CC | HEADER_HEARTBEAT_CB => return MessageType::Heartbeat,
        HEADER_RFID_SNAPSHOT => return MessageType::RfidSnapshot,
        _ => {}
    }

    if bytes.len() >= 2 {
        match (bytes[0], bytes[1]) {
            (HEADER_DEVICE_INFO_0, HEADER_DEVICE_INFO_1) => return MessageType::DeviceInfo,
            (HEADER_MODULE_INFO_0, HEADER_MODULE_INFO_1) => return MessageType::ModuleInfo,
            _ => {}
        }
    }

    if b0 == HEADER_CMD_RESP && bytes.len() > CMD_RESP_SUBTYPE_OFFSET {
        return match bytes[CMD_RESP_SUBTYPE_OFFSET] {
            CMD_SUBTYPE_QRY_CLR => MessageType::QryClrResp,
            CMD_SUBTYPE_SET_CLR => MessageType::SetClrResp,
            CMD_SUBTYPE_CLN_ALM => MessageType::ClnAlmResp,
            _ => MessageType::Unknown,
        };
    }

    MessageType::Unknown
}

/// SIG-A: combine a signed integer byte and a hundredths fractional
/// byte into a float, with the shared `(0x00, 0x00)` sentinel mapping
/// to null.
fn decode_sig_a(int_byte: u8, frac_byte: u8) -> Option<f64> {
    if int_byte == 0 && frac_byte == 0 {
        return None;
    }
    let negative = int_byte & 0x80 != 0;
    let magnitude_int = if negative {
        // Two's complement over a single byte's 7 magnitude bits.
        (!int_byte).wrapping_add(1) & 0x7F
    } else {
        int_byte
    };
    let magnitude = magnitude_int as f64 + (frac_byte as f64) / 100.0;
    let value = if negative { -magnitude } else { magnitude };
    Some((value * 100.0).round() / 100.0)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn message_id_from_tail(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 4 {
        return None;
    }
    let tail = &bytes[bytes.len() - 4..];
    Some(be_u32(tail).to_string())
}

fn format_ip(bytes: &[u8]) -> String {
    format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a Family-B binary frame. Never panics; returns `Err` on any
/// decode failure (truncated frame or unrecognized shape), as the
/// parsers-never-raise invariant requires — the caller logs it to the
/// `error` bus channel rather than propagating a panic.
pub fn parse(topic: &str, bytes: &[u8]) -> Result<IntermediateForm, ParserBError> {
    let device_id = extract_device_id_from_topic(topic).ok_or(ParserBError::Unrecognized)?;
    let message_type = classify(topic, bytes);

    let data = match message_type {
        MessageType::Heartbeat => decode_heartbeat(bytes)?,
        MessageType::RfidSnapshot => decode_rfid_snapshot(bytes)?,
        MessageType::TempHum => decode_temp_hum(bytes)?,
        MessageType::NoiseLevel => decode_noise_level(bytes)?,
        MessageType::DoorState => decode_door_state(bytes)?,
        MessageType::DeviceInfo => decode_device_info(bytes)?,
        MessageType::ModuleInfo => decode_module_info(bytes)?,
        MessageType::QryClrResp | MessageType::SetClrResp | MessageType::ClnAlmResp => {
            decode_cmd_resp(bytes)?
        }
        MessageType::Unknown => (json!({ "raw": hex::encode(bytes) }), None),
    };

    let (payload, message_id) = data;
    let mut ifm = IntermediateForm::new(DeviceType::B, device_id, message_type, topic, payload);
    ifm.meta = IfMeta { topic: topic.to_string(), raw: None };
    if let Some(mid) = message_id {
        ifm = ifm.with_message_id(mid);
    }
    Ok(ifm)
}

/// `V5008Upload/{deviceId}/...` — device id is the first topic segment
/// after the family prefix.
fn extract_device_id_from_topic(topic: &str) -> Option<String> {
    topic.split('/').nth(1).map(|s| s.to_string())
}

type Decoded = (Value, Option<String>);

fn decode_heartbeat(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const SLOT_SIZE: usize = 6; // modAddr(1) + modId(4) + uTotal(1)
    const SLOT_COUNT: usize = 10;
    let need = 1 + SLOT_SIZE * SLOT_COUNT + 4;
    if bytes.len() < need {
        return Err(ParserBError::TooShort { need, got: bytes.len() });
    }

    let mut modules = Vec::new();
    let mut offset = 1;
    for _ in 0..SLOT_COUNT {
        let mod_addr = bytes[offset];
        let mod_id = be_u32(&bytes[offset + 1..offset + 5]);
        let u_total = bytes[offset + 5];
        if mod_id != 0 && mod_addr <= 5 {
            modules.push(json!({
                "moduleIndex": mod_addr,
                "moduleId": mod_id.to_string(),
                "uTotal": u_total,
            }));
        }
        offset += SLOT_SIZE;
    }

    let message_id = message_id_from_tail(bytes);
    Ok((Value::Array(modules), message_id))
}

fn decode_rfid_snapshot(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    // header(1) + modAddr(1) + modId(4) + reserved(1) + uTotal(1) + count(1)
    const FIXED: usize = 9;
    if bytes.len() < FIXED + 4 {
        return Err(ParserBError::TooShort { need: FIXED + 4, got: bytes.len() });
    }
    let mod_addr = bytes[1];
    let mod_id = be_u32(&bytes[2..6]);
    let u_total = bytes[7];
    let count = bytes[8] as usize;

    let need = FIXED + count * 6 + 4;
    if bytes.len() < need {
        return Err(ParserBError::TooShort { need, got: bytes.len() });
    }

    let mut slots = Vec::with_capacity(count);
    let mut offset = FIXED;
    for _ in 0..count {
        let slot_index = bytes[offset];
        let alarm = bytes[offset + 1] == 0x01;
        let tag_id = be_u32(&bytes[offset + 2..offset + 6]);
        slots.push(json!({
            "slotIndex": slot_index,
            "alarm": alarm,
            "tagId": tag_id.to_string(),
        }));
        offset += 6;
    }

    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({
            "moduleIndex": mod_addr,
            "moduleId": mod_id.to_string(),
            "uTotal": u_total,
            "slots": slots,
        }),
        message_id,
    ))
}

fn decode_temp_hum(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const RECORD_SIZE: usize = 5; // addr(1) + tInt(1) + tFrac(1) + hInt(1) + hFrac(1)
    const RECORD_COUNT: usize = 6;
    const FIXED: usize = 5; // modAddr(1) + modId(4)
    let need = FIXED + RECORD_SIZE * RECORD_COUNT + 4;
    if bytes.len() < need {
        return Err(ParserBError::TooShort { need, got: bytes.len() });
    }

    let mod_addr = bytes[0];
    let mod_id = be_u32(&bytes[1..5]);

    let mut records = Vec::new();
    let mut offset = FIXED;
    for _ in 0..RECORD_COUNT {
        let addr = bytes[offset];
        if addr != 0 {
            let temp = decode_sig_a(bytes[offset + 1], bytes[offset + 2]);
            let hum = decode_sig_a(bytes[offset + 3], bytes[offset + 4]);
            records.push(json!({ "thIndex": addr, "temp": temp, "hum": hum }));
        }
        offset += RECORD_SIZE;
    }

    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({ "moduleIndex": mod_addr, "moduleId": mod_id.to_string(), "records": records }),
        message_id,
    ))
}

fn decode_noise_level(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const RECORD_SIZE: usize = 3; // addr(1) + nInt(1) + nFrac(1)
    const RECORD_COUNT: usize = 3;
    const FIXED: usize = 5;
    let need = FIXED + RECORD_SIZE * RECORD_COUNT + 4;
    if bytes.len() < need {
        return Err(ParserBError::TooShort { need, got: bytes.len() });
    }

    let mod_addr = bytes[0];
    let mod_id = be_u32(&bytes[1..5]);

    let mut records = Vec::new();
    let mut offset = FIXED;
    for _ in 0..RECORD_COUNT {
        let addr = bytes[offset];
        if addr != 0 {
            let noise = decode_sig_a(bytes[offset + 1], bytes[offset + 2]);
            records.push(json!({ "nsIndex": addr, "noise": noise }));
        }
        offset += RECORD_SIZE;
    }

    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({ "moduleIndex": mod_addr, "moduleId": mod_id.to_string(), "records": records }),
        message_id,
    ))
}

fn decode_door_state(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const NEED: usize = 1 + 1 + 4 + 1 + 4;
    if bytes.len() < NEED {
        return Err(ParserBError::TooShort { need: NEED, got: bytes.len() });
    }
    let mod_addr = bytes[1];
    let mod_id = be_u32(&bytes[2..6]);
    let state = bytes[6];
    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({ "moduleIndex": mod_addr, "moduleId": mod_id.to_string(), "state": state }),
        message_id,
    ))
}

fn decode_device_info(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const NEED: usize = 2 + 2 + 4 + 4 + 4 + 4 + 6 + 4;
    if bytes.len() < NEED {
        return Err(ParserBError::TooShort { need: NEED, got: bytes.len() });
    }
    let model = u16::from_be_bytes([bytes[2], bytes[3]]);
    let fw = be_u32(&bytes[4..8]);
    let ip = format_ip(&bytes[8..12]);
    let mask = format_ip(&bytes[12..16]);
    let gw = format_ip(&bytes[16..20]);
    let mac = format_mac(&bytes[20..26]);
    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({
            "model": model.to_string(),
            "fwVer": fw.to_string(),
            "ip": ip,
            "mask": mask,
            "gateway": gw,
            "mac": mac,
        }),
        message_id,
    ))
}

fn decode_module_info(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    const HEADER: usize = 2;
    const RECORD_SIZE: usize = 5; // modAddr(1) + fw(4)
    const TAIL: usize = 4;
    if bytes.len() < HEADER + TAIL {
        return Err(ParserBError::TooShort { need: HEADER + TAIL, got: bytes.len() });
    }
    let record_area = bytes.len() - HEADER - TAIL;
    if record_area % RECORD_SIZE != 0 {
        return Err(ParserBError::Unrecognized);
    }
    let count = record_area / RECORD_SIZE;

    let mut modules = Vec::with_capacity(count);
    let mut offset = HEADER;
    for _ in 0..count {
        let mod_addr = bytes[offset];
        let fw = be_u32(&bytes[offset + 1..offset + 5]);
        modules.push(json!({ "moduleIndex": mod_addr, "fwVer": fw.to_string() }));
        offset += RECORD_SIZE;
    }

    let message_id = message_id_from_tail(bytes);
    Ok((Value::Array(modules), message_id))
}

fn decode_cmd_resp(bytes: &[u8]) -> Result<Decoded, ParserBError> {
    // header(1) + deviceId(4) + result(1) + originalReq(var) + messageId(4)
    const HEAD: usize = 1 + 4 + 1;
    const TAIL: usize = 4;
    if bytes.len() < HEAD + TAIL {
        return Err(ParserBError::TooShort { need: HEAD + TAIL, got: bytes.len() });
    }
    let result_byte = bytes[5];
    let result = if result_byte == 0xA1 { "Success" } else { "Failure" };

    let original_req_len = if bytes.get(CMD_RESP_SUBTYPE_OFFSET) == Some(&CMD_SUBTYPE_QRY_CLR) {
        2
    } else {
        bytes
            .len()
            .checked_sub(HEAD + TAIL)
            .ok_or(ParserBError::TooShort { need: HEAD + TAIL, got: bytes.len() })?
    };
    if bytes.len() < HEAD + original_req_len + TAIL {
        return Err(ParserBError::TooShort { need: HEAD + original_req_len + TAIL, got: bytes.len() });
    }
    let original_req = &bytes[HEAD..HEAD + original_req_len];
    let module_index = original_req.get(1).copied();

    let message_id = message_id_from_tail(bytes);
    Ok((
        json!({ "result": result, "moduleIndex": module_index }),
        message_id,
    ))
}

/// Minimal hex encoding helper for the `UNKNOWN` fallback payload; kept
/// local rather than pulling in a crate for a debug-only code path.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_a_shared_zero_sentinel_is_null() {
        assert_eq!(decode_sig_a(0x00, 0x00), None);
    }

    #[test]
    fn sig_a_negative_temperature() {
        // addr=10, tInt=0x85 (sign bit set, magnitude 5), tFrac=0x19 (25)
        let temp = decode_sig_a(0x85, 0x19).unwrap();
        assert!((temp - (-5.25)).abs() < 1e-9);
    }

    #[test]
    fn sig_a_positive_value() {
        let hum = decode_sig_a(0x33, 0x1B).unwrap();
        assert!((hum - 51.27).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_all_zero_slots_yields_empty_not_null() {
        let mut bytes = vec![0xCCu8, 0x01];
        bytes.extend([0u8; 5]); // rest of first slot (modId(4)+uTotal(1))
        for _ in 0..9 {
            bytes.extend([0u8; 6]);
        }
        bytes.extend([0u8, 0u8, 0u8, 1u8]); // messageId
        let ifm = parse("V5008Upload/dev1/OpeAck", &bytes).expect("should parse");
        assert_eq!(ifm.data, Value::Array(vec![]));
    }

    #[test]
    fn heartbeat_two_modules_scenario() {
        // header(1) + 10x(modAddr+modId(4)+uTotal) + messageId(4)
        let mut bytes = vec![0xCCu8];
        // module 1: addr=01, modId=3963041727 (0xEC3737BF), uTotal=06
        bytes.push(0x01);
        bytes.extend(3963041727u32.to_be_bytes());
        bytes.push(0x06);
        // module 2: addr=02, modId=2349402517 (0x8C09099... wait compute)
        bytes.push(0x02);
        bytes.extend(2349402517u32.to_be_bytes());
        bytes.push(0x0C);
        for _ in 0..8 {
            bytes.extend([0u8; 6]);
        }
        bytes.extend(4060092047u32.to_be_bytes());

        let ifm = parse("V5008Upload/2437871205/OpeAck", &bytes).unwrap();
        assert_eq!(ifm.message_id.as_deref(), Some("4060092047"));
        let arr = ifm.data.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["moduleIndex"], 1);
        assert_eq!(arr[0]["moduleId"], "3963041727");
        assert_eq!(arr[0]["uTotal"], 6);
        assert_eq!(arr[1]["moduleIndex"], 2);
    }

    #[test]
    fn classify_by_topic_suffix_wins_over_byte_signature() {
        // Byte 0 would classify as heartbeat, but topic suffix takes precedence.
        assert_eq!(classify("V5008Upload/dev1/LabelState", &[0xCC]), MessageType::RfidSnapshot);
    }

    #[test]
    fn truncated_frame_returns_err() {
        assert!(decode_heartbeat(&[0xCC, 0x01]).is_err());
    }

    #[test]
    fn door_state_decodes_fields() {
        let mut bytes = vec![0xBAu8, 0x01];
        bytes.extend(100u32.to_be_bytes());
        bytes.push(1);
        bytes.extend(42u32.to_be_bytes());
        let ifm = parse("V5008Upload/dev1/OpeAck", &bytes).unwrap();
        assert_eq!(ifm.message_type, MessageType::DoorState);
        assert_eq!(ifm.data["state"], 1);
    }
}
