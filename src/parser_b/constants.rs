//! Named byte offsets and signature bytes for the Family-B binary
//! framing, kept in one place so `mod.rs`'s decode functions read as a
//! transcription of the wire schema rather than a wall of magic numbers.

/// Byte 0 == 0xBA -> DOOR_STATE (dispatch precedence level 2).
pub const HEADER_DOOR_STATE: u8 = 0xBA;
/// Byte 0 == 0xCC -> HEARTBEAT.
pub const HEADER_HEARTBEAT_CC: u8 = 0xCC;
/// Byte 0 == 0xCB -> HEARTBEAT (alternate header byte).
pub const HEADER_HEARTBEAT_CB: u8 = 0xCB;
/// Byte 0 == 0xBB -> RFID_SNAPSHOT (byte-signature fallback; topic
/// suffix `/LabelState` takes precedence when present).
pub const HEADER_RFID_SNAPSHOT: u8 = 0xBB;

/// Bytes 0..1 == 0xEF 0x01 -> DEVICE_INFO (dispatch precedence level 3).
pub const HEADER_DEVICE_INFO_0: u8 = 0xEF;
pub const HEADER_DEVICE_INFO_1: u8 = 0x01;
/// Bytes 0..1 == 0xEF 0x02 -> MODULE_INFO.
pub const HEADER_MODULE_INFO_0: u8 = 0xEF;
pub const HEADER_MODULE_INFO_1: u8 = 0x02;

/// Byte 0 == 0xAA marks a command-response frame (dispatch precedence
/// level 4); byte 6 then selects the specific response subtype.
pub const HEADER_CMD_RESP: u8 = 0xAA;
pub const CMD_RESP_SUBTYPE_OFFSET: usize = 6;
pub const CMD_SUBTYPE_QRY_CLR: u8 = 0xE4;
pub const CMD_SUBTYPE_SET_CLR: u8 = 0xE1;
pub const CMD_SUBTYPE_CLN_ALM: u8 = 0xE2;

/// Command translator (C7) opcodes, egress side. Kept alongside the
/// ingress constants since they are the same wire vocabulary read in
/// the opposite direction.
pub const OPCODE_QRY_RFID_SNAPSHOT: u8 = 0xE9;
pub const OPCODE_SET_COLOR: u8 = 0xE1;
pub const OPCODE_CLEAN_ALARM: u8 = 0xE2;
pub const OPCODE_QRY_DEVICE_INFO: (u8, u8) = (0xEF, 0x01);
pub const OPCODE_QRY_MODULE_INFO: (u8, u8) = (0xEF, 0x02);
