//! Black-box scenario tests chaining multiple components end to end:
//! wire bytes/JSON in at one boundary, canonical events or egress bytes
//! out at the other. Each test is grounded in one of the middleware's
//! worked examples.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use iot_middleware_rs::bus::EventBus;
use iot_middleware_rs::cache::StateCache;
use iot_middleware_rs::command_translator::{CommandTranslator, Egress};
use iot_middleware_rs::normalizer::Normalizer;
use iot_middleware_rs::parser_b;
use iot_middleware_rs::parser_j;
use iot_middleware_rs::types::{CommandRequest, DeviceType, MessageType};

fn be_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

fn normalizer_harness() -> (Arc<Normalizer>, EventBus, Arc<StateCache>) {
    let bus = EventBus::new();
    let cache = Arc::new(StateCache::new());
    let normalizer = Arc::new(Normalizer::new(cache.clone(), bus.clone(), Duration::from_secs(30)));
    (normalizer, bus, cache)
}

#[tokio::test]
async fn binary_heartbeat_two_modules_populate_topology() {
    // header(1) + 10x(modAddr(1)+modId(4)+uTotal(1)) + messageId(4)
    let mut frame = vec![0xCCu8];
    frame.push(0x01);
    frame.extend(be_u32(100));
    frame.push(6);
    frame.push(0x02);
    frame.extend(be_u32(200));
    frame.push(12);
    for _ in 0..8 {
        frame.extend([0u8; 6]);
    }
    frame.extend(be_u32(1));

    let ifm = parser_b::parse("V5008Upload/DEV1/OpeAck", &frame).expect("heartbeat should parse");
    assert_eq!(ifm.device_id, "DEV1");

    let (normalizer, bus, cache) = normalizer_harness();
    let mut normalized = bus.subscribe_normalized();
    normalizer.dispatch(&ifm);

    let heartbeat_ce = normalized.recv().await.unwrap();
    assert_eq!(heartbeat_ce.message_type, MessageType::Heartbeat);
    assert_eq!(heartbeat_ce.payload.len(), 2);

    let modules = cache.list_modules("DEV1");
    assert_eq!(modules.len(), 2);
    let module_1 = cache.snapshot_module("DEV1", 1).unwrap();
    assert_eq!(module_1.module_id.as_deref(), Some("100"));
    assert_eq!(module_1.u_total, Some(6));
    assert!(module_1.online);
}

#[tokio::test]
async fn binary_temp_hum_negative_temperature_round_trips() {
    // modAddr(1) + modId(4), then one record: addr(1) + tInt/tFrac + hInt/hFrac, then messageId(4)
    let mut frame = vec![0x01u8];
    frame.extend(be_u32(100));
    frame.push(10); // thIndex
    frame.push(0x85); // sign bit set, magnitude 5
    frame.push(0x19); // .25
    frame.push(0x33); // hum 51
    frame.push(0x1B); // .27
    for _ in 0..5 {
        frame.extend([0u8; 5]);
    }
    frame.extend(be_u32(7));

    let ifm = parser_b::parse("V5008Upload/DEV1/TemHum", &frame).expect("temp/hum frame should parse");
    assert_eq!(ifm.message_type, MessageType::TempHum);

    let (normalizer, bus, _cache) = normalizer_harness();
    let mut normalized = bus.subscribe_normalized();
    normalizer.dispatch(&ifm);

    let ce = normalized.recv().await.unwrap();
    assert_eq!(ce.message_type, MessageType::TempHum);
    let reading = &ce.payload[0];
    assert_eq!(reading["sensorIndex"], 10);
    let temp = reading["temp"].as_f64().unwrap();
    assert!((temp - (-5.25)).abs() < 1e-9);
    let hum = reading["hum"].as_f64().unwrap();
    assert!((hum - 51.27).abs() < 1e-9);
}

#[tokio::test]
async fn json_rfid_snapshot_then_diff_emits_attach_and_detach() {
    let (normalizer, bus, _cache) = normalizer_harness();
    let mut normalized = bus.subscribe_normalized();

    let first = json!({
        "msg_type": "u_state_resp",
        "gateway_sn": "dev1",
        "data": [{
            "module_index": 1,
            "module_sn": "m1",
            "data": [{ "slot_index": 1, "tag_code": "AAA" }],
        }],
    });
    let ifm = parser_j::parse_value("V6800Upload/dev1/x", &first).unwrap();
    normalizer.dispatch(&ifm);

    let snapshot_ce = normalized.recv().await.unwrap();
    assert_eq!(snapshot_ce.message_type, MessageType::RfidSnapshot);
    let attach_ce = normalized.recv().await.unwrap();
    assert_eq!(attach_ce.message_type, MessageType::RfidEvent);
    assert_eq!(attach_ce.payload[0]["action"], "ATTACHED");

    let second = json!({
        "msg_type": "u_state_resp",
        "gateway_sn": "dev1",
        "data": [{
            "module_index": 1,
            "module_sn": "m1",
            "data": [{ "slot_index": 1, "tag_code": "BBB" }],
        }],
    });
    let ifm2 = parser_j::parse_value("V6800Upload/dev1/x", &second).unwrap();
    normalizer.dispatch(&ifm2);

    let snapshot_ce_2 = normalized.recv().await.unwrap();
    assert_eq!(snapshot_ce_2.message_type, MessageType::RfidSnapshot);

    // A tag change on the same slot diffs to one detach and one attach.
    let mut saw_detach = false;
    let mut saw_attach = false;
    for _ in 0..2 {
        let ce = normalized.recv().await.unwrap();
        assert_eq!(ce.message_type, MessageType::RfidEvent);
        match ce.payload[0]["action"].as_str().unwrap() {
            "DETACHED" => {
                assert_eq!(ce.payload[0]["tagId"], "AAA");
                saw_detach = true;
            }
            "ATTACHED" => {
                assert_eq!(ce.payload[0]["tagId"], "BBB");
                saw_attach = true;
            }
            other => panic!("unexpected action {other}"),
        }
    }
    assert!(saw_detach && saw_attach);
}

#[tokio::test]
async fn json_rfid_event_triggers_resync_command_without_touching_cache() {
    let (normalizer, bus, cache) = normalizer_harness();
    let mut commands = bus.subscribe_command();

    let envelope = json!({
        "msg_type": "u_state_changed_notify_req",
        "gateway_sn": "dev1",
        "module_index": 1,
        "slot_index": 1,
        "tag_code": "AAA",
        "new_state": 1,
        "old_state": 0,
    });
    let ifm = parser_j::parse_value("V6800Upload/dev1/x", &envelope).unwrap();
    normalizer.dispatch(&ifm);

    let cmd = commands.recv().await.unwrap();
    assert_eq!(cmd.device_id, "dev1");
    assert_eq!(cmd.message_type, MessageType::QryRfidSnapshot);
    assert_eq!(cmd.payload["moduleIndex"], 1);

    // The event itself never touched the cached snapshot.
    assert!(cache.snapshot_module("dev1", 1).unwrap().rfid_snapshot.is_empty());
}

#[tokio::test]
async fn device_info_ip_change_produces_exact_description() {
    // model(2) + fw(4) + ip(4) + mask(4) + gw(4) + mac(6) + messageId(4), header EF 01
    let build_frame = |ip: [u8; 4]| {
        let mut frame = vec![0xEFu8, 0x01];
        frame.extend(5008u16.to_be_bytes());
        frame.extend(be_u32(100));
        frame.extend(ip);
        frame.extend([255, 255, 255, 0]);
        frame.extend([192, 168, 0, 1]);
        frame.extend([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        frame.extend(be_u32(1));
        frame
    };

    let (normalizer, bus, _cache) = normalizer_harness();
    let mut normalized = bus.subscribe_normalized();

    let first = parser_b::parse("V5008Upload/dev1/OpeAck", &build_frame([192, 168, 0, 2])).unwrap();
    normalizer.dispatch(&first);
    let _metadata_ce = normalized.recv().await.unwrap();
    assert_eq!(_metadata_ce.message_type, MessageType::DeviceMetadata);

    let second = parser_b::parse("V5008Upload/dev1/OpeAck", &build_frame([192, 168, 0, 5])).unwrap();
    normalizer.dispatch(&second);
    let _metadata_ce_2 = normalized.recv().await.unwrap();
    let meta_changed = normalized.recv().await.unwrap();

    assert_eq!(meta_changed.message_type, MessageType::MetaChangedEvent);
    assert_eq!(
        meta_changed.payload[0]["description"],
        "Device IP changed from 192.168.0.2 to 192.168.0.5"
    );
}

#[derive(Clone, Default)]
struct RecordingEgress {
    bytes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[async_trait]
impl Egress for RecordingEgress {
    async fn publish_bytes(&self, topic: &str, _qos: u8, payload: Vec<u8>) -> anyhow::Result<()> {
        self.bytes.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
    async fn publish_json(&self, _topic: &str, _qos: u8, _payload: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn command_post_round_trip_produces_exact_egress_bytes() {
    let bus = EventBus::new();
    let egress = RecordingEgress::default();
    let recorded_handle = egress.bytes.clone();
    let translator = CommandTranslator::new(egress, bus.clone());

    let cmd = CommandRequest {
        device_id: "DEV1".into(),
        device_type: DeviceType::B,
        message_type: MessageType::SetColor,
        payload: json!({ "moduleIndex": 1, "sensorIndex": 10, "colorCode": 1 }),
        command_id: Some("cmd_1".into()),
    };
    translator.handle(cmd).await;

    let recorded = recorded_handle.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "V5008Download/DEV1");
    assert_eq!(recorded[0].1, vec![0xE1, 0x01, 0x0A, 0x01]);
}
