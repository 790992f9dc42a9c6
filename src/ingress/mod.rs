//! Ingress adapter — the transport boundary between the MQTT broker and
//! the Event Bus.
//!
//! A single `rumqttc::EventLoop` is polled on a dedicated task (the
//! pattern the teacher's `reader` component uses for its CAEN digitizer
//! poll loop, generalized to an MQTT connection). Incoming publishes are
//! hashed by deviceId (`xxhash-rust`) into one of `N` worker lanes, each
//! with its own bounded `mpsc` inbox, so frames for a single device are
//! always processed in arrival order while distinct devices parse
//! concurrently.
//!
//! Backpressure policy: telemetry frames are never dropped — a full lane
//! inbox applies backpressure to the poll loop via `send().await`.
//! Heartbeats are the one frame class allowed to be shed under overload
//! (a missed heartbeat just costs one watchdog cycle); a full inbox on a
//! heartbeat frame is reported on the bus's error channel instead of
//! blocking.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};
use xxhash_rust::xxh64::xxh64;

use crate::bus::{EventBus, IngressRaw};
use crate::common::AtomicCounters;
use crate::config::MqttConfig;
use crate::parser_b;
use crate::parser_j;

const COMPONENT: &str = "Ingress";
const LANE_COUNT: usize = 8;
const LANE_INBOX_CAPACITY: usize = 512;
const XXHASH_SEED: u64 = 0;

struct LaneMessage {
    topic: String,
    payload: Bytes,
}

pub struct IngressAdapter {
    bus: EventBus,
    config: MqttConfig,
    counters: Arc<AtomicCounters>,
}

impl IngressAdapter {
    pub fn new(bus: EventBus, config: MqttConfig) -> Self {
        Self { bus, config, counters: Arc::new(AtomicCounters::new()) }
    }

    /// Shared with the composition root for a periodic stats summary;
    /// the same counters the poll loop below increments.
    pub fn counters(&self) -> Arc<AtomicCounters> {
        self.counters.clone()
    }

    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        let mut options = MqttOptions::new(
            self.config.options.client_id.clone(),
            broker_host(&self.config.broker_url),
            broker_port(&self.config.broker_url),
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_connection_timeout(self.config.options.connect_timeout / 1000);

        let (client, mut eventloop) = AsyncClient::new(options, LANE_INBOX_CAPACITY);

        if let Err(e) = client.subscribe(self.config.topics.v5008.clone(), QoS::AtLeastOnce).await {
            self.bus.publish_error(COMPONENT, format!("subscribe {} failed: {e}", self.config.topics.v5008));
        }
        if let Err(e) = client.subscribe(self.config.topics.v6800.clone(), QoS::AtLeastOnce).await {
            self.bus.publish_error(COMPONENT, format!("subscribe {} failed: {e}", self.config.topics.v6800));
        }

        let lanes = spawn_lanes(self.bus.clone(), LANE_COUNT);
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                poll = eventloop.poll() => {
                    match poll {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.counters.inc_received();
                            self.counters.add_bytes(publish.payload.len() as u64);
                            self.bus.publish_ingress_raw(IngressRaw {
                                topic: publish.topic.clone(),
                                payload: publish.payload.clone(),
                                received_at: chrono::Utc::now(),
                            });
                            route_to_lane(&lanes, publish.topic, publish.payload, &self.bus, &self.counters).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.bus.publish_error(COMPONENT, format!("mqtt connection error: {e}"));
                            tokio::time::sleep(Duration::from_millis(self.config.options.reconnect_period)).await;
                        }
                    }
                }
            }
        }
    }
}

fn broker_host(url: &str) -> String {
    url.split("://").last().unwrap_or(url).split(':').next().unwrap_or(url).to_string()
}

fn broker_port(url: &str) -> u16 {
    url.split("://")
        .last()
        .unwrap_or(url)
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1883)
}

fn device_id_from_topic(topic: &str) -> Option<&str> {
    topic.split('/').nth(1)
}

fn lane_for(device_id: &str, lane_count: usize) -> usize {
    (xxh64(device_id.as_bytes(), XXHASH_SEED) as usize) % lane_count
}

fn is_heartbeat_topic(topic: &str, payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] == 0xCC || payload[0] == 0xCB) && topic.starts_with("V5008Upload")
}

fn spawn_lanes(bus: EventBus, lane_count: usize) -> Vec<mpsc::Sender<LaneMessage>> {
    let mut senders = Vec::with_capacity(lane_count);
    for lane_index in 0..lane_count {
        let (tx, mut rx) = mpsc::channel::<LaneMessage>(LANE_INBOX_CAPACITY);
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                debug!(lane = lane_index, topic = %msg.topic, "ingress lane processing frame");
                dispatch(&bus, &msg.topic, &msg.payload);
            }
        });
        senders.push(tx);
    }
    senders
}

fn dispatch(bus: &EventBus, topic: &str, payload: &[u8]) {
    let ifm = if topic.starts_with("V5008Upload") {
        match parser_b::parse(topic, payload) {
            Ok(ifm) => Some(ifm),
            Err(e) => {
                bus.publish_error(COMPONENT, format!("failed to decode frame on {topic}: {e}"));
                None
            }
        }
    } else if topic.starts_with("V6800Upload") {
        match std::str::from_utf8(payload) {
            Ok(text) => parser_j::parse(topic, text),
            Err(e) => {
                bus.publish_error(COMPONENT, format!("non-utf8 payload on {topic}: {e}"));
                None
            }
        }
    } else {
        bus.publish_error(COMPONENT, format!("unrecognized topic prefix: {topic}"));
        None
    };

    if let Some(ifm) = ifm {
        bus.publish_parsed(ifm);
    }
}

async fn route_to_lane(
    lanes: &[mpsc::Sender<LaneMessage>],
    topic: String,
    payload: Bytes,
    bus: &EventBus,
    counters: &AtomicCounters,
) {
    let Some(device_id) = device_id_from_topic(&topic) else {
        bus.publish_error(COMPONENT, format!("cannot extract deviceId from topic: {topic}"));
        return;
    };
    let lane = lane_for(device_id, lanes.len());
    let sender = &lanes[lane];

    if is_heartbeat_topic(&topic, &payload) {
        if sender.try_send(LaneMessage { topic: topic.clone(), payload }).is_err() {
            counters.inc_dropped();
            warn!(%topic, "dropping heartbeat frame under backpressure");
            bus.publish_error(COMPONENT, format!("heartbeat frame dropped for lane overload: {topic}"));
        } else {
            counters.inc_processed();
        }
        return;
    }

    if sender.send(LaneMessage { topic: topic.clone(), payload }).await.is_err() {
        counters.inc_dropped();
        error!(%topic, "ingress lane closed unexpectedly");
        bus.publish_error(COMPONENT, format!("ingress lane closed: {topic}"));
    } else {
        counters.inc_processed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_hashing_is_deterministic() {
        assert_eq!(lane_for("dev1", 8), lane_for("dev1", 8));
    }

    #[test]
    fn lane_hashing_spreads_across_lanes() {
        let lanes: std::collections::HashSet<usize> = (0..100)
            .map(|n| lane_for(&format!("dev{n}"), 8))
            .collect();
        assert!(lanes.len() > 1);
    }

    #[test]
    fn device_id_extracted_from_topic_segment() {
        assert_eq!(device_id_from_topic("V5008Upload/ABC123/Heartbeat"), Some("ABC123"));
        assert_eq!(device_id_from_topic("V6800Upload/XYZ"), Some("XYZ"));
    }

    #[test]
    fn broker_host_and_port_parsed_from_url() {
        assert_eq!(broker_host("tcp://localhost:1883"), "localhost");
        assert_eq!(broker_port("tcp://localhost:1883"), 1883);
    }

    #[test]
    fn heartbeat_topic_detection_matches_known_headers() {
        assert!(is_heartbeat_topic("V5008Upload/X/Status", &[0xCC, 0x00]));
        assert!(is_heartbeat_topic("V5008Upload/X/Status", &[0xCB, 0x00]));
        assert!(!is_heartbeat_topic("V5008Upload/X/TemHum", &[0xBB, 0x00]));
    }

    #[tokio::test]
    async fn dispatch_publishes_parsed_if_on_bus() {
        let bus = EventBus::new();
        let mut parsed = bus.subscribe_parsed();

        let payload = serde_json::json!({
            "msg_type": "heartbeat",
            "gateway_sn": "GW1",
        })
        .to_string();
        dispatch(&bus, "V6800Upload/GW1/Status", payload.as_bytes());

        let ifm = parsed.try_recv();
        assert!(ifm.is_ok());
    }
}
