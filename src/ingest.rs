//! ==============================================================================
//! ingest.rs - mqtt ingestion bridge
//! ==============================================================================
//!
//! purpose:
//!     owns the broker subscription. every uplink goes through:
//!
//!         parse -> ensure device (best effort) -> store (best effort) -> handoff
//!
//!     none of these steps may stop the listener. a bad payload, a storage
//!     failure or a dead push context only cost that one message.
//!
//! link state machine:
//!
//!     Disconnected ──connect──> Connecting ──ConnAck, SubAck──> Subscribed
//!          ^                        ^                                   │
//!          │                        └──────── link error / backoff ─────┘
//!          └──────────────── shutdown ──────────────────────────────────
//!
//!     rumqttc reconnects on the next poll after an error; we only wait
//!     `reconnect_delay` between polls and re-subscribe on every ConnAck.
//!
//! threading:
//!     the blocking rumqttc Client/Connection pair runs on a dedicated os
//!     thread ("mqtt-listener"). storage calls happen synchronously on that
//!     thread. the only thing crossing into the tokio runtime is the
//!     handoff.rs channel.
//!
//! relationships:
//!     - uses: telemetry.rs, store.rs, handoff.rs
//!     - used by: main.rs (spawn / shutdown), server.rs (LinkStatus for health)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rumqttc::{
    Client, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError, SubAck, SubscribeReasonCode,
};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{ParseError, StorageError};
use crate::handoff::{Delivery, ProcessBridge};
use crate::store::ReadingStore;
use crate::telemetry::{Reading, TelemetryParser};

// how often the listener wakes up to check for shutdown
const POLL_SLICE: Duration = Duration::from_millis(500);

// ==============================================================================
// link status - the one observable piece of listener state
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Subscribed = 2,
}

#[derive(Debug, Clone, Default)]
pub struct LinkStatus(Arc<AtomicU8>);

impl LinkStatus {
    pub fn state(&self) -> LinkState {
        match self.0.load(Ordering::Acquire) {
            1 => LinkState::Connecting,
            2 => LinkState::Subscribed,
            _ => LinkState::Disconnected,
        }
    }

    /// "is the broker link established"
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Subscribed
    }

    fn set(&self, state: LinkState) {
        let prev = self.0.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            debug!(?state, "broker link state");
        }
    }
}

// ==============================================================================
// per-message handling
// ==============================================================================

/// what happened to one inbound message
#[derive(Debug)]
pub enum IngestOutcome {
    Dropped(ParseError),
    Ingested {
        reading: Reading,
        device_registered: bool,
        stored: Result<(), StorageError>,
        delivery: Delivery,
    },
}

pub struct IngestionBridge {
    parser: TelemetryParser,
    store: Arc<dyn ReadingStore>,
    handoff: ProcessBridge,
    link: LinkStatus,
    show_readings: bool,
}

impl IngestionBridge {
    pub fn new(parser: TelemetryParser, store: Arc<dyn ReadingStore>, handoff: ProcessBridge) -> Self {
        Self {
            parser,
            store,
            handoff,
            link: LinkStatus::default(),
            show_readings: true,
        }
    }

    pub fn show_readings(mut self, show: bool) -> Self {
        self.show_readings = show;
        self
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link.clone()
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let reading = match self.parser.parse(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(topic, "dropping uplink: {}", e);
                return IngestOutcome::Dropped(e);
            }
        };

        let device_registered = match self.store.ensure_device(&reading.device_id) {
            Ok(created) => {
                if created {
                    info!(device = %reading.device_id, "auto-registered device");
                }
                created
            }
            Err(e) => {
                warn!(device = %reading.device_id, "ensure_device failed, storing anyway: {}", e);
                false
            }
        };

        let stored = self.store.store_reading(&reading);
        if let Err(e) = &stored {
            error!(device = %reading.device_id, raw = reading.raw_value, "failed to store reading: {}", e);
        }

        // storage and live fan-out are independent outcomes
        let delivery = self.handoff.deliver(reading.clone());

        if self.show_readings {
            info!(
                device = %reading.device_id,
                raw = reading.raw_value,
                pct = reading.moisture_pct,
                stored = stored.is_ok(),
                "uplink ingested"
            );
        } else {
            debug!(device = %reading.device_id, raw = reading.raw_value, "uplink ingested");
        }

        IngestOutcome::Ingested {
            reading,
            device_registered,
            stored,
            delivery,
        }
    }

    /// starts the listener thread. the returned handle stops it.
    pub fn spawn(self, mqtt: &MqttConfig) -> std::io::Result<ListenerHandle> {
        let mut options = MqttOptions::new(&mqtt.client_id, &mqtt.broker, mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_seconds.max(5)));
        if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
            options.set_credentials(user, pass);
        }

        let (client, connection) = Client::new(options, 16);
        let stop = Arc::new(AtomicBool::new(false));
        let topic = mqtt.topic.clone();
        let reconnect_delay = Duration::from_secs(mqtt.reconnect_delay_seconds);
        info!(broker = %mqtt.broker, port = mqtt.port, topic = %topic, "starting mqtt listener");
        self.link.set(LinkState::Connecting);

        let thread = {
            let client = client.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("mqtt-listener".into())
                .spawn(move || self.run(client, connection, &topic, reconnect_delay, &stop))?
        };

        Ok(ListenerHandle {
            stop,
            client,
            thread: Some(thread),
        })
    }

    fn run(
        &self,
        client: Client,
        mut connection: Connection,
        topic: &str,
        reconnect_delay: Duration,
        stop: &AtomicBool,
    ) {
        while !stop.load(Ordering::Acquire) {
            match connection.recv_timeout(POLL_SLICE) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    info!(code = ?ack.code, "mqtt connected");
                    // try_ variant: this thread also drives the event loop
                    self.link.set(LinkState::Connecting);
                    match client.try_subscribe(topic, QoS::AtLeastOnce) {
                        Ok(()) => debug!(topic, "subscribe requested"),
                        Err(e) => error!(topic, "subscribe request failed: {}", e),
                    }
                }
                Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) => self.on_suback(topic, &ack),
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "uplink received");
                    self.handle_message(&publish.topic, &publish.payload);
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("broker sent disconnect");
                    self.link.set(LinkState::Connecting);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("mqtt link error: {}, retrying in {:?}", e, reconnect_delay);
                    self.link.set(LinkState::Connecting);
                    std::thread::sleep(reconnect_delay);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("mqtt request channel closed");
                    break;
                }
            }
        }

        self.link.set(LinkState::Disconnected);
        info!("mqtt listener stopped");
    }

    /// the link only counts as established once the broker grants the subscription
    fn on_suback(&self, topic: &str, ack: &SubAck) {
        let granted = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Success(_)));
        if granted {
            info!(topic, "subscribed");
            self.link.set(LinkState::Subscribed);
        } else {
            error!(topic, codes = ?ack.return_codes, "broker refused subscription");
            self.link.set(LinkState::Connecting);
        }
    }
}

/// owner of the listener thread
pub struct ListenerHandle {
    stop: Arc<AtomicBool>,
    client: Client,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// blocking: call from a blocking context (spawn_blocking) inside tokio
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            debug!("disconnect request not sent: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("mqtt listener thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::push::{Authenticator, ConnectionRegistry, PushFrame};
    use crate::store::{Device, SqliteStore};
    use serde_json::json;
    use tokio::sync::mpsc;

    const TOPIC: &str = "application/soilmoisture/device/f0a1/rx";

    fn parser() -> TelemetryParser {
        TelemetryParser::new(Calibration::new(12364.0, 10656.0).unwrap())
    }

    /// store whose writes always fail
    struct FailingStore;

    impl ReadingStore for FailingStore {
        fn ensure_device(&self, _: &str) -> Result<bool, StorageError> {
            Err(StorageError("device table locked".into()))
        }
        fn store_reading(&self, _: &Reading) -> Result<(), StorageError> {
            Err(StorageError("disk full".into()))
        }
        fn check(&self) -> Result<(), StorageError> {
            Err(StorageError("down".into()))
        }
        fn devices(&self) -> Result<Vec<Device>, StorageError> {
            Ok(Vec::new())
        }
        fn latest(&self, _: &str) -> Result<Option<Reading>, StorageError> {
            Ok(None)
        }
        fn recent(&self, _: &str, _: usize) -> Result<Vec<Reading>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn malformed_message_is_dropped_and_next_one_still_ingested() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (handoff, mut rx) = ProcessBridge::channel(8);
        let bridge = IngestionBridge::new(parser(), store.clone(), handoff);

        assert!(matches!(
            bridge.handle_message(TOPIC, b"{not json"),
            IngestOutcome::Dropped(ParseError::NotStructured(_))
        ));
        assert!(matches!(
            bridge.handle_message(TOPIC, br#"{"raw_value": 1}"#),
            IngestOutcome::Dropped(ParseError::MissingDeviceId)
        ));

        let payload = json!({"devEUI": "f0a1", "raw_value": 11656}).to_string();
        match bridge.handle_message(TOPIC, payload.as_bytes()) {
            IngestOutcome::Ingested {
                device_registered,
                stored,
                delivery,
                ..
            } => {
                assert!(device_registered);
                assert!(stored.is_ok());
                assert_eq!(delivery, Delivery::Scheduled);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(store.devices().unwrap().len(), 1);
        assert_eq!(store.latest("f0a1").unwrap().map(|r| r.raw_value), Some(11656));
        assert_eq!(rx.try_recv().unwrap().raw_value, 11656);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_message_from_same_device_does_not_reregister() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (handoff, _rx) = ProcessBridge::channel(8);
        let bridge = IngestionBridge::new(parser(), store, handoff);
        let payload = json!({"devEUI": "f0a1", "data": "LYg="}).to_string();

        let registered: Vec<bool> = (0..2)
            .map(|_| match bridge.handle_message(TOPIC, payload.as_bytes()) {
                IngestOutcome::Ingested { device_registered, .. } => device_registered,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(registered, vec![true, false]);
    }

    #[test]
    fn storage_failure_still_reaches_live_viewers() {
        let (handoff, mut rx) = ProcessBridge::channel(8);
        let bridge = IngestionBridge::new(parser(), Arc::new(FailingStore), handoff);

        let payload = json!({"devEUI": "f0a1", "raw_value": 11000}).to_string();
        match bridge.handle_message(TOPIC, payload.as_bytes()) {
            IngestOutcome::Ingested { stored, delivery, .. } => {
                assert_eq!(stored, Err(StorageError("disk full".into())));
                assert_eq!(delivery, Delivery::Scheduled);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap().raw_value, 11000);
    }

    #[test]
    fn dead_push_context_does_not_stop_ingestion() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (handoff, rx) = ProcessBridge::channel(8);
        drop(rx);
        let bridge = IngestionBridge::new(parser(), store.clone(), handoff);

        for raw in [11000, 11100] {
            let payload = json!({"devEUI": "f0a1", "raw_value": raw}).to_string();
            match bridge.handle_message(TOPIC, payload.as_bytes()) {
                IngestOutcome::Ingested { delivery, stored, .. } => {
                    assert_eq!(delivery, Delivery::DroppedNotRunning);
                    assert!(stored.is_ok());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(store.recent("f0a1", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn end_to_end_uplink_reaches_viewer_calibrated() {
        let registry = Arc::new(ConnectionRegistry::new(
            Authenticator::SharedSecret("key".into()),
            Duration::from_millis(500),
        ));
        let (viewer_tx, mut viewer_rx) = mpsc::channel(4);
        registry.register(["key"], viewer_tx).unwrap();

        let (handoff, rx) = ProcessBridge::channel(8);
        let pump = crate::handoff::spawn_pump(registry.clone(), rx);
        let bridge = IngestionBridge::new(parser(), Arc::new(SqliteStore::open_in_memory().unwrap()), handoff);

        // listener context is its own thread
        std::thread::spawn(move || {
            let payload = json!({"devEUI": "f0a1", "raw_value": 11656, "timestamp": 1_764_288_000});
            bridge.handle_message(TOPIC, payload.to_string().as_bytes());
        })
        .join()
        .unwrap();

        let frame: PushFrame = serde_json::from_str(&viewer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.dev_eui, "f0a1");
        assert_eq!(frame.raw_value, 11656);
        assert_eq!(frame.timestamp, 1_764_288_000);
        assert!((frame.moisture_pct - 41.45).abs() < 0.01);

        pump.await.unwrap();
    }

    #[test]
    fn link_is_established_only_after_a_granted_suback() {
        let (handoff, _rx) = ProcessBridge::channel(1);
        let bridge = IngestionBridge::new(parser(), Arc::new(SqliteStore::open_in_memory().unwrap()), handoff);
        let link = bridge.link_status();
        link.set(LinkState::Connecting);

        bridge.on_suback(TOPIC, &SubAck::new(1, vec![SubscribeReasonCode::Failure]));
        assert_eq!(link.state(), LinkState::Connecting);
        assert!(!link.is_connected());

        bridge.on_suback(
            TOPIC,
            &SubAck::new(2, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]),
        );
        assert!(link.is_connected());
    }

    #[test]
    fn link_status_starts_disconnected() {
        let status = LinkStatus::default();
        assert_eq!(status.state(), LinkState::Disconnected);
        assert!(!status.is_connected());
        status.set(LinkState::Subscribed);
        assert!(status.clone().is_connected());
    }
}
