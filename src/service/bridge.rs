use crate::domain::{Measurement, Reading};
use crate::ports::MessageBroker;
use crate::service::worker_pool::WorkerPool;
use rumqttc::{Event, Outgoing, Packet};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

/// Topic layout under a configurable base prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn dc_measure_filter(&self) -> String {
        format!("{}/telemetry/dc/+/measure", self.base)
    }

    pub fn ac_measure_filter(&self) -> String {
        format!("{}/telemetry/ac/+/measure", self.base)
    }

    /// Publish topic for one device's readings.
    pub fn measure(&self, kind: TelemetryKind, device_id: &str) -> String {
        let kind = match kind {
            TelemetryKind::Dc => "dc",
            TelemetryKind::Ac => "ac",
        };
        format!("{}/telemetry/{}/{}/measure", self.base, kind, device_id)
    }

    pub fn backend_status(&self) -> String {
        format!("{}/backend/status", self.base)
    }

    pub fn alerts(&self) -> String {
        format!("{}/backend/alerts", self.base)
    }

    pub fn switch_set(&self, switch_id: &str, channel: Option<&str>) -> String {
        format!(
            "{}/control/switch/{}/{}/set",
            self.base,
            switch_id,
            channel.unwrap_or(DEFAULT_CHANNEL)
        )
    }
}

pub const DEFAULT_CHANNEL: &str = "ch1";
pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn as_payload(&self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Dc,
    Ac,
}

/// Why an incoming message was dropped.
#[derive(Debug, Error, PartialEq)]
pub enum Rejected {
    #[error("topic {0:?} does not match .../<kind>/<device>/<leaf>")]
    Topic(String),
    #[error("telemetry kind {0:?} is not handled")]
    UnknownKind(String),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload is not a JSON object")]
    NotObject,
}

impl Rejected {
    fn label(&self) -> &'static str {
        match self {
            Rejected::Topic(_) => "topic",
            Rejected::UnknownKind(_) => "unknown_kind",
            Rejected::Utf8 => "utf8",
            Rejected::Json(_) => "json",
            Rejected::NotObject => "not_object",
        }
    }
}

/// Splits `.../{kind}/{device_id}/measure` into its kind and device id.
pub fn parse_topic(topic: &str) -> Result<(TelemetryKind, &str), Rejected> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 3 {
        return Err(Rejected::Topic(topic.to_string()));
    }
    let kind = parts[parts.len() - 3];
    let device_id = parts[parts.len() - 2];
    if device_id.is_empty() {
        return Err(Rejected::Topic(topic.to_string()));
    }
    match kind {
        "dc" => Ok((TelemetryKind::Dc, device_id)),
        "ac" => Ok((TelemetryKind::Ac, device_id)),
        other => Err(Rejected::UnknownKind(other.to_string())),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings; anything else is absent.
fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Turn a raw publish into a typed measurement stamped with `ts`.
pub fn decode(topic: &str, payload: &[u8], ts: OffsetDateTime) -> Result<Measurement, Rejected> {
    let (kind, device_id) = parse_topic(topic)?;
    let text = std::str::from_utf8(payload).map_err(|_| Rejected::Utf8)?;
    let value: Value = serde_json::from_str(text).map_err(|e| Rejected::Json(e.to_string()))?;
    let fields = value.as_object().ok_or(Rejected::NotObject)?;

    let voltage_v = number(fields, "v").unwrap_or(0.0);
    let current_a = number(fields, "i").unwrap_or(0.0);
    let power_w = number(fields, "p").unwrap_or(0.0);

    let reading = match kind {
        TelemetryKind::Dc => Reading::Dc { voltage_v, current_a },
        TelemetryKind::Ac => Reading::Ac {
            voltage_v,
            current_a,
            pf: number(fields, "pf"),
            frequency_hz: number(fields, "f"),
            energy_wh: number(fields, "e_wh"),
        },
    };

    Ok(Measurement {
        device_id: device_id.to_string(),
        ts,
        power_w,
        reading,
    })
}

/// MQTT-facing edge of the core: demultiplexes telemetry and publishes control commands.
pub struct TelemetryBridge {
    topics: Topics,
    broker: Arc<dyn MessageBroker>,
}

impl TelemetryBridge {
    pub fn new(topics: Topics, broker: Arc<dyn MessageBroker>) -> Self {
        Self { topics, broker }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Decode one incoming message. Malformed input is logged and dropped, never raised.
    pub fn dispatch(&self, topic: &str, payload: &[u8], ts: OffsetDateTime) -> Option<Measurement> {
        metrics::counter!("mqtt_messages_received_total", 1);
        match decode(topic, payload, ts) {
            Ok(m) => Some(m),
            Err(rejected @ Rejected::UnknownKind(_)) => {
                debug!(%topic, "Ignoring message: {}", rejected);
                metrics::counter!("mqtt_messages_dropped_total", 1, "reason" => rejected.label());
                None
            }
            Err(rejected) => {
                warn!(%topic, payload = %String::from_utf8_lossy(payload), "Dropping malformed message: {}", rejected);
                metrics::counter!("mqtt_messages_dropped_total", 1, "reason" => rejected.label());
                None
            }
        }
    }

    /// Runs after every successful (re)connect. Subscribing twice is harmless.
    pub async fn on_connect(&self) -> anyhow::Result<()> {
        for filter in [self.topics.dc_measure_filter(), self.topics.ac_measure_filter()] {
            self.broker.subscribe(&filter).await?;
            info!("Subscribed to {}", filter);
        }
        self.broker
            .publish(&self.topics.backend_status(), STATUS_ONLINE.as_bytes().to_vec(), true)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn publish_switch(&self, switch_id: &str, state: SwitchState, channel: Option<&str>) -> anyhow::Result<()> {
        let topic = self.topics.switch_set(switch_id, channel);
        self.broker
            .publish(&topic, state.as_payload().as_bytes().to_vec(), false)
            .await?;
        info!(%topic, "Switch command published");
        Ok(())
    }
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const DRAIN_BACKOFF: Duration = Duration::from_secs(1);
const CONNECT_ATTEMPTS: u32 = 3;

/// Run the post-connect duties, retrying a few times before giving up until the next reconnect.
pub async fn ensure_connected(bridge: Arc<TelemetryBridge>, attempts: u32, backoff: Duration) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match bridge.on_connect().await {
            Ok(()) => return true,
            Err(e) => {
                warn!(attempt, "Post-connect setup failed: {:?}", e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    error!("Post-connect setup gave up after {} attempts, telemetry subscriptions may be missing", attempts);
    false
}

/// Drive the MQTT event loop: re-subscribe on every ConnAck and hand telemetry to the worker pool.
///
/// Never awaits ingestion work; a full worker queue drops the sample.
///
/// Shutdown happens in two steps. The shutdown signal only stops telemetry
/// intake (the worker pool is dropped so workers drain), and the loop keeps
/// polling so alerts published during the drain still reach the broker. The
/// loop returns once the client's disconnect has been flushed.
pub async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    bridge: Arc<TelemetryBridge>,
    workers: WorkerPool,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("MQTT event loop started");
    let mut intake = Some(workers);
    let mut connect_task: Option<tokio::task::JoinHandle<bool>> = None;

    loop {
        if intake.is_some() && *shutdown.borrow() {
            info!("Shutdown signal received in MQTT loop, stopping telemetry intake");
            intake = None;
        }

        tokio::select! {
            changed = shutdown.changed(), if intake.is_some() => {
                if changed.is_err() {
                    info!("Shutdown sender dropped, stopping telemetry intake");
                    intake = None;
                }
            }

            polled = eventloop.poll() => {
                match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let ts = OffsetDateTime::now_utc();
                        match &intake {
                            Some(workers) => {
                                if let Some(measurement) = bridge.dispatch(&publish.topic, &publish.payload, ts) {
                                    workers.submit(measurement);
                                }
                            }
                            None => debug!(topic = %publish.topic, "Draining, ignoring telemetry"),
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected, subscribing to telemetry");
                        // Subscribing goes through the request channel this loop drains
                        if let Some(previous) = connect_task.take() {
                            previous.abort();
                        }
                        connect_task = Some(tokio::spawn(ensure_connected(
                            bridge.clone(),
                            CONNECT_ATTEMPTS,
                            RECONNECT_BACKOFF,
                        )));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("MQTT disconnect flushed");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT Error: {:?}", e);
                        if intake.is_some() {
                            tokio::select! {
                                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                                _ = shutdown.changed() => {}
                            }
                        } else {
                            tokio::time::sleep(DRAIN_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    if let Some(task) = connect_task {
        task.abort();
    }
    info!("MQTT event loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::config::{DetectorConfig, WindowConfig};
    use crate::domain::AlertOpened;
    use crate::ports::Notifier;
    use crate::service::alerts::AlertLifecycle;
    use crate::service::coordinator::IngestionCoordinator;
    use crate::service::notify::NotificationQueue;
    use async_trait::async_trait;
    use rumqttc::{AsyncClient, MqttOptions, QoS};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBroker {
        published: Mutex<Vec<(String, Vec<u8>, bool)>>,
        subscribed: Mutex<Vec<String>>,
        subscribe_failures: Mutex<u32>,
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload, retain));
            Ok(())
        }

        async fn subscribe(&self, topic_filter: &str) -> anyhow::Result<()> {
            let mut failures = self.subscribe_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("request channel busy");
            }
            self.subscribed.lock().unwrap().push(topic_filter.to_string());
            Ok(())
        }
    }

    struct NullNotifier;
    #[async_trait]
    impl Notifier for NullNotifier {
        async fn notify_alert_opened(&self, _event: &AlertOpened) -> anyhow::Result<()> { Ok(()) }
    }

    fn coordinator(store: Arc<InMemoryStore>) -> Arc<IngestionCoordinator> {
        let (bridge, _) = bridge();
        let alerts = Arc::new(AlertLifecycle::new(store.clone(), Arc::new(bridge)));
        let (notifications, _) = NotificationQueue::spawn(Arc::new(NullNotifier), 8, 1);
        Arc::new(IngestionCoordinator::new(
            store,
            alerts,
            notifications,
            &DetectorConfig::default(),
            &WindowConfig::default(),
        ))
    }

    fn bridge() -> (TelemetryBridge, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::default());
        (TelemetryBridge::new(Topics::new("spo/v1"), broker.clone()), broker)
    }

    #[test]
    fn ac_payload_parses_all_fields() {
        let (bridge, _) = bridge();
        let payload = br#"{"v":230,"i":0.5,"p":100,"pf":0.95,"f":50,"e_wh":120.4}"#;
        let m = bridge
            .dispatch("spo/v1/telemetry/ac/ac-1/measure", payload, OffsetDateTime::UNIX_EPOCH)
            .expect("valid AC message");

        assert_eq!(m.device_id, "ac-1");
        assert_eq!(m.power_w, 100.0);
        assert_eq!(
            m.reading,
            Reading::Ac {
                voltage_v: 230.0,
                current_a: 0.5,
                pf: Some(0.95),
                frequency_hz: Some(50.0),
                energy_wh: Some(120.4),
            }
        );
    }

    #[test]
    fn dc_missing_or_bad_numbers_default_to_zero() {
        let m = decode(
            "spo/v1/telemetry/dc/dc-esp32-1/measure",
            br#"{"v":"12.1","p":"n/a"}"#,
            OffsetDateTime::UNIX_EPOCH,
        )
        .unwrap();
        assert_eq!(m.device_id, "dc-esp32-1");
        assert_eq!(m.power_w, 0.0);
        assert_eq!(m.reading, Reading::Dc { voltage_v: 12.1, current_a: 0.0 });
    }

    #[test]
    fn ac_optional_fields_absent_when_missing() {
        let m = decode("b/telemetry/ac/a/measure", br#"{"p":5,"pf":null}"#, OffsetDateTime::UNIX_EPOCH).unwrap();
        match m.reading {
            Reading::Ac { pf, frequency_hz, energy_wh, .. } => {
                assert_eq!((pf, frequency_hz, energy_wh), (None, None, None));
            }
            other => panic!("expected AC reading, got {:?}", other),
        }
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let (bridge, _) = bridge();
        let ts = OffsetDateTime::UNIX_EPOCH;
        assert!(bridge.dispatch("spo/v1/telemetry/dc/d1/measure", b"{not json", ts).is_none());
        assert!(bridge.dispatch("spo/v1/telemetry/dc/d1/measure", b"[1,2]", ts).is_none());
        assert!(bridge.dispatch("spo/v1/telemetry/dc/d1/measure", &[0xff, 0xfe], ts).is_none());
        assert!(bridge.dispatch("measure", b"{}", ts).is_none());
        assert!(bridge.dispatch("spo/v1/telemetry/xx/d1/measure", b"{}", ts).is_none());
    }

    #[test]
    fn topic_segments_are_counted_from_the_end() {
        assert_eq!(parse_topic("a/b/c/telemetry/dc/dev/measure").unwrap(), (TelemetryKind::Dc, "dev"));
        assert_eq!(parse_topic("ac/dev/measure").unwrap(), (TelemetryKind::Ac, "dev"));
        assert!(matches!(parse_topic("x/dc//measure"), Err(Rejected::Topic(_))));
    }

    #[test]
    fn measure_topics_round_trip_through_parser() {
        let topics = Topics::new("spo/v1");
        let topic = topics.measure(TelemetryKind::Ac, "ac-7");
        assert_eq!(topic, "spo/v1/telemetry/ac/ac-7/measure");
        assert_eq!(parse_topic(&topic).unwrap(), (TelemetryKind::Ac, "ac-7"));
    }

    #[test]
    fn switch_topic_defaults_to_first_channel() {
        let topics = Topics::new("spo/v1/");
        assert_eq!(topics.switch_set("sw-1", None), "spo/v1/control/switch/sw-1/ch1/set");
        assert_eq!(topics.switch_set("sw-1", Some("ch2")), "spo/v1/control/switch/sw-1/ch2/set");
    }

    #[tokio::test]
    async fn connect_subscribes_and_marks_backend_online() {
        let (bridge, broker) = bridge();
        bridge.on_connect().await.unwrap();
        bridge.on_connect().await.unwrap();

        let subscribed = broker.subscribed.lock().unwrap();
        assert_eq!(subscribed.len(), 4);
        assert_eq!(subscribed[0], "spo/v1/telemetry/dc/+/measure");
        assert_eq!(subscribed[1], "spo/v1/telemetry/ac/+/measure");

        let published = broker.published.lock().unwrap();
        assert_eq!(published[0], ("spo/v1/backend/status".to_string(), b"online".to_vec(), true));
    }

    #[tokio::test]
    async fn switch_commands_are_uppercase_and_not_retained() {
        let (bridge, broker) = bridge();
        bridge.publish_switch("sw-9", SwitchState::Off, None).await.unwrap();
        bridge.publish_switch("sw-9", SwitchState::On, Some("ch3")).await.unwrap();

        let published = broker.published.lock().unwrap();
        assert_eq!(published[0], ("spo/v1/control/switch/sw-9/ch1/set".to_string(), b"OFF".to_vec(), false));
        assert_eq!(published[1], ("spo/v1/control/switch/sw-9/ch3/set".to_string(), b"ON".to_vec(), false));
    }

    #[tokio::test]
    async fn connect_duties_retry_after_a_failed_subscribe() {
        let broker = Arc::new(MockBroker { subscribe_failures: Mutex::new(1), ..Default::default() });
        let bridge = Arc::new(TelemetryBridge::new(Topics::new("spo/v1"), broker.clone()));

        assert!(ensure_connected(bridge, 3, Duration::from_millis(5)).await);
        assert_eq!(broker.subscribed.lock().unwrap().len(), 2);
        assert_eq!(broker.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connect_duties_give_up_after_last_attempt() {
        let broker = Arc::new(MockBroker { subscribe_failures: Mutex::new(10), ..Default::default() });
        let bridge = Arc::new(TelemetryBridge::new(Topics::new("spo/v1"), broker.clone()));

        assert!(!ensure_connected(bridge, 2, Duration::from_millis(5)).await);
        assert_eq!(*broker.subscribe_failures.lock().unwrap(), 8);
        assert!(broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_intake_but_keeps_polling() {
        // Nothing listens on port 1, so every poll fails and the loop backs off
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("spo-test", "127.0.0.1", 1), 10);
        let (workers, handles) = WorkerPool::spawn(coordinator(Arc::new(InMemoryStore::new())), 2, 8);
        let (bridge, _) = bridge();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let event_loop = tokio::spawn(run_event_loop(eventloop, Arc::new(bridge), workers, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        // Workers see their queues close well within the reconnect backoff
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }

        // The loop still owns the request channel, so publishes made while draining are accepted
        assert!(!event_loop.is_finished());
        client
            .try_publish("spo/v1/backend/alerts", QoS::AtLeastOnce, false, b"{}".to_vec())
            .unwrap();

        event_loop.abort();
    }
}
