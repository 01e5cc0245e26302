use crate::config::{DetectorConfig, WindowConfig};
use crate::domain::{AlertOpened, Measurement};
use crate::error::AlertError;
use crate::ports::PersistenceStore;
use crate::service::alerts::AlertLifecycle;
use crate::service::notify::NotificationQueue;
use crate::state::{IdleDetector, RollingWindow, WindowStats};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Owns the in-memory ingestion state and sequences every measurement through it.
///
/// The rolling window and the idle detector see the same samples but keep
/// their own buffers.
pub struct IngestionCoordinator {
    store: Arc<dyn PersistenceStore>,
    alerts: Arc<AlertLifecycle>,
    notifications: NotificationQueue,
    window: RollingWindow,
    detector: IdleDetector,
    latest: DashMap<String, Measurement>,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        alerts: Arc<AlertLifecycle>,
        notifications: NotificationQueue,
        detector: &DetectorConfig,
        window: &WindowConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            notifications,
            window: RollingWindow::new(window),
            detector: IdleDetector::new(detector),
            latest: DashMap::new(),
        }
    }

    pub fn detector(&self) -> &IdleDetector {
        &self.detector
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn alerts(&self) -> &Arc<AlertLifecycle> {
        &self.alerts
    }

    /// Push per-device idle overrides from the registry into the detector.
    pub async fn load_device_overrides(&self) -> anyhow::Result<usize> {
        let devices = self.store.list_devices().await?;
        let mut applied = 0;
        for device in &devices {
            if device.idle_threshold_w.is_some() || device.idle_duration_s.is_some() {
                self.detector
                    .set_override(&device.device_id, device.idle_threshold_w, device.idle_duration_s);
                applied += 1;
            }
        }
        info!("Applied idle overrides for {} of {} devices", applied, devices.len());
        Ok(applied)
    }

    pub fn latest(&self, device_id: &str) -> Option<Measurement> {
        self.latest.get(device_id).map(|m| m.clone())
    }

    pub fn window_stats(&self, device_id: &str) -> WindowStats {
        self.window.stats(device_id)
    }

    /// Process one normalized measurement. Failures are logged, never returned:
    /// telemetry producers cannot act on them.
    #[instrument(skip(self, measurement), fields(device_id = %measurement.device_id, power_w = measurement.power_w))]
    pub async fn on_measurement(&self, measurement: Measurement) {
        if let Err(e) = self.store.save_measurement(&measurement).await {
            error!("Failed to persist measurement: {:?}", e);
            metrics::counter!("ingest_errors_total", 1, "type" => "storage");
        }

        let device_id = measurement.device_id.clone();
        let power_w = measurement.power_w;
        let ts = measurement.ts;
        self.latest.insert(device_id.clone(), measurement);

        self.window.add_at(&device_id, power_w, ts);

        if !self.detector.evaluate_at(&device_id, power_w, ts) {
            return;
        }

        let limits = self.detector.resolve(&device_id);
        match self.alerts.open(&device_id, limits).await {
            Ok(alert) => {
                info!(alert_id = ?alert.id, "Sustained idle detected, alert opened");
                let device_name = match self.store.find_device(&device_id).await {
                    Ok(Some(device)) => device.name,
                    Ok(None) => device_id.clone(),
                    Err(e) => {
                        warn!("Device lookup failed, using id as name: {:?}", e);
                        device_id.clone()
                    }
                };
                self.notifications.enqueue(AlertOpened {
                    alert_id: alert.id.unwrap_or_default(),
                    device_id,
                    device_name,
                    power_w,
                    threshold_w: alert.threshold_w,
                    duration_s: alert.duration_s,
                });
            }
            Err(AlertError::Guard(violation)) => {
                debug!("Idle persists, no new alert: {}", violation);
            }
            Err(e) => {
                error!("Failed to open idle alert: {:?}", e);
                metrics::counter!("ingest_errors_total", 1, "type" => "alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::{AlertStatus, Device, DeviceKind, Reading};
    use crate::ports::{MessageBroker, Notifier};
    use crate::service::bridge::{TelemetryBridge, Topics};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use time::{Duration as TimeDelta, OffsetDateTime};

    struct NullBroker;
    #[async_trait]
    impl MessageBroker for NullBroker {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>, _retain: bool) -> anyhow::Result<()> { Ok(()) }
        async fn subscribe(&self, _topic_filter: &str) -> anyhow::Result<()> { Ok(()) }
    }

    #[derive(Default)]
    struct MockNotifier {
        events: Mutex<Vec<AlertOpened>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify_alert_opened(&self, event: &AlertOpened) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingNotifier;
    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify_alert_opened(&self, _event: &AlertOpened) -> anyhow::Result<()> {
            anyhow::bail!("mail server down")
        }
    }

    fn build(store: Arc<InMemoryStore>, notifier: Arc<dyn Notifier>, detector: DetectorConfig) -> (Arc<IngestionCoordinator>, tokio::task::JoinHandle<()>) {
        let bridge = Arc::new(TelemetryBridge::new(Topics::new("spo/v1"), Arc::new(NullBroker)));
        let alerts = Arc::new(AlertLifecycle::new(store.clone(), bridge));
        let (notifications, handle) = NotificationQueue::spawn(notifier, 16, 2);
        let coordinator = IngestionCoordinator::new(store, alerts, notifications, &detector, &WindowConfig::default());
        (Arc::new(coordinator), handle)
    }

    fn strict() -> DetectorConfig {
        DetectorConfig { default_threshold_w: 10.0, default_duration_s: 300, window: 1 }
    }

    fn at(device_id: &str, power_w: f64, secs: i64) -> Measurement {
        Measurement {
            device_id: device_id.to_string(),
            ts: OffsetDateTime::UNIX_EPOCH + TimeDelta::seconds(1_700_000_000 + secs),
            power_w,
            reading: Reading::Dc { voltage_v: 5.0, current_a: power_w / 5.0 },
        }
    }

    #[tokio::test]
    async fn sustained_idle_opens_one_alert_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_device(Device::new("d1", "3D Printer", DeviceKind::DcSensor));
        let notifier = Arc::new(MockNotifier::default());
        let (coordinator, handle) = build(store.clone(), notifier.clone(), strict());

        coordinator.on_measurement(at("d1", 9.5, 0)).await;
        assert!(store.alerts_for("d1").is_empty());
        coordinator.on_measurement(at("d1", 9.0, 300)).await;
        coordinator.on_measurement(at("d1", 8.0, 360)).await;
        coordinator.on_measurement(at("d1", 8.0, 420)).await;

        let alerts = store.alerts_for("d1");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Open);
        assert_eq!(store.measurements("d1").len(), 4);

        drop(coordinator);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        let events = notifier.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_name, "3D Printer");
        assert_eq!(events[0].power_w, 9.0);
        assert_eq!(events[0].threshold_w, 10.0);
    }

    #[tokio::test]
    async fn active_reading_never_alerts() {
        let store = Arc::new(InMemoryStore::new());
        let (coordinator, _) = build(store.clone(), Arc::new(MockNotifier::default()), strict());
        for i in 0..10 {
            coordinator.on_measurement(at("d1", 120.0, i * 60)).await;
        }
        assert!(store.alerts_for("d1").is_empty());
        assert_eq!(coordinator.latest("d1").unwrap().power_w, 120.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_idle_evaluations_open_exactly_one_alert() {
        let store = Arc::new(InMemoryStore::new());
        let detector = DetectorConfig { default_threshold_w: 10.0, default_duration_s: 0, window: 1 };
        let (coordinator, _) = build(store.clone(), Arc::new(MockNotifier::default()), detector);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.on_measurement(at("d1", 1.0, i)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let alerts = store.alerts_for("d1");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Open);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_affect_ingestion() {
        let store = Arc::new(InMemoryStore::new());
        let detector = DetectorConfig { default_threshold_w: 10.0, default_duration_s: 0, window: 1 };
        let (coordinator, handle) = build(store.clone(), Arc::new(FailingNotifier), detector);

        coordinator.on_measurement(at("d1", 1.0, 0)).await;
        coordinator.on_measurement(at("d1", 1.0, 1)).await;
        drop(coordinator);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert_eq!(store.alerts_for("d1").len(), 1);
        assert_eq!(store.measurements("d1").len(), 2);
    }

    #[tokio::test]
    async fn registry_overrides_drive_detection() {
        let store = Arc::new(InMemoryStore::new());
        let mut fridge = Device::new("fridge", "Fridge", DeviceKind::AcSensor);
        fridge.idle_threshold_w = Some(50.0);
        fridge.idle_duration_s = Some(0);
        store.upsert_device(fridge);
        store.upsert_device(Device::new("lamp", "Lamp", DeviceKind::DcSensor));

        let (coordinator, _) = build(store.clone(), Arc::new(MockNotifier::default()), strict());
        assert_eq!(coordinator.load_device_overrides().await.unwrap(), 1);

        coordinator.on_measurement(at("fridge", 40.0, 0)).await;
        coordinator.on_measurement(at("lamp", 40.0, 0)).await;
        assert_eq!(store.alerts_for("fridge").len(), 1);
        assert_eq!(store.alerts_for("fridge")[0].threshold_w, 50.0);
        assert!(store.alerts_for("lamp").is_empty());
    }

    #[tokio::test]
    async fn closing_alert_allows_a_fresh_one_while_idle_continues() {
        let store = Arc::new(InMemoryStore::new());
        let detector = DetectorConfig { default_threshold_w: 10.0, default_duration_s: 0, window: 1 };
        let (coordinator, _) = build(store.clone(), Arc::new(MockNotifier::default()), detector);

        coordinator.on_measurement(at("d1", 1.0, 0)).await;
        let first = store.alerts_for("d1")[0].id.unwrap();
        coordinator.alerts().close(first, Some("checked".into())).await.unwrap();

        coordinator.on_measurement(at("d1", 1.0, 10)).await;
        let alerts = store.alerts_for("d1");
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts.iter().filter(|a| a.status.is_active()).count(), 1);
    }
}
