use async_trait::async_trait;
use crate::domain::{Alert, AlertId, AlertOpened, AuditEntry, Device, Measurement};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Persist a raw telemetry sample.
    async fn save_measurement(&self, measurement: &Measurement) -> anyhow::Result<()>;

    /// The device's alert in open, ack or snoozed state, if any.
    async fn find_active_alert(&self, device_id: &str) -> anyhow::Result<Option<Alert>>;

    async fn find_alert(&self, alert_id: AlertId) -> anyhow::Result<Option<Alert>>;

    /// Insert a new alert and return the id assigned to it.
    /// Must fail if the device already has an active alert.
    async fn save_alert(&self, alert: &Alert) -> anyhow::Result<AlertId>;

    /// Persist a status change together with its audit entry as one unit.
    async fn update_alert(&self, alert: &Alert, audit: &AuditEntry) -> anyhow::Result<()>;

    async fn list_devices(&self) -> anyhow::Result<Vec<Device>>;

    async fn find_device(&self, device_id: &str) -> anyhow::Result<Option<Device>>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish data to a specific topic.
    /// QoS 1 implied.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()>;

    /// Subscribe to a topic filter. Incoming messages arrive on the transport's event loop.
    async fn subscribe(&self, topic_filter: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best-effort delivery; callers log and discard errors.
    async fn notify_alert_opened(&self, event: &AlertOpened) -> anyhow::Result<()>;
}
