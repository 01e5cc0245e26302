use async_trait::async_trait;
use crate::domain::{Alert, AlertId, AuditEntry, Device, Measurement};
use crate::error::GuardViolation;
use crate::ports::PersistenceStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    measurements: Vec<Measurement>,
    alerts: BTreeMap<AlertId, Alert>,
    audit: Vec<AuditEntry>,
    next_alert_id: AlertId,
}

/// Process-local store. Used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))
    }

    pub fn upsert_device(&self, device: Device) {
        if let Ok(mut inner) = self.lock() {
            inner.devices.insert(device.device_id.clone(), device);
        }
    }

    pub fn measurements(&self, device_id: &str) -> Vec<Measurement> {
        self.lock()
            .map(|inner| {
                inner
                    .measurements
                    .iter()
                    .filter(|m| m.device_id == device_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn alerts_for(&self, device_id: &str) -> Vec<Alert> {
        self.lock()
            .map(|inner| {
                inner
                    .alerts
                    .values()
                    .filter(|a| a.device_id == device_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn audit_for(&self, alert_id: AlertId) -> Vec<AuditEntry> {
        self.lock()
            .map(|inner| {
                inner
                    .audit
                    .iter()
                    .filter(|e| e.alert_id == alert_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_measurement(&self, measurement: &Measurement) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        inner.measurements.push(measurement.clone());
        if let Some(device) = inner.devices.get_mut(&measurement.device_id) {
            device.last_seen_at = Some(measurement.ts);
            device.current_power_w = Some(measurement.power_w);
        }
        Ok(())
    }

    async fn find_active_alert(&self, device_id: &str) -> anyhow::Result<Option<Alert>> {
        Ok(self
            .lock()?
            .alerts
            .values()
            .find(|a| a.device_id == device_id && a.status.is_active())
            .cloned())
    }

    async fn find_alert(&self, alert_id: AlertId) -> anyhow::Result<Option<Alert>> {
        Ok(self.lock()?.alerts.get(&alert_id).cloned())
    }

    async fn save_alert(&self, alert: &Alert) -> anyhow::Result<AlertId> {
        let mut inner = self.lock()?;
        // Same rule the database enforces with a partial unique index
        if let Some(existing) = inner
            .alerts
            .values()
            .find(|a| a.device_id == alert.device_id && a.status.is_active())
        {
            return Err(GuardViolation::ActiveAlertExists {
                device_id: alert.device_id.clone(),
                alert_id: existing.id.unwrap_or_default(),
            }
            .into());
        }
        inner.next_alert_id += 1;
        let id = inner.next_alert_id;
        let mut stored = alert.clone();
        stored.id = Some(id);
        inner.alerts.insert(id, stored);
        Ok(id)
    }

    async fn update_alert(&self, alert: &Alert, audit: &AuditEntry) -> anyhow::Result<()> {
        let id = alert.id.ok_or_else(|| anyhow::anyhow!("cannot update an alert without id"))?;
        let mut inner = self.lock()?;
        match inner.alerts.get_mut(&id) {
            Some(slot) => *slot = alert.clone(),
            None => anyhow::bail!("alert #{} does not exist", id),
        }
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        Ok(self.lock()?.devices.values().cloned().collect())
    }

    async fn find_device(&self, device_id: &str) -> anyhow::Result<Option<Device>> {
        Ok(self.lock()?.devices.get(device_id).cloned())
    }
}
