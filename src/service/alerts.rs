use crate::domain::{Alert, AlertAction, AlertId, AlertStatus, AuditEntry};
use crate::error::{AlertError, AlertResult, GuardViolation};
use crate::ports::PersistenceStore;
use crate::service::bridge::{SwitchState, TelemetryBridge};
use crate::state::IdleThresholds;
use dashmap::DashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

/// Status changes allowed for each action.
fn allowed_from(action: AlertAction) -> &'static [AlertStatus] {
    match action {
        AlertAction::Ack => &[AlertStatus::Open],
        AlertAction::Snooze => &[AlertStatus::Open, AlertStatus::Ack],
        AlertAction::Ignore | AlertAction::Close | AlertAction::Shutdown => {
            &[AlertStatus::Open, AlertStatus::Ack, AlertStatus::Snoozed]
        }
    }
}

/// Alert state machine with a per-device lock around every read-modify-write.
///
/// The lock makes "check for an active alert, then insert" a single step for
/// callers in this process; the store's own uniqueness rule covers the rest.
pub struct AlertLifecycle {
    store: Arc<dyn PersistenceStore>,
    bridge: Arc<TelemetryBridge>,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AlertLifecycle {
    pub fn new(store: Arc<dyn PersistenceStore>, bridge: Arc<TelemetryBridge>) -> Self {
        Self {
            store,
            bridge,
            device_locks: DashMap::new(),
        }
    }

    async fn lock_device(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .device_locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn get(&self, alert_id: AlertId) -> AlertResult<Alert> {
        self.store
            .find_alert(alert_id)
            .await?
            .ok_or(AlertError::NotFound(alert_id))
    }

    /// Open an idle alert unless the device already has an active one.
    #[instrument(skip(self, limits), fields(threshold_w = limits.threshold_w, duration_s = limits.duration_s))]
    pub async fn open(&self, device_id: &str, limits: IdleThresholds) -> AlertResult<Alert> {
        let _guard = self.lock_device(device_id).await;

        if let Some(existing) = self.store.find_active_alert(device_id).await? {
            return Err(GuardViolation::ActiveAlertExists {
                device_id: device_id.to_string(),
                alert_id: existing.id.unwrap_or_default(),
            }
            .into());
        }

        let mut alert = Alert::idle(
            device_id.to_string(),
            limits.threshold_w,
            limits.duration_s,
            OffsetDateTime::now_utc(),
        );
        let id = self.store.save_alert(&alert).await?;
        alert.id = Some(id);

        info!(alert_id = id, "Alert opened");
        metrics::counter!("alerts_opened_total", 1);
        Ok(alert)
    }

    pub async fn ack(&self, alert_id: AlertId) -> AlertResult<Alert> {
        self.transition(alert_id, AlertAction::Ack, None, |alert, _| {
            alert.status = AlertStatus::Ack;
            Ok(())
        })
        .await
    }

    /// Snooze for `minutes`. Nothing wakes the alert up again; re-evaluation after
    /// `snooze_until` is the caller's job.
    pub async fn snooze(&self, alert_id: AlertId, minutes: u32, reason: Option<String>) -> AlertResult<Alert> {
        self.transition(alert_id, AlertAction::Snooze, reason, |alert, now| {
            let until = now
                .checked_add(Duration::minutes(i64::from(minutes)))
                .ok_or(AlertError::InvalidSnooze { alert_id, minutes })?;
            alert.status = AlertStatus::Snoozed;
            alert.snooze_until = Some(until);
            Ok(())
        })
        .await
    }

    pub async fn ignore(&self, alert_id: AlertId, reason: Option<String>) -> AlertResult<Alert> {
        self.transition(alert_id, AlertAction::Ignore, reason, |alert, now| {
            close_at(alert, now);
            Ok(())
        })
        .await
    }

    pub async fn close(&self, alert_id: AlertId, reason: Option<String>) -> AlertResult<Alert> {
        self.transition(alert_id, AlertAction::Close, reason, |alert, now| {
            close_at(alert, now);
            Ok(())
        })
        .await
    }

    /// Switch the device off through its mapped switch, then close the alert.
    ///
    /// Rejected without publishing if the device has no switch mapping. A failed
    /// publish leaves the alert untouched.
    #[instrument(skip(self, reason))]
    pub async fn shutdown(&self, alert_id: AlertId, reason: Option<String>) -> AlertResult<Alert> {
        let alert = self.get(alert_id).await?;
        let _guard = self.lock_device(&alert.device_id).await;
        // Re-read under the lock in case a concurrent transition won
        let mut alert = self.get(alert_id).await?;
        ensure_allowed(&alert, AlertAction::Shutdown)?;

        let mapping = self
            .store
            .find_device(&alert.device_id)
            .await?
            .and_then(|d| d.switch)
            .ok_or_else(|| GuardViolation::NoSwitchMapping {
                device_id: alert.device_id.clone(),
            })?;

        self.bridge
            .publish_switch(&mapping.switch_id, SwitchState::Off, mapping.channel.as_deref())
            .await
            .map_err(AlertError::Transport)?;

        let now = OffsetDateTime::now_utc();
        close_at(&mut alert, now);
        self.persist(&alert, AlertAction::Shutdown, reason, now).await?;
        Ok(alert)
    }

    async fn transition<F>(
        &self,
        alert_id: AlertId,
        action: AlertAction,
        reason: Option<String>,
        apply: F,
    ) -> AlertResult<Alert>
    where
        F: FnOnce(&mut Alert, OffsetDateTime) -> AlertResult<()>,
    {
        let alert = self.get(alert_id).await?;
        let _guard = self.lock_device(&alert.device_id).await;
        let mut alert = self.get(alert_id).await?;
        ensure_allowed(&alert, action)?;

        let now = OffsetDateTime::now_utc();
        apply(&mut alert, now)?;
        self.persist(&alert, action, reason, now).await?;
        Ok(alert)
    }

    async fn persist(&self, alert: &Alert, action: AlertAction, reason: Option<String>, now: OffsetDateTime) -> AlertResult<()> {
        let alert_id = alert.id.unwrap_or_default();
        let audit = AuditEntry {
            alert_id,
            device_id: alert.device_id.clone(),
            action,
            reason,
            ts: now,
        };
        self.store.update_alert(alert, &audit).await?;
        info!(alert_id, device_id = %alert.device_id, %action, status = %alert.status, "Alert updated");
        Ok(())
    }
}

fn ensure_allowed(alert: &Alert, action: AlertAction) -> AlertResult<()> {
    if allowed_from(action).contains(&alert.status) {
        Ok(())
    } else {
        Err(AlertError::InvalidTransition {
            alert_id: alert.id.unwrap_or_default(),
            from: alert.status,
            action,
        })
    }
}

fn close_at(alert: &mut Alert, now: OffsetDateTime) {
    alert.status = AlertStatus::Closed;
    alert.ts_close = Some(now);
}
