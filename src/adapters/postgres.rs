use async_trait::async_trait;
use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use crate::domain::{Alert, AlertId, AuditEntry, Device, Measurement, Reading, SwitchMapping};
use crate::error::GuardViolation;
use crate::ports::PersistenceStore;
use tracing::{info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        device_id         TEXT PRIMARY KEY,
        name              TEXT NOT NULL DEFAULT 'Unnamed',
        kind              TEXT NOT NULL DEFAULT 'dc_sensor',
        location          TEXT,
        idle_threshold_w  DOUBLE PRECISION,
        idle_duration_sec BIGINT,
        switch_id         TEXT,
        switch_channel    TEXT,
        last_seen_at      TIMESTAMPTZ,
        current_power_w   DOUBLE PRECISION,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "ALTER TABLE devices ADD COLUMN IF NOT EXISTS last_seen_at TIMESTAMPTZ",
    "ALTER TABLE devices ADD COLUMN IF NOT EXISTS current_power_w DOUBLE PRECISION",
    r#"
    CREATE TABLE IF NOT EXISTS telemetry_dc (
        id        BIGSERIAL PRIMARY KEY,
        device_id TEXT NOT NULL,
        voltage_v DOUBLE PRECISION NOT NULL,
        current_a DOUBLE PRECISION NOT NULL,
        power_w   DOUBLE PRECISION NOT NULL,
        ts        TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS telemetry_ac (
        id           BIGSERIAL PRIMARY KEY,
        device_id    TEXT NOT NULL,
        voltage_v    DOUBLE PRECISION NOT NULL,
        current_a    DOUBLE PRECISION NOT NULL,
        power_w      DOUBLE PRECISION NOT NULL,
        pf           DOUBLE PRECISION,
        frequency_hz DOUBLE PRECISION,
        energy_wh    DOUBLE PRECISION,
        ts           TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id           BIGSERIAL PRIMARY KEY,
        device_id    TEXT NOT NULL,
        reason       TEXT NOT NULL,
        threshold_w  DOUBLE PRECISION NOT NULL,
        duration_s   BIGINT NOT NULL,
        status       TEXT NOT NULL,
        ts_open      TIMESTAMPTZ NOT NULL,
        ts_close     TIMESTAMPTZ,
        snooze_until TIMESTAMPTZ
    )
    "#,
    // Cross-process backstop for one active alert per device
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS alerts_one_active_per_device
        ON alerts (device_id) WHERE status IN ('open', 'ack', 'snoozed')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS actions (
        id        BIGSERIAL PRIMARY KEY,
        alert_id  BIGINT REFERENCES alerts (id),
        device_id TEXT NOT NULL,
        action    TEXT NOT NULL,
        reason    TEXT,
        ts        TIMESTAMPTZ NOT NULL
    )
    "#,
];

const ALERT_COLUMNS: &str =
    "id, device_id, reason, threshold_w, duration_s, status, ts_open, ts_close, snooze_until";

const DEVICE_COLUMNS: &str = "device_id, name, kind, location, idle_threshold_w, idle_duration_sec, \
    switch_id, switch_channel, last_seen_at, current_power_w";

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Registry column to duration. Negative values are corrupt rows, not "fire immediately".
fn idle_duration_from_column(value: Option<i64>) -> anyhow::Result<Option<u64>> {
    value
        .map(|d| u64::try_from(d).with_context(|| format!("negative idle_duration_sec {}", d)))
        .transpose()
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("schema migration failed")?;
        }
        info!("Database schema ready");
        Ok(())
    }
}

fn alert_from_row(row: &PgRow) -> anyhow::Result<Alert> {
    let status: String = row.try_get("status")?;
    let duration_s: i64 = row.try_get("duration_s")?;
    Ok(Alert {
        id: Some(row.try_get("id")?),
        device_id: row.try_get("device_id")?,
        reason: row.try_get("reason")?,
        threshold_w: row.try_get("threshold_w")?,
        duration_s: u64::try_from(duration_s).context("negative alert duration")?,
        status: status.parse()?,
        ts_open: row.try_get("ts_open")?,
        ts_close: row.try_get("ts_close")?,
        snooze_until: row.try_get("snooze_until")?,
    })
}

fn device_from_row(row: &PgRow) -> anyhow::Result<Device> {
    let kind: String = row.try_get("kind")?;
    let duration: Option<i64> = row.try_get("idle_duration_sec")?;
    let device_id: String = row.try_get("device_id")?;
    let switch_id: Option<String> = row.try_get("switch_id")?;
    let channel: Option<String> = row.try_get("switch_channel")?;
    Ok(Device {
        idle_duration_s: idle_duration_from_column(duration)
            .with_context(|| format!("device {}", device_id))?,
        device_id,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        location: row.try_get("location")?,
        idle_threshold_w: row.try_get("idle_threshold_w")?,
        switch: switch_id
            .filter(|s| !s.is_empty())
            .map(|switch_id| SwitchMapping { switch_id, channel }),
        last_seen_at: row.try_get("last_seen_at")?,
        current_power_w: row.try_get("current_power_w")?,
    })
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    #[instrument(skip(self, m), fields(device_id = %m.device_id))]
    async fn save_measurement(&self, m: &Measurement) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        match &m.reading {
            Reading::Dc { voltage_v, current_a } => {
                sqlx::query(
                    "INSERT INTO telemetry_dc (device_id, voltage_v, current_a, power_w, ts) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&m.device_id)
                .bind(voltage_v)
                .bind(current_a)
                .bind(m.power_w)
                .bind(m.ts)
                .execute(&mut *tx)
                .await?;
            }
            Reading::Ac { voltage_v, current_a, pf, frequency_hz, energy_wh } => {
                sqlx::query(
                    r#"
                    INSERT INTO telemetry_ac (device_id, voltage_v, current_a, power_w, pf, frequency_hz, energy_wh, ts)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(&m.device_id)
                .bind(voltage_v)
                .bind(current_a)
                .bind(m.power_w)
                .bind(pf)
                .bind(frequency_hz)
                .bind(energy_wh)
                .bind(m.ts)
                .execute(&mut *tx)
                .await?;
            }
        }

        // Unregistered devices only get telemetry rows
        sqlx::query("UPDATE devices SET last_seen_at = $2, current_power_w = $3 WHERE device_id = $1")
            .bind(&m.device_id)
            .bind(m.ts)
            .bind(m.power_w)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_active_alert(&self, device_id: &str) -> anyhow::Result<Option<Alert>> {
        let query = format!(
            "SELECT {} FROM alerts WHERE device_id = $1 AND status IN ('open', 'ack', 'snoozed') ORDER BY ts_open DESC LIMIT 1",
            ALERT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn find_alert(&self, alert_id: AlertId) -> anyhow::Result<Option<Alert>> {
        let query = format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    #[instrument(skip(self, alert), fields(device_id = %alert.device_id))]
    async fn save_alert(&self, alert: &Alert) -> anyhow::Result<AlertId> {
        let row = sqlx::query(
            r#"
            INSERT INTO alerts (device_id, reason, threshold_w, duration_s, status, ts_open, ts_close, snooze_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&alert.device_id)
        .bind(&alert.reason)
        .bind(alert.threshold_w)
        .bind(alert.duration_s as i64)
        .bind(alert.status.as_str())
        .bind(alert.ts_open)
        .bind(alert.ts_close)
        .bind(alert.snooze_until)
        .fetch_one(&self.pool)
        .await;

        let row = match row {
            Ok(row) => row,
            // Another process opened one between our check and insert
            Err(e) if is_unique_violation(&e) => {
                let existing = self.find_active_alert(&alert.device_id).await?;
                return Err(GuardViolation::ActiveAlertExists {
                    device_id: alert.device_id.clone(),
                    alert_id: existing.and_then(|a| a.id).unwrap_or_default(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("insert alert")),
        };
        Ok(row.try_get("id")?)
    }

    #[instrument(skip(self, alert, audit), fields(alert_id = ?alert.id, action = %audit.action))]
    async fn update_alert(&self, alert: &Alert, audit: &AuditEntry) -> anyhow::Result<()> {
        let id = alert.id.context("cannot update an alert without id")?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE alerts SET status = $2, ts_close = $3, snooze_until = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(alert.status.as_str())
        .bind(alert.ts_close)
        .bind(alert.snooze_until)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("alert #{} does not exist", id);
        }

        sqlx::query(
            "INSERT INTO actions (alert_id, device_id, action, reason, ts) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(audit.alert_id)
        .bind(&audit.device_id)
        .bind(audit.action.as_str())
        .bind(&audit.reason)
        .bind(audit.ts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        let query = format!("SELECT {} FROM devices", DEVICE_COLUMNS);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn find_device(&self, device_id: &str) -> anyhow::Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(device_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_duration_column_rejects_negative_values() {
        assert_eq!(idle_duration_from_column(None).unwrap(), None);
        assert_eq!(idle_duration_from_column(Some(600)).unwrap(), Some(600));
        assert!(idle_duration_from_column(Some(-1)).is_err());
    }

    #[test]
    fn only_database_errors_count_as_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }
}
