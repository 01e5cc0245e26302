use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub type AlertId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    DcSensor,
    AcSensor,
    Switch,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::DcSensor => "dc_sensor",
            DeviceKind::AcSensor => "ac_sensor",
            DeviceKind::Switch => "switch",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dc_sensor" => Ok(DeviceKind::DcSensor),
            "ac_sensor" => Ok(DeviceKind::AcSensor),
            "switch" => Ok(DeviceKind::Switch),
            other => Err(anyhow::anyhow!("unknown device kind: {}", other)),
        }
    }
}

/// Remote-controllable switch a monitored device is plugged into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchMapping {
    pub switch_id: String,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub location: Option<String>,
    pub idle_threshold_w: Option<f64>,
    pub idle_duration_s: Option<u64>,
    pub switch: Option<SwitchMapping>,
    /// Liveness, refreshed by the store on every saved measurement.
    #[serde(default, with = "time::serde::iso8601::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub current_power_w: Option<f64>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            kind,
            location: None,
            idle_threshold_w: None,
            idle_duration_s: None,
            switch: None,
            last_seen_at: None,
            current_power_w: None,
        }
    }
}

/// Kind-specific part of a reading. Power lives on `Measurement` itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    Dc {
        voltage_v: f64,
        current_a: f64,
    },
    Ac {
        voltage_v: f64,
        current_a: f64,
        pf: Option<f64>,
        frequency_hz: Option<f64>,
        energy_wh: Option<f64>,
    },
}

/// A normalized telemetry sample, stamped on arrival at the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub device_id: String,
    #[serde(with = "time::serde::iso8601")]
    pub ts: OffsetDateTime,
    pub power_w: f64,
    #[serde(flatten)]
    pub reading: Reading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Ack,
    Snoozed,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Ack => "ack",
            AlertStatus::Snoozed => "snoozed",
            AlertStatus::Closed => "closed",
        }
    }

    /// Open, acknowledged and snoozed alerts all block a new alert for the device.
    pub fn is_active(&self) -> bool {
        !matches!(self, AlertStatus::Closed)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatus::Open),
            "ack" => Ok(AlertStatus::Ack),
            "snoozed" => Ok(AlertStatus::Snoozed),
            "closed" => Ok(AlertStatus::Closed),
            other => Err(anyhow::anyhow!("unknown alert status: {}", other)),
        }
    }
}

pub const IDLE_REASON: &str = "idle_detected";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<AlertId>, // Assigned by the store
    pub device_id: String,
    pub reason: String,
    pub threshold_w: f64,
    pub duration_s: u64,
    pub status: AlertStatus,
    #[serde(with = "time::serde::iso8601")]
    pub ts_open: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub ts_close: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub snooze_until: Option<OffsetDateTime>,
}

impl Alert {
    pub fn idle(device_id: String, threshold_w: f64, duration_s: u64, ts_open: OffsetDateTime) -> Self {
        Self {
            id: None,
            device_id,
            reason: IDLE_REASON.to_string(),
            threshold_w,
            duration_s,
            status: AlertStatus::Open,
            ts_open,
            ts_close: None,
            snooze_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Ack,
    Snooze,
    Ignore,
    Close,
    Shutdown,
}

impl AlertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertAction::Ack => "ack",
            AlertAction::Snooze => "snooze",
            AlertAction::Ignore => "ignore",
            AlertAction::Close => "close",
            AlertAction::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of an operator action on an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub alert_id: AlertId,
    pub device_id: String,
    pub action: AlertAction,
    pub reason: Option<String>,
    #[serde(with = "time::serde::iso8601")]
    pub ts: OffsetDateTime,
}

/// Payload handed to the notifier after an alert has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertOpened {
    pub alert_id: AlertId,
    pub device_id: String,
    pub device_name: String,
    pub power_w: f64,
    pub threshold_w: f64,
    pub duration_s: u64,
}
