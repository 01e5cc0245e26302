use crate::config::WindowConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;

/// Time-horizon averages per device, used for reporting.
///
/// Samples are kept in arrival order. Out-of-order timestamps make the
/// eager pruning approximate, but `average` filters every sample against the
/// horizon so nothing older than the horizon is ever counted.
pub struct RollingWindow {
    samples: DashMap<String, VecDeque<(OffsetDateTime, f64)>>,
    horizons: Vec<Duration>,
    retention: Duration,
    sample_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonAverage {
    pub horizon_s: u64,
    pub avg_w: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub device_id: String,
    pub averages: Vec<HorizonAverage>,
}

impl RollingWindow {
    pub fn new(config: &WindowConfig) -> Self {
        let retention = config.horizons.iter().copied().max().unwrap_or(Duration::from_secs(600));
        Self {
            samples: DashMap::new(),
            horizons: config.horizons.clone(),
            retention,
            sample_cap: config.sample_cap.max(1),
        }
    }

    pub fn add(&self, device_id: &str, watts: f64) {
        self.add_at(device_id, watts, OffsetDateTime::now_utc());
    }

    pub fn add_at(&self, device_id: &str, watts: f64, ts: OffsetDateTime) {
        let mut buf = self.samples.entry(device_id.to_string()).or_default();
        buf.push_back((ts, watts));
        // Soft cap keeps memory bounded for chatty devices
        while buf.len() > self.sample_cap {
            buf.pop_front();
        }
    }

    pub fn average(&self, device_id: &str, horizon: Duration) -> Option<f64> {
        self.average_at(device_id, horizon, OffsetDateTime::now_utc())
    }

    pub fn average_at(&self, device_id: &str, horizon: Duration, now: OffsetDateTime) -> Option<f64> {
        let mut buf = self.samples.get_mut(device_id)?;

        let retain_from = now - self.retention;
        while matches!(buf.front(), Some((ts, _)) if *ts < retain_from) {
            buf.pop_front();
        }

        let cutoff = now - horizon;
        let (sum, count) = buf
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .fold((0.0, 0usize), |(sum, n), (_, w)| (sum + w, n + 1));

        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }

    pub fn stats(&self, device_id: &str) -> WindowStats {
        self.stats_at(device_id, OffsetDateTime::now_utc())
    }

    pub fn stats_at(&self, device_id: &str, now: OffsetDateTime) -> WindowStats {
        let averages = self
            .horizons
            .iter()
            .map(|h| HorizonAverage {
                horizon_s: h.as_secs(),
                avg_w: self.average_at(device_id, *h, now),
            })
            .collect();
        WindowStats {
            device_id: device_id.to_string(),
            averages,
        }
    }

    pub fn sample_count(&self, device_id: &str) -> usize {
        self.samples.get(device_id).map(|b| b.len()).unwrap_or(0)
    }
}
