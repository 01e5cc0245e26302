use crate::config::DetectorConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use time::{Duration, OffsetDateTime};

/// Threshold/duration pair an evaluation is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IdleThresholds {
    pub threshold_w: f64,
    pub duration_s: u64,
}

struct IdleState {
    samples: VecDeque<f64>,
    below_since: Option<OffsetDateTime>,
}

/// Moving-average idle detector with a below-threshold timer per device.
///
/// `evaluate` keeps answering `true` for as long as the device stays idle.
/// Suppressing repeats against an already open alert is up to the caller.
pub struct IdleDetector {
    defaults: IdleThresholds,
    window: usize,
    states: DashMap<String, IdleState>,
    overrides: DashMap<String, IdleThresholds>,
}

impl IdleDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            defaults: IdleThresholds {
                threshold_w: config.default_threshold_w,
                duration_s: config.default_duration_s,
            },
            window: config.window.max(1),
            states: DashMap::new(),
            overrides: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> IdleThresholds {
        self.defaults
    }

    /// Install or clear a per-device override.
    ///
    /// Both `None` clears it. Otherwise the missing half comes from the
    /// process defaults, never from a previous override.
    pub fn set_override(&self, device_id: &str, threshold_w: Option<f64>, duration_s: Option<u64>) {
        if threshold_w.is_none() && duration_s.is_none() {
            self.overrides.remove(device_id);
            return;
        }
        let pair = IdleThresholds {
            threshold_w: threshold_w.unwrap_or(self.defaults.threshold_w),
            duration_s: duration_s.unwrap_or(self.defaults.duration_s),
        };
        self.overrides.insert(device_id.to_string(), pair);
    }

    pub fn resolve(&self, device_id: &str) -> IdleThresholds {
        self.overrides
            .get(device_id)
            .map(|o| *o)
            .unwrap_or(self.defaults)
    }

    pub fn evaluate(&self, device_id: &str, watts: f64) -> bool {
        self.evaluate_at(device_id, watts, OffsetDateTime::now_utc())
    }

    pub fn evaluate_at(&self, device_id: &str, watts: f64, now: OffsetDateTime) -> bool {
        let limits = self.resolve(device_id);

        let mut state = self
            .states
            .entry(device_id.to_string())
            .or_insert_with(|| IdleState {
                samples: VecDeque::with_capacity(self.window),
                below_since: None,
            });

        if state.samples.len() == self.window {
            state.samples.pop_front();
        }
        state.samples.push_back(watts);
        let avg = state.samples.iter().sum::<f64>() / state.samples.len() as f64;

        if avg < limits.threshold_w {
            let since = *state.below_since.get_or_insert(now);
            // Durations beyond i64 seconds saturate instead of wrapping negative
            let required = Duration::seconds(i64::try_from(limits.duration_s).unwrap_or(i64::MAX));
            now - since >= required
        } else {
            state.below_since = None;
            false
        }
    }

    pub fn below_since(&self, device_id: &str) -> Option<OffsetDateTime> {
        self.states.get(device_id).and_then(|s| s.below_since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold_w: f64, duration_s: u64, window: usize) -> IdleDetector {
        IdleDetector::new(&DetectorConfig {
            default_threshold_w: threshold_w,
            default_duration_s: duration_s,
            window,
        })
    }

    fn t(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + secs)
    }

    #[test]
    fn fires_once_idle_for_full_duration() {
        let d = detector(10.0, 300, 1);
        assert!(!d.evaluate_at("d1", 9.5, t(0)));
        assert_eq!(d.below_since("d1"), Some(t(0)));
        assert!(d.evaluate_at("d1", 9.0, t(300)));
        // Keeps reporting while the condition holds
        assert!(d.evaluate_at("d1", 9.0, t(360)));
    }

    #[test]
    fn reading_at_or_above_threshold_resets_timer() {
        let d = detector(10.0, 300, 1);
        assert!(!d.evaluate_at("d1", 9.0, t(0)));
        assert!(!d.evaluate_at("d1", 11.0, t(100)));
        assert_eq!(d.below_since("d1"), None);
        assert!(!d.evaluate_at("d1", 9.0, t(150)));
        assert_eq!(d.below_since("d1"), Some(t(150)));
        assert!(!d.evaluate_at("d1", 9.0, t(400)));
        assert!(d.evaluate_at("d1", 9.0, t(450)));
    }

    #[test]
    fn exactly_threshold_is_not_idle() {
        let d = detector(10.0, 0, 1);
        assert!(!d.evaluate_at("d1", 10.0, t(0)));
    }

    #[test]
    fn huge_duration_never_fires() {
        let d = detector(10.0, u64::MAX, 1);
        assert!(!d.evaluate_at("d1", 1.0, t(0)));
        assert!(!d.evaluate_at("d1", 1.0, t(1_000_000)));
        assert_eq!(d.below_since("d1"), Some(t(0)));
    }

    #[test]
    fn zero_duration_fires_on_first_evaluation() {
        let d = detector(10.0, 0, 1);
        assert!(d.evaluate_at("d1", 1.0, t(0)));
    }

    #[test]
    fn averages_over_partial_and_full_window() {
        let d = detector(10.0, 0, 3);
        // Single sample, buffer not yet full
        assert!(!d.evaluate_at("d1", 30.0, t(0)));
        // (30 + 0) / 2 = 15
        assert!(!d.evaluate_at("d1", 0.0, t(1)));
        // (30 + 0 + 0) / 3 = 10, not below
        assert!(!d.evaluate_at("d1", 0.0, t(2)));
        // 30 drops out: (0 + 0 + 0) / 3
        assert!(d.evaluate_at("d1", 0.0, t(3)));
    }

    #[test]
    fn devices_are_independent() {
        let d = detector(10.0, 60, 1);
        d.evaluate_at("d1", 1.0, t(0));
        d.evaluate_at("d2", 50.0, t(0));
        assert!(d.evaluate_at("d1", 1.0, t(60)));
        assert!(!d.evaluate_at("d2", 1.0, t(60)));
    }

    #[test]
    fn clearing_override_restores_defaults() {
        let d = detector(10.0, 300, 1);
        d.set_override("d1", Some(5.0), Some(60));
        assert_eq!(d.resolve("d1"), IdleThresholds { threshold_w: 5.0, duration_s: 60 });
        d.set_override("d1", None, None);
        assert_eq!(d.resolve("d1"), d.defaults());
    }

    #[test]
    fn partial_override_fills_from_defaults_not_previous_override() {
        let d = detector(10.0, 300, 1);
        d.set_override("d1", Some(5.0), Some(60));
        d.set_override("d1", Some(7.0), None);
        assert_eq!(d.resolve("d1"), IdleThresholds { threshold_w: 7.0, duration_s: 300 });
        d.set_override("d1", None, Some(30));
        assert_eq!(d.resolve("d1"), IdleThresholds { threshold_w: 10.0, duration_s: 30 });
    }

    #[test]
    fn override_applies_to_evaluation() {
        let d = detector(10.0, 300, 1);
        d.set_override("d1", Some(50.0), Some(0));
        assert!(d.evaluate_at("d1", 40.0, t(0)));
        assert!(!d.evaluate_at("d2", 40.0, t(0)));
    }
}
