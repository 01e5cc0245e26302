use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_base: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub database_url: Option<String>,
    pub detector: DetectorConfig,
    pub window: WindowConfig,
    pub ingest_workers: usize,
    pub ingest_queue: usize,
    pub notify_queue: usize,
    pub notify_concurrency: usize,
    pub metrics_port: u16,
}

/// Process-wide idle detection defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DetectorConfig {
    pub default_threshold_w: f64,
    pub default_duration_s: u64,
    /// Number of recent samples averaged per evaluation.
    pub window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            default_threshold_w: 10.0,
            default_duration_s: 300,
            window: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowConfig {
    pub horizons: Vec<Duration>,
    pub sample_cap: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            horizons: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(600),
            ],
            sample_cap: 2000,
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        let detector = DetectorConfig {
            default_threshold_w: parse_var("IDLE_POWER_THRESHOLD_W", 10.0)?,
            default_duration_s: parse_var("IDLE_DURATION_SEC", 300)?,
            window: parse_var("IDLE_WINDOW_SAMPLES", 1)?,
        };
        if detector.window == 0 {
            anyhow::bail!("IDLE_WINDOW_SAMPLES must be at least 1");
        }

        let horizons = match env::var("ROLLING_HORIZONS_SECS") {
            Ok(raw) => parse_horizons(&raw).context("ROLLING_HORIZONS_SECS must be a comma-separated list of seconds")?,
            Err(_) => WindowConfig::default().horizons,
        };
        let window = WindowConfig {
            horizons,
            sample_cap: parse_var("ROLLING_SAMPLE_CAP", 2000)?,
        };

        let config = AppConfig {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: parse_var("MQTT_PORT", 1883)?,
            mqtt_base: env::var("MQTT_BASE")
                .unwrap_or_else(|_| "spo/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            mqtt_username: env::var("MQTT_USERNAME").ok().filter(|s| !s.is_empty()),
            mqtt_password: env::var("MQTT_PASSWORD").ok(),
            mqtt_tls: parse_var("MQTT_TLS", false)?,
            mqtt_keepalive_secs: parse_var("MQTT_KEEPALIVE_SECS", 60)?,
            mqtt_client_id: env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "spo-backend-1".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            detector,
            window,
            ingest_workers: parse_var("INGEST_WORKERS", 4)?,
            ingest_queue: parse_var("INGEST_QUEUE", 10000)?,
            notify_queue: parse_var("NOTIFY_QUEUE", 256)?,
            notify_concurrency: parse_var("NOTIFY_CONCURRENCY", 4)?,
            metrics_port: parse_var("METRICS_PORT", 9000)?,
        };

        Ok(config)
    }
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_horizons(raw: &str) -> anyhow::Result<Vec<Duration>> {
    let mut horizons = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().map(Duration::from_secs))
        .collect::<Result<Vec<_>, _>>()?;
    if horizons.is_empty() {
        anyhow::bail!("at least one horizon is required");
    }
    horizons.sort();
    horizons.dedup();
    Ok(horizons)
}
