use async_trait::async_trait;
use crate::domain::AlertOpened;
use crate::ports::{MessageBroker, Notifier};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
struct AlertNotice<'a> {
    event: &'static str,
    subject: String,
    #[serde(flatten)]
    alert: &'a AlertOpened,
}

/// Notifier that announces opened alerts on `{base}/backend/alerts` as JSON.
pub struct MqttAlertPublisher {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl MqttAlertPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, topic: String) -> Self {
        Self { broker, topic }
    }
}

pub fn subject_line(event: &AlertOpened) -> String {
    let name = if event.device_name.is_empty() { &event.device_id } else { &event.device_name };
    format!("[SPO] Idle alert #{} on {}", event.alert_id, name)
}

#[async_trait]
impl Notifier for MqttAlertPublisher {
    async fn notify_alert_opened(&self, event: &AlertOpened) -> anyhow::Result<()> {
        let notice = AlertNotice {
            event: "alert_opened",
            subject: subject_line(event),
            alert: event,
        };
        self.broker
            .publish(&self.topic, serde_json::to_vec(&notice)?, false)
            .await?;
        info!(alert_id = event.alert_id, topic = %self.topic, "Alert notification published");
        Ok(())
    }
}
