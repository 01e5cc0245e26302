use async_trait::async_trait;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS, Transport};
use crate::ports::MessageBroker;
use crate::service::bridge::{Topics, STATUS_OFFLINE};
use tracing::instrument;
use std::time::Duration;
use crate::config::AppConfig;

pub struct MqttAdapter {
    client: AsyncClient,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Build the client and its event loop. The loop is driven by `bridge::run_event_loop`,
    /// which also reconnects on the next poll after an error.
    pub fn build(config: &AppConfig) -> (AsyncClient, rumqttc::EventLoop) {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            &config.mqtt_host,
            config.mqtt_port,
        );
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(username, config.mqtt_password.as_deref().unwrap_or_default());
        }
        mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keepalive_secs));

        // Broker flips the retained status to offline if we vanish
        let status_topic = Topics::new(&config.mqtt_base).backend_status();
        mqttoptions.set_last_will(LastWill::new(status_topic, STATUS_OFFLINE, QoS::AtLeastOnce, true));

        if config.mqtt_tls {
            mqttoptions.set_transport(Transport::tls_with_default_config());
        }

        AsyncClient::new(mqttoptions, 100)
    }
}

#[async_trait]
impl MessageBroker for MqttAdapter {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Publish Failed: {:?}", e))?;
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str) -> anyhow::Result<()> {
        self.client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Subscribe Failed: {:?}", e))?;
        Ok(())
    }
}
