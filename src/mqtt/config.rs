use crate::config::BridgeConfig;
use rumqttc::MqttOptions;
use std::time::Duration;

/// rumqttc refuses keep-alive periods below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    /// Application id; doubles as the MQTT username.
    pub application_id: String,
    pub access_key: String,
    pub keep_alive: Option<Duration>,
    pub client_id: String,
    pub exit_on_connection_closed: bool,
}

impl BrokerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            host: config.broker.host.clone(),
            port: config.broker.port,
            topic: config.broker.topic.clone(),
            application_id: config.bridge.application_id.clone(),
            access_key: config.broker.access_key.clone(),
            keep_alive: config
                .broker
                .keep_alive_secs
                .map(|secs| Duration::from_secs(u64::from(secs))),
            client_id: uuid::Uuid::new_v4().to_string(),
            exit_on_connection_closed: config.bridge.exit_on_connection_closed,
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_credentials(self.application_id.clone(), self.access_key.clone())
            .set_clean_session(true);
        if let Some(keep_alive) = self.keep_alive {
            options.set_keep_alive(keep_alive.max(MIN_KEEP_ALIVE));
        }
        options
    }
}
