//! Broker session with statum state machine.
//!
//! ```text
//! Created ──subscribe()──► Subscribed ──run()──► (returns on shutdown or fatal close)
//! ```
//!
//! `run` owns the event loop. Each uplink publish is handed to its own task,
//! so slow directory or ingestion calls for one device never stall the loop.

use super::config::BrokerSettings;
use super::message_manager::InboundUplink;
use super::{BrokerError, MqttPublisher};
use crate::bridge::MessageBridge;
use crate::notify::Notifier;
use chrono::Local;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// States for the broker session
#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Created,    // Client built, nothing sent yet
    Subscribed, // Uplink subscription queued, ready to run
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    settings: BrokerSettings,
    client: AsyncClient,
    eventloop: EventLoop,
    notifier: Arc<dyn Notifier>,
}

impl<S: SessionState> BrokerSession<S> {
    /// Publisher sharing this session's client.
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher::new(self.client.clone())
    }
}

impl BrokerSession<Created> {
    pub fn create(settings: BrokerSettings, notifier: Arc<dyn Notifier>) -> Self {
        info!(
            "Creating broker session for {} on {}:{}",
            settings.application_id, settings.host, settings.port
        );

        let (client, eventloop) = AsyncClient::new(settings.mqtt_options(), REQUEST_CAPACITY);
        Self::new(settings, client, eventloop, notifier)
    }

    /// Queue the uplink subscription; it is sent once the connection is up.
    pub async fn subscribe(self) -> Result<BrokerSession<Subscribed>, BrokerError> {
        self.client
            .subscribe(self.settings.topic.clone(), QoS::ExactlyOnce)
            .await?;

        debug!("Subscription to {} queued", self.settings.topic);
        Ok(self.transition())
    }
}

impl BrokerSession<Subscribed> {
    /// Poll the broker until `shutdown` fires.
    ///
    /// Returns [`BrokerError::ConnectionClosed`] when the connection drops and
    /// the session is configured to exit on close.
    pub async fn run(
        mut self,
        bridge: Arc<MessageBridge>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut resubscribe = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("Disconnect not queued: {}", e);
                    }
                    info!("Broker session stopped");
                    return Ok(());
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let uplink = InboundUplink::from_publish(&publish);
                    debug!("Uplink {}", uplink);

                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        // failures are reported by handle_uplink
                        let _ = bridge.handle_uplink(&uplink.topic, &uplink.payload).await;
                    });
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        error!("Broker refused connection: {:?}", ack.code);
                        self.notifier
                            .line("Mqtt connection failed. Check TTN credentials.");
                        continue;
                    }

                    info!("Connected to {}:{}", self.settings.host, self.settings.port);
                    if let Some(keep_alive) = self.settings.keep_alive {
                        self.notifier.line(&format!(
                            "MQTT KeepAlivePeriod is {}",
                            keep_alive.as_secs()
                        ));
                    }

                    // clean sessions drop the subscription on reconnect
                    if resubscribe && !ack.session_present {
                        if let Err(e) = self
                            .client
                            .try_subscribe(self.settings.topic.clone(), QoS::ExactlyOnce)
                        {
                            warn!("Resubscribe to {} failed: {}", self.settings.topic, e);
                        }
                    }
                    resubscribe = false;
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.notifier.line(&format!(
                        "MQTT subscribed to {} on {}",
                        self.settings.application_id, self.settings.host
                    ));
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    debug!("Publish sent with packet id {}", pkid);
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    self.notifier.line(&format!(
                        "MQTT handling downlink Id {} published: true",
                        comp.pkid
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Broker connection error: {}", e);
                    self.notifier
                        .trace(&format!("{} -> ", Local::now().format("%H:%M:%S")));
                    self.notifier.trace("MQTT connection closed.");

                    if self.settings.exit_on_connection_closed {
                        self.notifier.line(" Exit for restart.");
                        return Err(BrokerError::ConnectionClosed(e.to_string()));
                    }

                    self.notifier.line(" No exit.");
                    resubscribe = true;
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Broker session stopped");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::mqtt::BrokerPublisher;
    use crate::test_support::RecordingNotifier;

    #[tokio::test]
    async fn test_session_transitions_to_subscribed() {
        let settings = BrokerSettings::from_config(&BridgeConfig::example());
        let notifier = Arc::new(RecordingNotifier::default());

        let session = BrokerSession::create(settings, notifier);
        let session: BrokerSession<Subscribed> = session.subscribe().await.expect("subscribe");

        // the publisher shares the request queue, no connection needed to queue
        let publisher = session.publisher();
        let receipt = publisher
            .publish("app/devices/D1/down", b"{}".to_vec())
            .await
            .expect("publish");
        assert_eq!(receipt.id, 1);

        // receipts count publishes, independent of MQTT packet ids
        let second = publisher
            .publish("app/devices/D2/down", b"{}".to_vec())
            .await
            .expect("publish");
        assert_eq!(second.id, 2);
    }
}
