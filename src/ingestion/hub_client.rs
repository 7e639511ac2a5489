//! Device connections to an IoT hub over MQTT.
//!
//! Each device gets its own TLS session on port 8883, authenticated with a SAS
//! token signed by the device key. Cloud-to-device messages arrive on
//! `devices/<id>/messages/devicebound/#` with manual acks, so a message is
//! only acknowledged once [`DeviceConnection::complete`] is called.
//!
//! ```text
//! EventLoop ──► [event task] ──► inbound channel ──► receive() ──► pending
//!                    │                                              │
//!                    └──► link state ──► send()    complete() ── ack ◄──┘
//! ```
//!
//! `open` only returns once the hub has accepted the session. Afterwards the
//! event task keeps the link state current, and `send` refuses to queue while
//! the session is down.

use super::connection_string::ConnectionString;
use super::{sas, CloudMessage, DeviceConnection, DeviceConnector, IngestionError};
use crate::notify::Notifier;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const API_VERSION: &str = "2021-04-12";
const HUB_PORT: u16 = 8883;
const REQUEST_CAPACITY: usize = 10;
const INBOUND_BUFFER: usize = 16;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Connection parameters shared by all devices.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub sas_token_ttl: Duration,
    pub keep_alive: Duration,
    /// Upper bound of one `receive()` wait.
    pub receive_window: Duration,
    /// How long `open` waits for the hub to accept the session.
    pub connect_timeout: Duration,
    /// How long `send` waits for room in the request queue.
    pub send_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sas_token_ttl: Duration::from_secs(24 * 60 * 60),
            keep_alive: Duration::from_secs(60),
            receive_window: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Session state as seen by the event task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Down(String),
}

/// Publishes link changes and reports a lost or restored session.
struct LinkMonitor {
    device_id: String,
    state: watch::Sender<LinkState>,
    notifier: Arc<dyn Notifier>,
    ever_connected: AtomicBool,
}

impl LinkMonitor {
    fn new(device_id: &str, state: watch::Sender<LinkState>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            device_id: device_id.to_string(),
            state,
            notifier,
            ever_connected: AtomicBool::new(false),
        }
    }

    fn connected(&self) {
        let previous = self.state.send_replace(LinkState::Connected);
        let reconnect = self.ever_connected.swap(true, Ordering::Relaxed);
        if reconnect && matches!(previous, LinkState::Down(_)) {
            info!("Hub session for {} restored", self.device_id);
            self.notifier
                .line(&format!("Ingestion connection for {} restored", self.device_id));
        }
    }

    fn lost(&self, reason: String) {
        let previous = self.state.send_replace(LinkState::Down(reason.clone()));
        if previous == LinkState::Connected {
            warn!("Hub connection for {} lost: {}", self.device_id, reason);
            self.notifier.line(&format!(
                "Ingestion connection for {} lost: {}",
                self.device_id, reason
            ));
        }
    }

    fn stopped(&self) {
        self.state.send_replace(LinkState::Down("closed".into()));
    }
}

pub struct HubConnector {
    settings: HubSettings,
    notifier: Arc<dyn Notifier>,
}

impl HubConnector {
    pub fn new(settings: HubSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self { settings, notifier }
    }
}

#[async_trait]
impl DeviceConnector for HubConnector {
    async fn open(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, IngestionError> {
        let host = connection_string.require("HostName")?;
        let device_id = connection_string.require("DeviceId")?;
        let key = connection_string.require("SharedAccessKey")?;

        let ttl = chrono::Duration::from_std(self.settings.sas_token_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let token = sas::generate_sas_token(
            &format!("{}/devices/{}", host, device_id),
            key,
            None,
            Utc::now() + ttl,
        )?;

        let mut options = MqttOptions::new(device_id, host, HUB_PORT);
        options
            .set_credentials(
                format!("{}/{}/?api-version={}", host, device_id, API_VERSION),
                token,
            )
            .set_keep_alive(self.settings.keep_alive.max(Duration::from_secs(5)))
            .set_manual_acks(true)
            .set_transport(Transport::tls_with_default_config());

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        client
            .subscribe(
                format!("devices/{}/messages/devicebound/#", device_id),
                QoS::AtLeastOnce,
            )
            .await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state_tx, mut link) = watch::channel(LinkState::Connecting);
        let monitor = LinkMonitor::new(device_id, state_tx, self.notifier.clone());
        let cancel = CancellationToken::new();
        let event_task = tokio::spawn(run_event_loop(
            monitor,
            eventloop,
            inbound_tx,
            cancel.clone(),
        ));

        let first = tokio::time::timeout(self.settings.connect_timeout, first_session(&mut link)).await;
        let failure = match first {
            Ok(LinkState::Connected) => None,
            Ok(LinkState::Down(reason)) => Some(IngestionError::Connect {
                device_id: device_id.to_string(),
                reason,
            }),
            Ok(LinkState::Connecting) | Err(_) => {
                Some(IngestionError::ConnectTimeout(device_id.to_string()))
            }
        };
        if let Some(e) = failure {
            cancel.cancel();
            let _ = event_task.await;
            return Err(e);
        }

        info!("Opened ingestion connection for {}", device_id);

        Ok(Arc::new(HubConnection::new(
            device_id,
            client,
            inbound_rx,
            link,
            &self.settings,
            cancel,
            Some(event_task),
        )))
    }
}

/// Wait until the first session attempt has an outcome.
async fn first_session(link: &mut watch::Receiver<LinkState>) -> LinkState {
    match link.wait_for(|state| *state != LinkState::Connecting).await {
        Ok(state) => (*state).clone(),
        Err(_) => LinkState::Down("event loop stopped".into()),
    }
}

/// One device's session with the hub.
pub struct HubConnection {
    device_id: String,
    client: AsyncClient,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Publish>>,
    pending: Mutex<HashMap<u64, Publish>>,
    next_tag: AtomicU64,
    link: watch::Receiver<LinkState>,
    receive_window: Duration,
    send_timeout: Duration,
    cancel: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl HubConnection {
    fn new(
        device_id: &str,
        client: AsyncClient,
        inbound: mpsc::Receiver<Publish>,
        link: watch::Receiver<LinkState>,
        settings: &HubSettings,
        cancel: CancellationToken,
        event_task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            client,
            inbound: tokio::sync::Mutex::new(inbound),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            link,
            receive_window: settings.receive_window,
            send_timeout: settings.send_timeout,
            cancel,
            event_task: Mutex::new(event_task),
        }
    }
}

#[async_trait]
impl DeviceConnection for HubConnection {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), IngestionError> {
        if self.cancel.is_cancelled() {
            return Err(IngestionError::Closed);
        }
        let link = self.link.borrow().clone();
        match link {
            LinkState::Connected => {}
            LinkState::Down(reason) => return Err(IngestionError::NotConnected(reason)),
            LinkState::Connecting => {
                return Err(IngestionError::NotConnected("session not established".into()))
            }
        }

        let publish = self.client.publish(
            format!("devices/{}/messages/events/", self.device_id),
            QoS::AtLeastOnce,
            false,
            payload,
        );
        match tokio::time::timeout(self.send_timeout, publish).await {
            Ok(queued) => queued?,
            Err(_) => return Err(IngestionError::SendTimeout(self.send_timeout)),
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<CloudMessage>, IngestionError> {
        let mut inbound = self.inbound.lock().await;

        match tokio::time::timeout(self.receive_window, inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(IngestionError::Closed),
            Ok(Some(publish)) => {
                let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                let body = publish.payload.to_vec();
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(delivery_tag, publish);

                Ok(Some(CloudMessage { body, delivery_tag }))
            }
        }
    }

    async fn complete(&self, message: &CloudMessage) -> Result<(), IngestionError> {
        let publish = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message.delivery_tag)
            .ok_or(IngestionError::UnknownDelivery(message.delivery_tag))?;

        self.client.ack(&publish).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), IngestionError> {
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut task) = task else {
            self.cancel.cancel();
            return Ok(());
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request for {} not queued: {}", self.device_id, e);
        }

        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            self.cancel.cancel();
            let _ = task.await;
        }
        self.cancel.cancel();

        info!("Closed ingestion connection for {}", self.device_id);
        Ok(())
    }
}

async fn run_event_loop(
    monitor: LinkMonitor,
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<Publish>,
    cancel: CancellationToken,
) {
    let device_id = monitor.device_id.clone();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Cloud message for {} on {}", device_id, publish.topic);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = inbound.send(publish) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("Hub session for {} acknowledged: {:?}", device_id, ack.code);
                if ack.code == ConnectReturnCode::Success {
                    monitor.connected();
                } else {
                    monitor.lost(format!("refused: {:?}", ack.code));
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Hub session for {} disconnected", device_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Hub connection for {} failed: {}", device_id, e);
                monitor.lost(e.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }

    monitor.stopped();
    debug!("Event loop for {} stopped", device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingNotifier;
    use std::time::Instant;

    fn monitor(notifier: Arc<RecordingNotifier>) -> (LinkMonitor, watch::Receiver<LinkState>) {
        let (state, link) = watch::channel(LinkState::Connecting);
        (LinkMonitor::new("D1", state, notifier), link)
    }

    fn detached_connection(
        link: watch::Receiver<LinkState>,
        capacity: usize,
        send_timeout: Duration,
    ) -> (HubConnection, EventLoop) {
        let options = MqttOptions::new("D1", "hub.azure-devices.net", HUB_PORT);
        let (client, eventloop) = AsyncClient::new(options, capacity);
        let (_inbound_tx, inbound_rx) = mpsc::channel(1);
        let settings = HubSettings {
            send_timeout,
            ..HubSettings::default()
        };
        let connection = HubConnection::new(
            "D1",
            client,
            inbound_rx,
            link,
            &settings,
            CancellationToken::new(),
            None,
        );
        (connection, eventloop)
    }

    #[tokio::test]
    async fn test_open_fails_when_hub_unreachable() {
        let notifier = Arc::new(RecordingNotifier::default());
        let connector = HubConnector::new(
            HubSettings {
                connect_timeout: Duration::from_secs(3),
                ..HubSettings::default()
            },
            notifier,
        );

        let started = Instant::now();
        let result = connector
            .open(&ConnectionString::for_device("127.0.0.1", "D1", "a2V5"))
            .await;

        assert!(matches!(
            result,
            Err(IngestionError::Connect { .. }) | Err(IngestionError::ConnectTimeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_send_fails_fast_while_session_down() {
        let (_state, link) = watch::channel(LinkState::Down("connection refused".into()));
        let (connection, _eventloop) = detached_connection(link, 10, Duration::from_secs(30));

        for _ in 0..20 {
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                connection.send(b"x".to_vec()),
            )
            .await
            .expect("send returns promptly");
            assert!(matches!(result, Err(IngestionError::NotConnected(_))));
        }
    }

    #[tokio::test]
    async fn test_send_times_out_when_queue_is_full() {
        let (_state, link) = watch::channel(LinkState::Connected);
        let (connection, _eventloop) = detached_connection(link, 1, Duration::from_millis(50));

        connection.send(b"first".to_vec()).await.expect("queued");
        let result = connection.send(b"second".to_vec()).await;

        assert!(matches!(result, Err(IngestionError::SendTimeout(_))));
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (_state, link) = watch::channel(LinkState::Connected);
        let (connection, _eventloop) = detached_connection(link, 10, Duration::from_secs(1));

        connection.close().await.expect("close");

        assert!(matches!(
            connection.send(b"x".to_vec()).await,
            Err(IngestionError::Closed)
        ));
    }

    #[test]
    fn test_lost_and_restored_session_is_notified_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (monitor, link) = monitor(notifier.clone());

        // a failed first attempt is reported by open, not here
        monitor.lost("connection refused".into());
        assert!(notifier.lines().is_empty());

        monitor.connected();
        assert!(notifier.lines().is_empty());
        assert_eq!(*link.borrow(), LinkState::Connected);

        monitor.lost("keep alive timeout".into());
        monitor.lost("connection refused".into());
        monitor.connected();

        assert_eq!(
            notifier.lines(),
            vec![
                "Ingestion connection for D1 lost: keep alive timeout".to_string(),
                "Ingestion connection for D1 restored".to_string(),
            ]
        );
    }
}
