//! In-memory fakes for unit tests.

use crate::directory::{DeviceDirectory, DeviceRecord, DeviceStatus, DirectoryError};
use crate::ingestion::connection_string::ConnectionString;
use crate::ingestion::{CloudMessage, DeviceConnection, DeviceConnector, IngestionError};
use crate::mqtt::{BrokerError, BrokerPublisher, PublishReceipt};
use crate::notify::Notifier;
use crate::pool::Clock;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Network-server uplink wrapping `payload_fields`, padded past the
/// minimum uplink size. `Value::Null` leaves `payload_fields` out.
pub(crate) fn uplink_payload(payload_fields: Value) -> Vec<u8> {
    let mut message = json!({
        "app_id": "app",
        "dev_id": "D1",
        "hardware_serial": "0004A30B001C0530",
        "port": 1,
        "counter": 7,
        "payload_raw": "AQIDBAUGBwgJCgsMDQ4PEA==",
        "metadata": {
            "time": "2019-05-01T12:00:00.000000000Z",
            "frequency": 868.5,
            "modulation": "LORA",
            "data_rate": "SF7BW125",
            "coding_rate": "4/5",
            "gateways": [
                {"gtw_id": "eui-gw", "timestamp": 1, "channel": 0, "rssi": -80, "snr": 9.5, "latitude": 52.5, "longitude": 4.25}
            ]
        }
    });
    if !payload_fields.is_null() {
        message["payload_fields"] = payload_fields;
    }
    serde_json::to_vec(&message).unwrap()
}

#[derive(Default)]
pub(crate) struct MemoryDirectory {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    failure: Mutex<Option<u16>>,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryDirectory {
    fn record(device_id: &str, status: DeviceStatus) -> DeviceRecord {
        DeviceRecord {
            device_id: device_id.to_string(),
            status,
            primary_key: format!("{}-primary", device_id),
            secondary_key: format!("{}-secondary", device_id),
        }
    }

    pub(crate) fn insert_disabled(&self, device_id: &str) {
        self.devices.lock().unwrap().insert(
            device_id.to_string(),
            Self::record(device_id, DeviceStatus::Disabled),
        );
    }

    /// Every call fails with this HTTP status from now on.
    pub(crate) fn fail_with_status(&self, status: u16) {
        *self.failure.lock().unwrap() = Some(status);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    fn check_failure(&self) -> Result<(), DirectoryError> {
        match *self.failure.lock().unwrap() {
            Some(status) => Err(DirectoryError::Status {
                status,
                body: "injected".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn create_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check_failure()?;

        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(device_id) {
            return Err(DirectoryError::AlreadyExists(device_id.to_string()));
        }
        let record = Self::record(device_id, DeviceStatus::Enabled);
        devices.insert(device_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get_device(&self, device_id: &str) -> Result<DeviceRecord, DirectoryError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check_failure()?;

        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(device_id.to_string()))
    }
}

pub(crate) struct MockConnection {
    device_id: String,
    inbound_tx: mpsc::UnboundedSender<CloudMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CloudMessage>>,
    next_tag: AtomicU64,
    sent: Mutex<Vec<Vec<u8>>>,
    completed: Mutex<Vec<u64>>,
    fail_sends: AtomicBool,
    fail_receives: AtomicBool,
    hang_receives: AtomicBool,
    fail_completes: AtomicBool,
    receive_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockConnection {
    pub(crate) fn new(device_id: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            device_id: device_id.to_string(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            next_tag: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_receives: AtomicBool::new(false),
            hang_receives: AtomicBool::new(false),
            fail_completes: AtomicBool::new(false),
            receive_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Every receive fails as if the session were down.
    pub(crate) fn fail_receives(&self) {
        self.fail_receives.store(true, Ordering::SeqCst);
    }

    /// Every receive waits forever.
    pub(crate) fn hang_receives(&self) {
        self.hang_receives.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_completes(&self) {
        self.fail_completes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn id(&self) -> &str {
        &self.device_id
    }

    /// Queue a cloud-to-device message; returns its delivery tag.
    pub(crate) fn push_cloud_message(&self, body: Vec<u8>) -> u64 {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.inbound_tx
            .send(CloudMessage { body, delivery_tag })
            .unwrap();
        delivery_tag
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn completed(&self) -> Vec<u64> {
        self.completed.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnection for MockConnection {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), IngestionError> {
        if self.is_closed() {
            return Err(IngestionError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(IngestionError::UnknownDelivery(0));
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<CloudMessage>, IngestionError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_receives.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_receives.load(Ordering::SeqCst) {
            return Err(IngestionError::NotConnected("injected".into()));
        }
        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(20), inbound.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Ok(None),
        }
    }

    async fn complete(&self, message: &CloudMessage) -> Result<(), IngestionError> {
        if self.fail_completes.load(Ordering::SeqCst) {
            return Err(IngestionError::UnknownDelivery(message.delivery_tag));
        }
        self.completed.lock().unwrap().push(message.delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), IngestionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    open_delay: Option<Duration>,
    fail_opens: bool,
    fail_sends: AtomicBool,
    opened: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    /// Widen the open window so concurrent callers overlap.
    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail_opens = true;
        self
    }

    /// Connections opened from now on reject every send.
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub(crate) fn opened_strings(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn open(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Arc<dyn DeviceConnection>, IngestionError> {
        self.opened
            .lock()
            .unwrap()
            .push(connection_string.to_string());

        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_opens {
            return Err(IngestionError::Closed);
        }

        let device_id = connection_string.require("DeviceId")?;
        let connection = Arc::new(MockConnection::new(device_id));
        connection
            .fail_sends
            .store(self.fail_sends.load(Ordering::SeqCst), Ordering::SeqCst);
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
pub(crate) struct RecordingBroker {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    next_id: AtomicU64,
}

impl RecordingBroker {
    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerPublisher for RecordingBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(PublishReceipt { id })
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    traces: Mutex<Vec<String>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn traces(&self) -> Vec<String> {
        self.traces.lock().unwrap().clone()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub(crate) fn has_line(&self, text: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l == text)
    }
}

impl Notifier for RecordingNotifier {
    fn trace(&self, text: &str) {
        self.traces.lock().unwrap().push(text.to_string());
    }

    fn line(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

/// Clock that only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
