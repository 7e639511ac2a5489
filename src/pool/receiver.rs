//! Per-device cloud-to-device receive loop.
//!
//! One loop per pooled connection. Every received message is forwarded to
//! the downlink channel, then completed, then the loop pauses before the
//! next wait. Cancellation interrupts both the wait and the pause.

use crate::bridge::downlink::DownlinkEnvelope;
use crate::ingestion::{DeviceConnection, IngestionError};
use crate::notify::Notifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) struct ReceiveLoopHandle {
    device_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReceiveLoopHandle {
    pub(crate) fn spawn(
        connection: Arc<dyn DeviceConnection>,
        downlinks: mpsc::Sender<DownlinkEnvelope>,
        notifier: Arc<dyn Notifier>,
        pause: Duration,
    ) -> Self {
        let device_id = connection.device_id().to_string();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_receive_loop(
            device_id.clone(),
            connection,
            downlinks,
            notifier,
            pause,
            cancel.clone(),
        ));

        Self {
            device_id,
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the loop and wait until it has exited.
    pub(crate) async fn shutdown(&mut self) {
        self.cancel.cancel();

        let Some(task) = self.task.take() else {
            debug!("Receive loop for {} already stopped", self.device_id);
            return;
        };

        if let Err(e) = task.await {
            error!("Receive loop for {} panicked: {}", self.device_id, e);
        }
    }
}

impl Drop for ReceiveLoopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_receive_loop(
    device_id: String,
    connection: Arc<dyn DeviceConnection>,
    downlinks: mpsc::Sender<DownlinkEnvelope>,
    notifier: Arc<dyn Notifier>,
    pause: Duration,
    cancel: CancellationToken,
) {
    debug!("Receive loop for {} started", device_id);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = connection.receive() => received,
        };

        match received {
            Ok(Some(message)) => {
                let envelope = DownlinkEnvelope {
                    device_id: device_id.clone(),
                    payload: message.body.clone(),
                };

                let forwarded = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = downlinks.send(envelope) => sent.is_ok(),
                };
                if !forwarded {
                    warn!("Downlink channel closed, stopping receive loop for {}", device_id);
                    break;
                }

                if let Err(e) = connection.complete(&message).await {
                    warn!("Completing cloud message for {} failed: {}", device_id, e);
                    notifier.line(&format!("Completing message for {} failed: {}", device_id, e));
                }
            }
            Ok(None) => {}
            Err(IngestionError::Closed) => {
                notifier.line(&format!("Receiving for {} stopped: connection closed", device_id));
                break;
            }
            Err(e) => {
                warn!("Receive for {} failed: {}", device_id, e);
                notifier.line(&format!("Receiving for {} failed: {}", device_id, e));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!("Receive loop for {} stopped", device_id);
}
