use chrono::{DateTime, Local};
use rumqttc::Publish;
use std::fmt;

/// Uplink delivery taken off the broker event loop.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InboundUplink {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundUplink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(32).collect();
        write!(
            f,
            "{} - {} ({} bytes): {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            self.payload.len(),
            preview
        )
    }
}

impl InboundUplink {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            received_at: Local::now(),
        }
    }
}
