//! Notification sink for operator-facing status text.
//!
//! The bridge reports every drop/accept decision and every connection
//! lifecycle event through two channels: `trace` carries inline fragments
//! (a line is built from several of them), `line` carries complete status
//! lines. How they are rendered is up to the sink.

use tracing::{debug, info};

/// Caller-supplied sink for bridge notifications.
pub trait Notifier: Send + Sync {
    /// Inline trace fragment.
    fn trace(&self, text: &str);

    /// Complete status line.
    fn line(&self, text: &str);
}

/// Renders notifications as `tracing` events on the `notify` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn trace(&self, text: &str) {
        debug!(target: "notify", "{}", text);
    }

    fn line(&self, text: &str) {
        info!(target: "notify", "{}", text);
    }
}
