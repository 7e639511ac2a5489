//! Per-device connection pool.
//!
//! Connections are opened lazily on the first `get` for a device and
//! reclaimed by an idle sweep. Each device owns a slot with its own async
//! lock: opening, refreshing and tearing down one device are serialized on
//! that lock, while the map itself is only locked for the insert/remove step
//! and never across an `.await`.
//!
//! ```text
//! get(id) ──► slots[id] ──► lock slot ──► Live?   ── refresh, return
//!                                     └─► Vacant? ── open + spawn receiver
//!                                     └─► Retired? ─ slot was evicted, retry
//! ```

pub mod receiver;

use crate::bridge::downlink::DownlinkEnvelope;
use crate::ingestion::connection_string::ConnectionString;
use crate::ingestion::{DeviceConnection, DeviceConnector, IngestionError};
use crate::notify::Notifier;
use receiver::ReceiveLoopHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    /// Opening the device connection failed; nothing was pooled.
    #[error("Failed to open connection for {device_id}: {source}")]
    Open {
        device_id: String,
        #[source]
        source: IngestionError,
    },
}

/// Source of "now" for activity stamps and sweep decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Fully qualified ingestion host used in device connection strings.
    pub ingestion_host: String,
    pub idle_threshold: Duration,
    /// Minimum time between two sweeps triggered from `get`.
    pub idle_check_interval: Duration,
    /// Pause between two receive waits of one device.
    pub receive_pause: Duration,
    pub silent_removal: bool,
}

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub size_before: usize,
    pub removed: usize,
    pub size_after: usize,
}

struct PooledConnection {
    connection: Arc<dyn DeviceConnection>,
    receiver: ReceiveLoopHandle,
    last_activity: Instant,
}

enum SlotState {
    /// Inserted, connection not opened yet (or open in progress).
    Vacant,
    Live(PooledConnection),
    /// Torn down and detached from the map.
    Retired,
}

struct DeviceSlot {
    state: tokio::sync::Mutex<SlotState>,
}

struct PoolInner {
    settings: PoolSettings,
    connector: Arc<dyn DeviceConnector>,
    downlinks: mpsc::Sender<DownlinkEnvelope>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Arc<DeviceSlot>>>,
    last_sweep: Mutex<Instant>,
}

/// Shared handle to the pool; clones refer to the same pool.
#[derive(Clone)]
pub struct DeviceConnectionPool {
    inner: Arc<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceConnectionPool {
    pub fn new(
        settings: PoolSettings,
        connector: Arc<dyn DeviceConnector>,
        downlinks: mpsc::Sender<DownlinkEnvelope>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_clock(settings, connector, downlinks, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: PoolSettings,
        connector: Arc<dyn DeviceConnector>,
        downlinks: mpsc::Sender<DownlinkEnvelope>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(PoolInner {
                settings,
                connector,
                downlinks,
                notifier,
                clock,
                slots: Mutex::new(HashMap::new()),
                last_sweep: Mutex::new(now),
            }),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, device_id: &str) -> bool {
        lock(&self.inner.slots).contains_key(device_id)
    }

    /// Return the device's connection, opening it on first use.
    ///
    /// Concurrent calls for the same device share one connection. Every call
    /// refreshes the device's activity stamp and may trigger a background
    /// idle sweep.
    pub async fn get(
        &self,
        device_id: &str,
        credential: &str,
    ) -> Result<Arc<dyn DeviceConnection>, PoolError> {
        let connection = loop {
            let slot = self.slot_for(device_id);
            let mut state = slot.state.lock().await;

            if let SlotState::Live(entry) = &mut *state {
                entry.last_activity = self.inner.clock.now();
                break entry.connection.clone();
            }
            if matches!(*state, SlotState::Retired) {
                // evicted between map lookup and slot lock; the map no longer holds it
                continue;
            }

            match self.open_entry(device_id, credential).await {
                Ok(entry) => {
                    let connection = entry.connection.clone();
                    *state = SlotState::Live(entry);
                    break connection;
                }
                Err(e) => {
                    *state = SlotState::Retired;
                    self.detach(device_id, &slot);
                    drop(state);
                    self.inner
                        .notifier
                        .line(&format!("Opening connection for {} failed: {}", device_id, e));
                    return Err(e);
                }
            }
        };

        self.maybe_sweep();
        Ok(connection)
    }

    fn slot_for(&self, device_id: &str) -> Arc<DeviceSlot> {
        lock(&self.inner.slots)
            .entry(device_id.to_string())
            .or_insert_with(|| {
                Arc::new(DeviceSlot {
                    state: tokio::sync::Mutex::new(SlotState::Vacant),
                })
            })
            .clone()
    }

    /// Remove `slot` from the map unless it has already been replaced.
    fn detach(&self, device_id: &str, slot: &Arc<DeviceSlot>) {
        let mut slots = lock(&self.inner.slots);
        if slots
            .get(device_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(device_id);
        }
    }

    async fn open_entry(
        &self,
        device_id: &str,
        credential: &str,
    ) -> Result<PooledConnection, PoolError> {
        let connection_string =
            ConnectionString::for_device(&self.inner.settings.ingestion_host, device_id, credential);

        let connection = self
            .inner
            .connector
            .open(&connection_string)
            .await
            .map_err(|source| PoolError::Open {
                device_id: device_id.to_string(),
                source,
            })?;

        let receiver = ReceiveLoopHandle::spawn(
            connection.clone(),
            self.inner.downlinks.clone(),
            self.inner.notifier.clone(),
            self.inner.settings.receive_pause,
        );

        info!(device_id = %device_id, "Pooled new ingestion connection");
        self.inner
            .notifier
            .line(&format!("Device {} connected", device_id));

        Ok(PooledConnection {
            connection,
            receiver,
            last_activity: self.inner.clock.now(),
        })
    }

    fn maybe_sweep(&self) {
        let now = self.inner.clock.now();
        {
            let mut last_sweep = lock(&self.inner.last_sweep);
            if now.saturating_duration_since(*last_sweep) < self.inner.settings.idle_check_interval {
                return;
            }
            *last_sweep = now;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            pool.sweep_idle().await;
        });
    }

    /// Tear down every entry idle for longer than the threshold.
    ///
    /// Iterates a snapshot of the keys, so entries added during the sweep
    /// are left alone and each stale entry is visited once.
    pub async fn sweep_idle(&self) -> SweepReport {
        let now = self.inner.clock.now();
        let snapshot: Vec<String> = lock(&self.inner.slots).keys().cloned().collect();
        let size_before = snapshot.len();

        self.inner
            .notifier
            .line(&format!("Sweep started, size={}", size_before));

        let mut removed = 0;
        for device_id in snapshot {
            let Some(slot) = lock(&self.inner.slots).get(&device_id).cloned() else {
                continue;
            };

            let mut state = slot.state.lock().await;
            let stale = match &*state {
                SlotState::Live(entry) => {
                    now.saturating_duration_since(entry.last_activity)
                        > self.inner.settings.idle_threshold
                }
                _ => false,
            };
            if !stale {
                continue;
            }

            if let SlotState::Live(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
                self.teardown(&device_id, entry).await;
            }
            self.detach(&device_id, &slot);
            drop(state);

            removed += 1;
            self.notify_removal(&device_id);
        }

        let size_after = self.len();
        self.inner
            .notifier
            .line(&format!("Sweep finished, size={}", size_after));

        SweepReport {
            size_before,
            removed,
            size_after,
        }
    }

    /// Close every pooled connection. Returns the number of entries torn down.
    pub async fn shutdown(&self) -> usize {
        let slots: Vec<(String, Arc<DeviceSlot>)> =
            lock(&self.inner.slots).drain().collect();

        let mut closed = 0;
        for (device_id, slot) in slots {
            let mut state = slot.state.lock().await;
            if let SlotState::Live(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
                self.teardown(&device_id, entry).await;
                closed += 1;
            }
        }

        info!("Connection pool shut down, {} connections closed", closed);
        closed
    }

    /// Stop the receive loop, then close the connection.
    async fn teardown(&self, device_id: &str, mut entry: PooledConnection) {
        entry.receiver.shutdown().await;

        if let Err(e) = entry.connection.close().await {
            warn!(device_id = %device_id, "Closing pooled connection failed: {}", e);
            self.inner
                .notifier
                .line(&format!("Closing connection for {} failed: {}", device_id, e));
        }
    }

    fn notify_removal(&self, device_id: &str) {
        debug!(device_id = %device_id, "Removed idle connection");
        if !self.inner.settings.silent_removal {
            self.inner.notifier.line(&format!("Removed {}", device_id));
        }
    }
}
