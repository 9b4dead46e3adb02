//! Transport adapters that carry lamp commands to devices and bring state
//! observations back.
//!
//! All variants sit behind [`DeviceTransport`]. Which one runs is a
//! configuration choice ([`TransportMode`]), not a separate code path.

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{DeviceKey, SwitchAction},
    protocol::{ConnectionStatus, FailureReason},
    registry::{DeviceRegistry, DEFAULT_BASE_TOPIC},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};
use url::Url;

pub mod broadcast_mode;
pub mod direct;
pub mod simulated;

pub use broadcast_mode::{BroadcastConfig, BroadcastTransport};
pub use direct::{DirectConfig, DirectTransport};
pub use simulated::{Confirmation, SimulatedTransport};

const OBSERVATION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("device rejected command: {0}")]
    Rejected(String),
    #[error("invalid transport configuration: {0}")]
    Config(String),
}

impl TransportError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            TransportError::Timeout(_) => FailureReason::Timeout,
            TransportError::Rejected(_) => FailureReason::Rejected,
            TransportError::Connection(_) | TransportError::Config(_) => {
                FailureReason::Connection
            }
        }
    }
}

/// A device reporting its state, whether or not anyone asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub device: DeviceKey,
    pub state: SwitchAction,
}

/// How a successful `send` was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The reply to the command carried the device's new state.
    Confirmed(SwitchAction),
    /// Handed to the channel; confirmation, if any, arrives via `subscribe`.
    Dispatched,
}

pub type ObservationStream = Pin<Box<dyn Stream<Item = Observation> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Direct,
    Broadcast,
    Simulated,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Fails fast with `Connection` when the channel is down; never queues.
    async fn send(
        &self,
        device: DeviceKey,
        desired: SwitchAction,
    ) -> Result<Delivery, TransportError>;

    /// Best known state of the device, `None` if it has not reported yet.
    async fn read(&self, device: DeviceKey) -> Result<Option<SwitchAction>, TransportError>;

    /// Observations in arrival order. The stream ends once the transport is
    /// closed and cannot be restarted.
    fn subscribe(&self) -> ObservationStream;

    fn connection_status(&self) -> ConnectionStatus;

    fn watch_connection(&self) -> watch::Receiver<ConnectionStatus>;

    async fn close(&self);
}

/// Fan-out of observations and connection status shared by every adapter.
pub(crate) struct Feed {
    observations: Mutex<Option<broadcast::Sender<Observation>>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Feed {
    pub(crate) fn new(initial: ConnectionStatus) -> Self {
        let (observations, _) = broadcast::channel(OBSERVATION_BUFFER);
        let (status, _) = watch::channel(initial);
        Self {
            observations: Mutex::new(Some(observations)),
            status,
        }
    }

    pub(crate) fn publish(&self, observation: Observation) {
        let guard = self
            .observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(observation);
        }
    }

    pub(crate) fn subscribe(&self) -> ObservationStream {
        let receiver = self
            .observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe);
        match receiver {
            Some(rx) => Box::pin(tokio_stream::StreamExt::filter_map(
                BroadcastStream::new(rx),
                |item| match item {
                    Ok(observation) => Some(observation),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "observation subscriber lagged; dropping oldest");
                        None
                    }
                },
            )),
            None => Box::pin(futures::stream::empty()),
        }
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(status = ?next, "transport connection status changed");
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Connection("transport is closed".into()))
        } else {
            Ok(())
        }
    }

    /// Ends every open subscription. Later subscribers get an empty stream.
    pub(crate) fn close(&self) {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_status(ConnectionStatus::Offline);
    }
}

/// Transport section of the panel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub mode: TransportMode,
    pub base_topic: String,
    /// Per-device topic/path segment overrides, e.g. `kitchen = "dapur"`.
    pub devices: BTreeMap<DeviceKey, String>,
    pub bridge_url: String,
    pub request_timeout_ms: u64,
    /// Zero disables background read probes in direct mode.
    pub poll_interval_ms: u64,
    pub broker_url: String,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub client_id_prefix: String,
    pub reconnect_period_ms: u64,
    pub keep_alive_secs: u64,
    pub simulated_delay_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            mode: TransportMode::Simulated,
            base_topic: DEFAULT_BASE_TOPIC.into(),
            devices: BTreeMap::new(),
            bridge_url: "http://192.168.1.166".into(),
            request_timeout_ms: 5_000,
            poll_interval_ms: 0,
            broker_url: "mqtt://127.0.0.1:1883".into(),
            broker_username: None,
            broker_password: None,
            client_id_prefix: "lamp_panel_".into(),
            reconnect_period_ms: 3_000,
            keep_alive_secs: 30,
            simulated_delay_ms: 150,
        }
    }
}

impl TransportSettings {
    pub fn registry(&self) -> DeviceRegistry {
        self.devices
            .iter()
            .fold(DeviceRegistry::new(&self.base_topic), |registry, (key, segment)| {
                registry.with_segment(*key, segment.as_str())
            })
    }

    pub fn direct_config(&self) -> Result<DirectConfig, TransportError> {
        let bridge_url = Url::parse(&self.bridge_url).map_err(|err| {
            TransportError::Config(format!("bridge_url '{}': {err}", self.bridge_url))
        })?;
        Ok(DirectConfig {
            bridge_url,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            poll_interval: (self.poll_interval_ms > 0)
                .then(|| Duration::from_millis(self.poll_interval_ms)),
        })
    }

    pub fn broadcast_config(&self) -> Result<BroadcastConfig, TransportError> {
        let broker = Url::parse(&self.broker_url).map_err(|err| {
            TransportError::Config(format!("broker_url '{}': {err}", self.broker_url))
        })?;
        Ok(BroadcastConfig {
            broker,
            username: self.broker_username.clone(),
            password: self.broker_password.clone(),
            client_id_prefix: self.client_id_prefix.clone(),
            reconnect_period: Duration::from_millis(self.reconnect_period_ms),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(5)),
            send_timeout: Duration::from_millis(self.request_timeout_ms),
        })
    }
}

/// Builds the configured adapter. Must run inside a tokio runtime because the
/// broadcast and polling variants spawn background tasks.
pub fn connect(settings: &TransportSettings) -> Result<Arc<dyn DeviceTransport>, TransportError> {
    let registry = settings.registry();
    info!(mode = ?settings.mode, base_topic = registry.base_topic(), "starting transport");
    match settings.mode {
        TransportMode::Direct => {
            let transport = DirectTransport::new(settings.direct_config()?, registry)?;
            transport.start_polling();
            Ok(transport)
        }
        TransportMode::Broadcast => {
            let transport = BroadcastTransport::connect(settings.broadcast_config()?, registry)?;
            Ok(transport)
        }
        TransportMode::Simulated => Ok(SimulatedTransport::new(Confirmation::Delayed(
            Duration::from_millis(settings.simulated_delay_ms),
        ))),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
