//! Merges optimistic local lamp commands with whatever the devices report.
//!
//! Each device is `Unknown`, pending a command, or confirmed. The table lives
//! behind one async mutex that is never held across transport I/O; every
//! visible change goes out on a broadcast channel of [`PanelEvent`]s.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError, Weak,
    },
    time::Duration,
};

use futures::StreamExt;
use shared::{
    domain::{DeviceKey, LampState, SwitchAction},
    protocol::{DeviceSnapshot, FailureReason, PanelEvent, PanelSnapshot},
    registry::DeviceRegistry,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use transport::{Delivery, DeviceTransport, TransportError};

const EVENT_BUFFER: usize = 1024;
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReconcileError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ReconcileError::Transport(err) => err.failure_reason(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// How long a command may wait for confirmation before it is reverted.
    pub pending_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

/// Result of a lamp command that reached (or did not need) the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The lamp was already confirmed in the requested state; nothing was sent.
    Unchanged(SwitchAction),
    /// The device confirmed this state in its reply.
    Confirmed(SwitchAction),
    /// Sent; the requested state is displayed until a confirmation arrives.
    Dispatched(SwitchAction),
    /// Sent, but a newer command for the device was issued before the reply
    /// came back, so the reply was discarded.
    Superseded(SwitchAction),
}

impl Outcome {
    /// Whether a command actually went out to the device.
    pub fn dispatched(self) -> bool {
        !matches!(self, Outcome::Unchanged(_))
    }

    pub fn state(self) -> SwitchAction {
        match self {
            Outcome::Unchanged(state)
            | Outcome::Confirmed(state)
            | Outcome::Dispatched(state)
            | Outcome::Superseded(state) => state,
        }
    }
}

/// A command together with the action the caller asked for. For a toggle the
/// request is resolved against the displayed state at issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    pub requested: SwitchAction,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Set(SwitchAction),
    Toggle,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Reply(u64),
    Feed,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    command: u64,
    desired: SwitchAction,
}

#[derive(Debug, Default)]
struct Entry {
    confirmed: Option<SwitchAction>,
    pending: Option<Pending>,
    /// Most recent command issued for this device, pending or not.
    latest_command: Option<u64>,
}

impl Entry {
    fn displayed(&self) -> Option<SwitchAction> {
        self.pending.map(|pending| pending.desired).or(self.confirmed)
    }

    fn snapshot(&self, device: DeviceKey) -> DeviceSnapshot {
        DeviceSnapshot {
            device,
            state: LampState::from(self.displayed()),
            pending: self.pending.map(|pending| pending.desired),
        }
    }
}

pub struct StateReconciler {
    transport: Arc<dyn DeviceTransport>,
    devices: Vec<DeviceKey>,
    table: Mutex<HashMap<DeviceKey, Entry>>,
    events: broadcast::Sender<PanelEvent>,
    next_command: AtomicU64,
    config: ReconcilerConfig,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StateReconciler {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        registry: &DeviceRegistry,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            transport,
            devices: registry.devices().collect(),
            table: Mutex::new(HashMap::new()),
            events,
            next_command: AtomicU64::new(1),
            config,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn devices(&self) -> &[DeviceKey] {
        &self.devices
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    /// Sends an event to every subscriber. Used by callers layered on top
    /// (audit log notifications) so renderers need a single feed.
    pub fn publish(&self, event: PanelEvent) {
        let _ = self.events.send(event);
    }

    /// Starts consuming transport observations and connection changes.
    pub fn start(self: &Arc<Self>) {
        let mut observations = self.transport.subscribe();
        let weak = Arc::downgrade(self);
        let feed_task = tokio::spawn(async move {
            while let Some(observation) = observations.next().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.apply(observation.device, observation.state, Origin::Feed)
                    .await;
            }
            debug!("observation stream ended");
        });

        let mut status = self.transport.watch_connection();
        let weak: Weak<Self> = Arc::downgrade(self);
        let status_task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.publish(PanelEvent::ConnectionChanged { status: current });
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([feed_task, status_task]);
    }

    /// Stops the background tasks started by [`StateReconciler::start`].
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    pub async fn issue(
        self: &Arc<Self>,
        device: DeviceKey,
        desired: SwitchAction,
    ) -> Result<Outcome, ReconcileError> {
        self.request(device, Some(desired))
            .await
            .map(|issued| issued.outcome)
    }

    /// Flips the displayed state. An unknown lamp is switched on.
    pub async fn toggle(self: &Arc<Self>, device: DeviceKey) -> Result<Outcome, ReconcileError> {
        self.request(device, None).await.map(|issued| issued.outcome)
    }

    /// Sets the lamp to `desired`, or toggles it when `None`, and reports
    /// which action was requested.
    pub async fn request(
        self: &Arc<Self>,
        device: DeviceKey,
        desired: Option<SwitchAction>,
    ) -> Result<Issued, ReconcileError> {
        let intent = desired.map_or(Intent::Toggle, Intent::Set);
        self.dispatch(device, intent).await
    }

    async fn dispatch(
        self: &Arc<Self>,
        device: DeviceKey,
        intent: Intent,
    ) -> Result<Issued, ReconcileError> {
        let (command, desired) = {
            let mut table = self.table.lock().await;
            let entry = table.entry(device).or_default();
            let desired = match intent {
                Intent::Set(desired) => desired,
                Intent::Toggle => entry
                    .displayed()
                    .map(SwitchAction::toggled)
                    .unwrap_or(SwitchAction::On),
            };
            if entry.pending.is_none() && entry.confirmed == Some(desired) {
                debug!(%device, %desired, "lamp already confirmed in requested state");
                return Ok(Issued {
                    requested: desired,
                    outcome: Outcome::Unchanged(desired),
                });
            }
            let command = self.next_command.fetch_add(1, Ordering::Relaxed);
            entry.pending = Some(Pending { command, desired });
            entry.latest_command = Some(command);
            self.publish(PanelEvent::StateChanged {
                snapshot: entry.snapshot(device),
            });
            (command, desired)
        };

        self.arm_timeout(device, command);
        info!(%device, %desired, command, "dispatching lamp command");

        let outcome = match self.transport.send(device, desired).await {
            Ok(Delivery::Confirmed(observed)) => {
                self.apply(device, observed, Origin::Reply(command)).await
            }
            Ok(Delivery::Dispatched) => Outcome::Dispatched(desired),
            Err(err) => {
                self.fail(device, command, desired, &err).await;
                return Err(err.into());
            }
        };
        Ok(Issued {
            requested: desired,
            outcome,
        })
    }

    /// Applies a state reported by the device outside of a command reply.
    pub async fn confirm(&self, device: DeviceKey, observed: SwitchAction) {
        self.apply(device, observed, Origin::Feed).await;
    }

    async fn apply(&self, device: DeviceKey, observed: SwitchAction, origin: Origin) -> Outcome {
        let mut table = self.table.lock().await;
        let entry = table.entry(device).or_default();

        if let Origin::Reply(command) = origin {
            if entry.latest_command != Some(command) {
                debug!(%device, %observed, command, "discarding reply for superseded command");
                return Outcome::Superseded(observed);
            }
        }

        let before = entry.snapshot(device);
        if let Some(pending) = entry.pending.take() {
            if pending.desired != observed {
                warn!(
                    %device,
                    expected = %pending.desired,
                    %observed,
                    "device reported a different state than requested"
                );
                self.publish(PanelEvent::Discrepancy {
                    device,
                    expected: pending.desired,
                    observed,
                });
            }
        }
        entry.confirmed = Some(observed);

        let after = entry.snapshot(device);
        if after != before {
            self.publish(PanelEvent::StateChanged { snapshot: after });
        }
        Outcome::Confirmed(observed)
    }

    async fn fail(&self, device: DeviceKey, command: u64, desired: SwitchAction, err: &TransportError) {
        warn!(%device, %desired, command, %err, "lamp command failed");
        // Already reverted by the pending timeout, which reported its own failure.
        if !self.revert(device, command).await {
            return;
        }
        self.publish(PanelEvent::CommandFailed {
            device,
            desired,
            reason: err.failure_reason(),
            message: err.to_string(),
        });
    }

    /// Drops the pending command if it is still `command`. Returns whether it
    /// was.
    async fn revert(&self, device: DeviceKey, command: u64) -> bool {
        let mut table = self.table.lock().await;
        let entry = table.entry(device).or_default();
        if entry.pending.map(|pending| pending.command) != Some(command) {
            return false;
        }
        entry.pending = None;
        self.publish(PanelEvent::StateChanged {
            snapshot: entry.snapshot(device),
        });
        true
    }

    fn arm_timeout(self: &Arc<Self>, device: DeviceKey, command: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.pending_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            let desired = {
                let table = this.table.lock().await;
                table
                    .get(&device)
                    .and_then(|entry| entry.pending)
                    .filter(|pending| pending.command == command)
                    .map(|pending| pending.desired)
            };
            let Some(desired) = desired else {
                return;
            };
            if this.revert(device, command).await {
                warn!(%device, %desired, command, ?timeout, "lamp command was never confirmed");
                this.publish(PanelEvent::CommandFailed {
                    device,
                    desired,
                    reason: FailureReason::Timeout,
                    message: format!("no confirmation within {timeout:?}"),
                });
            }
        });
    }

    pub async fn state(&self, device: DeviceKey) -> DeviceSnapshot {
        let table = self.table.lock().await;
        table
            .get(&device)
            .map(|entry| entry.snapshot(device))
            .unwrap_or(DeviceSnapshot {
                device,
                state: LampState::Unknown,
                pending: None,
            })
    }

    pub async fn snapshot(&self) -> PanelSnapshot {
        let table = self.table.lock().await;
        let devices = self
            .devices
            .iter()
            .map(|device| {
                table
                    .get(device)
                    .map(|entry| entry.snapshot(*device))
                    .unwrap_or(DeviceSnapshot {
                        device: *device,
                        state: LampState::Unknown,
                        pending: None,
                    })
            })
            .collect();
        PanelSnapshot {
            connection: self.transport.connection_status(),
            devices,
        }
    }

    /// Reads every device once and applies what comes back. Returns the first
    /// read error after trying all devices.
    pub async fn refresh(&self) -> Result<usize, ReconcileError> {
        let mut applied = 0;
        let mut first_error = None;
        for device in &self.devices {
            match self.transport.read(*device).await {
                Ok(Some(state)) => {
                    self.apply(*device, state, Origin::Feed).await;
                    applied += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%device, %err, "lamp state probe failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(applied),
        }
    }
}

impl Drop for StateReconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
