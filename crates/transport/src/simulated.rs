//! In-process lamps for demos and tests. Behaves like a bridge whose
//! confirmation style, reachability and stuck relays can be scripted.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{DeviceKey, SwitchAction},
    protocol::ConnectionStatus,
};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    Delivery, DeviceTransport, Feed, Observation, ObservationStream, TransportError,
    TransportMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Reply to `send` carries the new state, like the HTTP bridge.
    Reply,
    /// State is published on the observation feed after a delay, like a
    /// device answering on its status topic.
    Delayed(Duration),
    /// The command is accepted and nothing ever confirms it.
    Silent,
}

#[derive(Default)]
struct Lamps {
    states: HashMap<DeviceKey, SwitchAction>,
    /// Relays that report this state whatever they are told.
    stuck: HashMap<DeviceKey, SwitchAction>,
    sent: Vec<(DeviceKey, SwitchAction)>,
}

pub struct SimulatedTransport {
    confirmation: Mutex<Confirmation>,
    lamps: Mutex<Lamps>,
    feed: Arc<Feed>,
}

impl SimulatedTransport {
    pub fn new(confirmation: Confirmation) -> Arc<Self> {
        Arc::new(Self {
            confirmation: Mutex::new(confirmation),
            lamps: Mutex::new(Lamps::default()),
            feed: Arc::new(Feed::new(ConnectionStatus::Connected)),
        })
    }

    fn lamps(&self) -> std::sync::MutexGuard<'_, Lamps> {
        self.lamps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_confirmation(&self, confirmation: Confirmation) {
        *self
            .confirmation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = confirmation;
    }

    pub fn set_online(&self, online: bool) {
        self.feed.set_status(if online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Offline
        });
    }

    /// Someone flipped the wall switch: the lamp changes and reports it.
    pub fn report(&self, device: DeviceKey, state: SwitchAction) {
        self.lamps().states.insert(device, state);
        self.feed.publish(Observation { device, state });
    }

    pub fn stick(&self, device: DeviceKey, state: SwitchAction) {
        let mut lamps = self.lamps();
        lamps.stuck.insert(device, state);
        lamps.states.insert(device, state);
    }

    pub fn lamp(&self, device: DeviceKey) -> Option<SwitchAction> {
        self.lamps().states.get(&device).copied()
    }

    pub fn sent_commands(&self) -> Vec<(DeviceKey, SwitchAction)> {
        self.lamps().sent.clone()
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Simulated
    }

    async fn send(
        &self,
        device: DeviceKey,
        desired: SwitchAction,
    ) -> Result<Delivery, TransportError> {
        self.feed.ensure_open()?;
        if !self.feed.status().is_connected() {
            return Err(TransportError::Connection("simulated bridge offline".into()));
        }
        let reported = {
            let mut lamps = self.lamps();
            lamps.sent.push((device, desired));
            let reported = lamps.stuck.get(&device).copied().unwrap_or(desired);
            lamps.states.insert(device, reported);
            reported
        };
        let confirmation = *self
            .confirmation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(%device, %desired, %reported, ?confirmation, "simulated lamp command");

        match confirmation {
            Confirmation::Reply => Ok(Delivery::Confirmed(reported)),
            Confirmation::Delayed(delay) => {
                let feed = Arc::clone(&self.feed);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    feed.publish(Observation {
                        device,
                        state: reported,
                    });
                });
                Ok(Delivery::Dispatched)
            }
            Confirmation::Silent => Ok(Delivery::Dispatched),
        }
    }

    async fn read(&self, device: DeviceKey) -> Result<Option<SwitchAction>, TransportError> {
        self.feed.ensure_open()?;
        if !self.feed.status().is_connected() {
            return Err(TransportError::Connection("simulated bridge offline".into()));
        }
        Ok(self.lamp(device))
    }

    fn subscribe(&self) -> ObservationStream {
        self.feed.subscribe()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.feed.status()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.feed.watch()
    }

    async fn close(&self) {
        self.feed.close();
    }
}

#[cfg(test)]
#[path = "tests/simulated_tests.rs"]
mod tests;
