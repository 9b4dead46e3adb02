//! Broadcast mode: publish/subscribe through an MQTT broker.
//!
//! Commands go to `<base>/<segment>/set`; devices report on
//! `<base>/<segment>/status`. Publishing only means the broker took the
//! message, so confirmation always arrives through the status feed.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use shared::{
    domain::{DeviceKey, SwitchAction},
    protocol::ConnectionStatus,
    registry::DeviceRegistry,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    Delivery, DeviceTransport, Feed, Observation, ObservationStream, TransportError,
    TransportMode,
};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub broker: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub reconnect_period: Duration,
    pub keep_alive: Duration,
    pub send_timeout: Duration,
}

impl BroadcastConfig {
    fn mqtt_options(&self) -> Result<MqttOptions, TransportError> {
        let host = self
            .broker
            .host_str()
            .ok_or_else(|| TransportError::Config(format!("broker url '{}' has no host", self.broker)))?
            .to_string();
        let tls = match self.broker.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(TransportError::Config(format!(
                    "unsupported broker scheme '{other}', expected mqtt:// or mqtts://"
                )))
            }
        };
        let port = self.broker.port().unwrap_or(if tls { 8883 } else { 1883 });

        let mut options = MqttOptions::new(client_id(&self.client_id_prefix), host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        if tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        Ok(options)
    }
}

/// Unique per process so two panels never kick each other off the broker.
pub(crate) fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &suffix[..8])
}

struct Inbox {
    registry: DeviceRegistry,
    feed: Feed,
    last_seen: Mutex<HashMap<DeviceKey, SwitchAction>>,
}

impl Inbox {
    fn handle_publish(&self, topic: &str, payload: &[u8]) -> Option<Observation> {
        let Some(device) = self.registry.device_for_status_topic(topic) else {
            debug!(topic, "ignoring message on unrelated topic");
            return None;
        };
        let text = String::from_utf8_lossy(payload);
        let Some(state) = SwitchAction::parse_payload(&text) else {
            warn!(topic, payload = %text, "ignoring unrecognised status payload");
            return None;
        };
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, state);
        let observation = Observation { device, state };
        self.feed.publish(observation);
        Some(observation)
    }
}

pub struct BroadcastTransport {
    client: AsyncClient,
    inbox: Arc<Inbox>,
    send_timeout: Duration,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastTransport {
    /// Starts the background connection. Returns immediately; the status moves
    /// from `Connecting` to `Connected` once the broker acknowledges.
    pub fn connect(
        config: BroadcastConfig,
        registry: DeviceRegistry,
    ) -> Result<Arc<Self>, TransportError> {
        let options = config.mqtt_options()?;
        info!(
            broker = %config.broker,
            client_id = %options.client_id(),
            "connecting to broker"
        );
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let inbox = Arc::new(Inbox {
            registry,
            feed: Feed::new(ConnectionStatus::Connecting),
            last_seen: Mutex::new(HashMap::new()),
        });
        let handle = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&inbox),
            config.reconnect_period,
        ));
        Ok(Arc::new(Self {
            client,
            inbox,
            send_timeout: config.send_timeout,
            event_loop: Mutex::new(Some(handle)),
        }))
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    inbox: Arc<Inbox>,
    reconnect_period: Duration,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "broker refused connection");
                    inbox.feed.set_status(ConnectionStatus::Reconnecting);
                    tokio::time::sleep(reconnect_period).await;
                    continue;
                }
                inbox.feed.set_status(ConnectionStatus::Connected);
                // Clean sessions forget subscriptions, so renew on every connect.
                for topic in inbox.registry.status_topics() {
                    if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        warn!(%topic, %err, "failed to subscribe to status topic");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inbox.handle_publish(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                if inbox.feed.is_closed() {
                    break;
                }
                warn!(%err, retry_in = ?reconnect_period, "broker connection lost");
                inbox.feed.set_status(ConnectionStatus::Reconnecting);
                tokio::time::sleep(reconnect_period).await;
            }
        }
    }
}

#[async_trait]
impl DeviceTransport for BroadcastTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Broadcast
    }

    async fn send(
        &self,
        device: DeviceKey,
        desired: SwitchAction,
    ) -> Result<Delivery, TransportError> {
        self.inbox.feed.ensure_open()?;
        let status = self.inbox.feed.status();
        if !status.is_connected() {
            return Err(TransportError::Connection(format!(
                "broker not connected ({status:?})"
            )));
        }
        let topic = self.inbox.registry.command_topic(device);
        debug!(%device, %desired, %topic, "publishing lamp command");
        let publish = self
            .client
            .publish(topic, QoS::AtMostOnce, false, desired.payload());
        match tokio::time::timeout(self.send_timeout, publish).await {
            Ok(Ok(())) => Ok(Delivery::Dispatched),
            Ok(Err(err)) => Err(TransportError::Connection(err.to_string())),
            Err(_) => Err(TransportError::Timeout(self.send_timeout)),
        }
    }

    async fn read(&self, device: DeviceKey) -> Result<Option<SwitchAction>, TransportError> {
        self.inbox.feed.ensure_open()?;
        Ok(self
            .inbox
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .copied())
    }

    fn subscribe(&self) -> ObservationStream {
        self.inbox.feed.subscribe()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.inbox.feed.status()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inbox.feed.watch()
    }

    async fn close(&self) {
        self.inbox.feed.close();
        if let Err(err) = self.client.try_disconnect() {
            debug!(%err, "disconnect request not delivered");
        }
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!("broker transport closed");
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
