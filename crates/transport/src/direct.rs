//! Direct mode: one HTTP request per command against the device bridge.
//!
//! `POST <bridge>/<segment>` with body `on`/`off` switches a lamp and the
//! reply carries its resulting state. `GET <bridge>/<segment>` reads it.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use shared::{
    domain::{DeviceKey, SwitchAction},
    protocol::ConnectionStatus,
    registry::DeviceRegistry,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};
use url::Url;

use crate::{
    Delivery, DeviceTransport, Feed, Observation, ObservationStream, TransportError,
    TransportMode,
};

#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub bridge_url: Url,
    pub request_timeout: Duration,
    pub poll_interval: Option<Duration>,
}

pub struct DirectTransport {
    http: Client,
    base: Url,
    config: DirectConfig,
    registry: DeviceRegistry,
    feed: Feed,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(config: DirectConfig, registry: DeviceRegistry) -> Result<Arc<Self>, TransportError> {
        if !matches!(config.bridge_url.scheme(), "http" | "https") {
            return Err(TransportError::Config(format!(
                "bridge url must be http(s), got '{}'",
                config.bridge_url
            )));
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| TransportError::Config(err.to_string()))?;

        let mut base = config.bridge_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Arc::new(Self {
            http,
            base,
            config,
            registry,
            feed: Feed::new(ConnectionStatus::Connecting),
            poller: Mutex::new(None),
        }))
    }

    /// Periodically reads every device and publishes what it finds, so lamps
    /// switched at the wall still reach subscribers. No-op without a poll
    /// interval.
    pub fn start_polling(self: &Arc<Self>) {
        let Some(period) = self.config.poll_interval else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                for device in transport.registry.devices().collect::<Vec<_>>() {
                    match transport.read(device).await {
                        Ok(Some(state)) => transport.feed.publish(Observation { device, state }),
                        Ok(None) => {}
                        Err(err) => debug!(%device, %err, "bridge poll failed"),
                    }
                }
            }
        });
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn endpoint(&self, device: DeviceKey) -> Result<Url, TransportError> {
        self.base
            .join(self.registry.segment(device))
            .map_err(|err| TransportError::Config(format!("bad bridge path for {device}: {err}")))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else if err.is_connect() || err.is_request() {
            self.feed.set_status(ConnectionStatus::Offline);
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Rejected(err.to_string())
        }
    }

    async fn reply_body(
        &self,
        response: reqwest::Response,
        device: DeviceKey,
    ) -> Result<String, TransportError> {
        let status = response.status();
        self.feed.set_status(ConnectionStatus::Connected);
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::Rejected(format!(
                "bridge has no endpoint for {device}"
            )));
        }
        if !status.is_success() {
            return Err(TransportError::Rejected(format!("bridge answered {status}")));
        }
        response.text().await.map_err(|err| self.classify(err))
    }
}

#[derive(Deserialize)]
struct StatusReply {
    #[serde(alias = "state")]
    status: String,
}

/// Accepts `ON`, `off`, `"on"`, `1`, or `{"status": "on"}`. Anything else is
/// `None`.
pub(crate) fn parse_bridge_reply(body: &str) -> Option<SwitchAction> {
    let body = body.trim();
    if body.starts_with('{') {
        let reply: StatusReply = serde_json::from_str(body).ok()?;
        return SwitchAction::parse_payload(&reply.status);
    }
    SwitchAction::parse_payload(body)
}

#[async_trait]
impl DeviceTransport for DirectTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Direct
    }

    async fn send(
        &self,
        device: DeviceKey,
        desired: SwitchAction,
    ) -> Result<Delivery, TransportError> {
        self.feed.ensure_open()?;
        let url = self.endpoint(device)?;
        debug!(%device, %desired, %url, "posting lamp command");
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(desired.payload())
            .send()
            .await
            .map_err(|err| self.classify(err))?;
        let body = self.reply_body(response, device).await?;
        match parse_bridge_reply(&body) {
            Some(state) => Ok(Delivery::Confirmed(state)),
            None => {
                warn!(%device, reply = %body, "bridge reply carried no lamp state");
                Ok(Delivery::Dispatched)
            }
        }
    }

    async fn read(&self, device: DeviceKey) -> Result<Option<SwitchAction>, TransportError> {
        self.feed.ensure_open()?;
        let url = self.endpoint(device)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| self.classify(err))?;
        let body = self.reply_body(response, device).await?;
        Ok(parse_bridge_reply(&body))
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
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            poller.abort();
        }
        self.feed.close();
    }
}

#[cfg(test)]
#[path = "tests/direct_tests.rs"]
mod tests;
