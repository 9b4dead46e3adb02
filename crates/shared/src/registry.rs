//! Static mapping from device keys to broker topics and bridge paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::DeviceKey;

pub const DEFAULT_BASE_TOPIC: &str = "lampu";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistry {
    base_topic: String,
    segments: BTreeMap<DeviceKey, String>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl DeviceRegistry {
    pub fn new(base_topic: impl Into<String>) -> Self {
        let base_topic = base_topic.into().trim_matches('/').to_string();
        let segments = DeviceKey::ALL
            .into_iter()
            .map(|key| (key, key.as_str().to_string()))
            .collect();
        Self {
            base_topic,
            segments,
        }
    }

    /// Overrides the topic/path segment for one device, e.g. for firmware that
    /// still publishes under `lampu/dapur`.
    pub fn with_segment(mut self, key: DeviceKey, segment: impl Into<String>) -> Self {
        let segment = segment.into();
        let segment = segment.trim_matches('/');
        if !segment.is_empty() {
            self.segments.insert(key, segment.to_string());
        }
        self
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceKey> + '_ {
        self.segments.keys().copied()
    }

    pub fn segment(&self, key: DeviceKey) -> &str {
        self.segments
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| key.as_str())
    }

    pub fn command_topic(&self, key: DeviceKey) -> String {
        format!("{}/{}/set", self.base_topic, self.segment(key))
    }

    pub fn status_topic(&self, key: DeviceKey) -> String {
        format!("{}/{}/status", self.base_topic, self.segment(key))
    }

    pub fn status_topics(&self) -> Vec<String> {
        self.devices().map(|key| self.status_topic(key)).collect()
    }

    pub fn bridge_path(&self, key: DeviceKey) -> String {
        format!("/{}", self.segment(key))
    }

    pub fn device_for_status_topic(&self, topic: &str) -> Option<DeviceKey> {
        let rest = topic.strip_prefix(self.base_topic.as_str())?;
        let segment = rest.strip_prefix('/')?.strip_suffix("/status")?;
        self.segments
            .iter()
            .find(|(_, candidate)| candidate.as_str() == segment)
            .map(|(key, _)| *key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_topics_from_base_and_segment() {
        let registry = DeviceRegistry::new("home/lamps/");
        assert_eq!(
            registry.command_topic(DeviceKey::Kitchen),
            "home/lamps/kitchen/set"
        );
        assert_eq!(
            registry.status_topic(DeviceKey::Dining),
            "home/lamps/dining/status"
        );
        assert_eq!(registry.bridge_path(DeviceKey::Guest), "/guest");
    }

    #[test]
    fn reverse_lookup_honours_segment_overrides() {
        let registry = DeviceRegistry::default().with_segment(DeviceKey::Kitchen, "dapur");
        assert_eq!(
            registry.device_for_status_topic("lampu/dapur/status"),
            Some(DeviceKey::Kitchen)
        );
        assert_eq!(registry.device_for_status_topic("lampu/kitchen/status"), None);
        assert_eq!(registry.device_for_status_topic("lampu/dapur/set"), None);
        assert_eq!(registry.device_for_status_topic("other/dapur/status"), None);
    }
}
