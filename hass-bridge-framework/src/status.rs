//! Bridge availability reporting.

use rumqttc::{LastWill, QoS};

use crate::Result;
use crate::TopicBuilder;
use crate::publisher::Publisher;

/// Availability of the bridge as seen by Home Assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Bridge is connected and serving the device.
    Online,
    /// Bridge is gone (clean shutdown or broker-delivered last will).
    Offline,
}

impl BridgeStatus {
    /// Payload understood by Home Assistant's default availability template.
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Online => "online",
            BridgeStatus::Offline => "offline",
        }
    }

    /// Publish this status, retained, to the availability topic.
    pub async fn publish(&self, publisher: &Publisher) -> Result<()> {
        let topic = publisher.topics().availability_topic();
        publisher.publish_raw(&topic, self.as_str(), true).await
    }

    /// Last will that marks the bridge offline if the connection drops.
    pub fn last_will(topics: &TopicBuilder) -> LastWill {
        LastWill::new(
            topics.availability_topic(),
            BridgeStatus::Offline.as_str(),
            QoS::AtLeastOnce,
            true,
        )
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payloads() {
        assert_eq!(BridgeStatus::Online.as_str(), "online");
        assert_eq!(BridgeStatus::Offline.to_string(), "offline");
    }

    #[test]
    fn test_last_will() {
        let will = BridgeStatus::last_will(&TopicBuilder::new("walli"));

        assert_eq!(will.topic, "homeassistant/sensor/walli/availability");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
        assert_eq!(will.qos, QoS::AtLeastOnce);
    }
}
