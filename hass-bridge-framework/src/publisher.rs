//! MQTT publisher for discovery, availability and state messages.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use hass_common::discovery_message;

use crate::error::{BridgeError, Result};
use crate::store::EntityStore;
use crate::{EntityDescriptor, EntityKind, TopicBuilder};

/// Sink for entity state updates.
///
/// Implemented by [`Publisher`]; device code depends on this trait so it can
/// be exercised without a broker.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// Publish the dirty entities of `store` (all entities with `force`).
    ///
    /// Returns the number of state messages sent. Entities whose message
    /// could not be sent stay dirty.
    async fn publish_updates(&self, store: &EntityStore, force: bool) -> Result<usize>;
}

/// Publisher for sending Home Assistant messages over MQTT.
///
/// Wraps an MQTT client and the device's [`TopicBuilder`].
#[derive(Clone, Debug)]
pub struct Publisher {
    client: AsyncClient,
    topics: TopicBuilder,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(client: AsyncClient, topics: TopicBuilder) -> Self {
        Self { client, topics }
    }

    /// Get the topic builder.
    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Publish raw bytes to a topic with QoS 1.
    pub async fn publish_raw(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    /// Queue a JSON value without waiting for room in the request channel.
    ///
    /// Fails with [`BridgeError::Publish`] while the channel is full, e.g.
    /// when the broker has been unreachable for a while.
    pub fn try_publish_json<T: serde::Serialize>(
        &self,
        topic: &str,
        value: &T,
        retain: bool,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    /// Publish a JSON value to a topic.
    pub async fn publish_json<T: serde::Serialize>(
        &self,
        topic: &str,
        value: &T,
        retain: bool,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic, payload, retain).await
    }

    /// Publish retained discovery config messages for a set of entities.
    ///
    /// Failures are logged and counted; the remaining entities are still announced.
    pub async fn publish_discovery(&self, entities: &[EntityDescriptor]) -> PublishStats {
        let mut stats = PublishStats::default();

        for entity in entities {
            let (topic, payload) = discovery_message(&self.topics, entity);
            match self.publish_json(&topic, &payload, true).await {
                Ok(()) => {
                    tracing::debug!(topic = %topic, "Published discovery config");
                    stats.success += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(error = %e, "Failed to publish discovery config");
                }
            }
        }

        stats
    }

    /// Subscribe to a topic with QoS 1.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        tracing::debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    /// Send an MQTT DISCONNECT.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl StatePublisher for Publisher {
    async fn publish_updates(&self, store: &EntityStore, force: bool) -> Result<usize> {
        let mut sent = 0;
        let mut failure = None;

        for kind in EntityKind::ALL {
            let Some(payload) = store.take_updates(kind, force) else {
                continue;
            };
            let topic = self.topics.state_topic(kind);

            // State is latest-wins: never wait on the broker, resend on the next publish
            match self.try_publish_json(&topic, &payload, false) {
                Ok(()) => {
                    tracing::info!(topic = %topic, entities = payload.len(), "Published state");
                    sent += 1;
                }
                Err(e) => {
                    store.mark_dirty(payload.keys());
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }
}

/// Statistics from a batch publish operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishStats {
    /// Number of successfully published messages.
    pub success: usize,
    /// Number of failed publishes.
    pub failed: usize,
}

impl PublishStats {
    /// Total number of attempted publishes.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityValue;
    use rumqttc::MqttOptions;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_publish_stats() {
        let mut stats = PublishStats::default();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.success_rate(), 100.0);

        stats.success = 8;
        stats.failed = 2;
        assert_eq!(stats.total(), 10);
        assert_eq!(stats.success_rate(), 80.0);
    }

    #[tokio::test]
    async fn test_publish_fails_without_event_loop() {
        // Dropping the event loop closes the request channel
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        drop(eventloop);
        let publisher = Publisher::new(client, TopicBuilder::new("walli"));

        let err = assert_err!(publisher.publish_raw("some/topic", "payload", false).await);
        assert!(matches!(err, BridgeError::Publish { topic, .. } if topic == "some/topic"));
    }

    #[tokio::test]
    async fn test_discovery_failures_counted() {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        drop(eventloop);
        let publisher = Publisher::new(client, TopicBuilder::new("walli"));

        let stats = publisher
            .publish_discovery(&[
                EntityDescriptor::sensor("power_kW", "Power"),
                EntityDescriptor::switch("remote_enable", "Remote enable")
                    .with_initial(EntityValue::off()),
            ])
            .await;

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_state_kept_dirty_while_requests_back_up() {
        // Event loop alive but never polled, as while waiting to reconnect
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 1);
        let publisher = Publisher::new(client, TopicBuilder::new("walli"));
        let store = crate::EntityStore::new([EntityDescriptor::sensor("power_kW", "Power")]);

        store.set_entity("power_kW", EntityValue::Float(7.4)).unwrap();
        assert_eq!(assert_ok!(publisher.publish_updates(&store, false).await), 1);

        // Channel full: returns at once instead of parking the caller
        for power in [8.0, 9.0, 10.0] {
            store.set_entity("power_kW", EntityValue::Float(power)).unwrap();
            let err = assert_err!(publisher.publish_updates(&store, false).await);
            assert!(matches!(err, BridgeError::Publish { .. }));
        }

        let pending = store.take_updates(EntityKind::Sensor, false).unwrap();
        assert_eq!(pending["power_kW"], 10.0);
    }

    #[tokio::test]
    async fn test_requests_queued_for_event_loop() {
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let publisher = Publisher::new(client, TopicBuilder::new("walli"));
        let store = crate::EntityStore::new([EntityDescriptor::sensor("power_kW", "Power")]);
        store.set_entity("power_kW", EntityValue::Float(7.4)).unwrap();

        let sent = assert_ok!(publisher.publish_updates(&store, false).await);
        assert_eq!(sent, 1);

        // Nothing left to send
        assert_eq!(assert_ok!(publisher.publish_updates(&store, false).await), 0);
    }
}
