//! Bridge runner for lifecycle management.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet};
use tokio::signal;
use tokio::sync::mpsc;

use hass_common::{HASS_STATUS_TOPIC, init_tracing, normalize_device_name};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::{Publisher, StatePublisher};
use crate::status::BridgeStatus;
use crate::store::EntityStore;
use crate::{EntityDescriptor, EntityValue, LoggingConfig, MqttConfig, TopicBuilder};

/// Capacity of the MQTT client request channel.
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the channel between the MQTT event loop and the dispatcher.
const EVENT_CAPACITY: usize = 64;

/// Device-specific side of a bridge.
#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    /// Error returned for rejected commands.
    type Error: std::fmt::Display + Send;

    /// Handle a command from Home Assistant for a registered entity.
    async fn on_command(&self, entity: &str, value: EntityValue) -> std::result::Result<(), Self::Error>;

    /// Release device resources before the bridge goes offline.
    async fn on_shutdown(&self) {}
}

/// What the event loop forwards to the dispatcher.
#[derive(Debug)]
enum BridgeEvent {
    Connected,
    Message { topic: String, payload: String },
}

/// Bridge runner that manages the lifecycle of a Home Assistant bridge.
///
/// Handles:
/// - Logging initialization
/// - MQTT connection with last will and retry-with-delay while the broker is unreachable
/// - Discovery announcement on every (re)connect and when Home Assistant restarts
/// - Command dispatch to a [`BridgeHandler`]
/// - Graceful shutdown on Ctrl+C
///
/// # Example
///
/// ```ignore
/// let runner = BridgeRunner::new("mybridge", config, entities)?;
/// let handler = Arc::new(MyHandler::new(runner.store(), runner.publisher()));
/// runner.run(handler).await
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// The loaded configuration.
    config: C,
    /// Publisher bound to the MQTT client.
    publisher: Publisher,
    /// Entity state shared with the handler.
    store: EntityStore,
    /// MQTT event loop, driven once `run` is called.
    eventloop: EventLoop,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config
    /// 2. Build the MQTT client (the connection is made by [`run`](Self::run))
    /// 3. Create the entity store
    pub fn new(
        name: impl Into<String>,
        config: C,
        entities: impl IntoIterator<Item = EntityDescriptor>,
    ) -> Result<Self> {
        Self::new_with_args(name, config, None, entities)
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
        entities: impl IntoIterator<Item = EntityDescriptor>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION");

        // Initialize logging with optional CLI override
        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                ..config.logging().clone()
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let topics = TopicBuilder::with_prefix(
            &config.discovery().prefix,
            normalize_device_name(&config.discovery().device_name),
        );
        let options = mqtt_options(config.mqtt(), &topics)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Ok(Self {
            name,
            config,
            publisher: Publisher::new(client, topics),
            store: EntityStore::new(entities),
            eventloop,
        })
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Get a handle to the entity store.
    pub fn store(&self) -> EntityStore {
        self.store.clone()
    }

    /// Run the bridge until Ctrl+C is received or the broker rejects us for good.
    ///
    /// This will:
    /// 1. Drive the MQTT connection, reconnecting with a delay on failure
    /// 2. Announce entities and subscribe to commands on every connect
    /// 3. Dispatch commands to `handler`
    /// 4. On shutdown: call [`BridgeHandler::on_shutdown`], publish "offline",
    ///    disconnect from the broker
    pub async fn run<H: BridgeHandler>(self, handler: Arc<H>) -> Result<()> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let mqtt = self.config.mqtt().clone();
        let mut driver = tokio::spawn(drive_event_loop(self.eventloop, event_tx, mqtt));

        let dispatcher = tokio::spawn(dispatch_events(
            event_rx,
            self.publisher.clone(),
            self.store.clone(),
            handler.clone(),
        ));

        tracing::info!(bridge = %self.name, "Bridge running. Press Ctrl+C to stop.");

        let outcome = tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!(bridge = %self.name, "Received shutdown signal");
                Ok(())
            }
            result = &mut driver => match result {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Ok(()),
                Err(e) => Err(BridgeError::config(format!("MQTT event loop panicked: {}", e))),
            },
        };

        dispatcher.abort();
        handler.on_shutdown().await;

        if !driver.is_finished() {
            if let Err(e) = BridgeStatus::Offline.publish(&self.publisher).await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
            if let Err(e) = self.publisher.disconnect().await {
                tracing::warn!(error = %e, "Error disconnecting from broker");
            }

            // Give the event loop a moment to flush the last packets
            if tokio::time::timeout(Duration::from_secs(1), &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        outcome
    }
}

fn mqtt_options(config: &MqttConfig, topics: &TopicBuilder) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_last_will(BridgeStatus::last_will(topics));

    if let Some((user, password)) = config.credentials()? {
        options.set_credentials(user, password);
    }

    Ok(options)
}

/// Delay before the next connection attempt after `error`.
///
/// Returns `None` when retrying is pointless (the broker refused the
/// CONNECT, e.g. bad credentials).
pub fn retry_delay(error: &ConnectionError, config: &MqttConfig) -> Option<Duration> {
    match error {
        ConnectionError::ConnectionRefused(_) => None,
        ConnectionError::Io(e) if e.kind() == ErrorKind::ConnectionRefused => {
            Some(Duration::from_secs(config.connect_retry_secs))
        }
        ConnectionError::Io(_) => Some(Duration::from_secs(config.unreachable_retry_secs)),
        _ => Some(Duration::from_secs(config.connect_retry_secs)),
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<BridgeEvent>,
    config: MqttConfig,
) -> Result<()> {
    tracing::info!(host = %config.host, port = config.port, "Connecting to MQTT broker");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(host = %config.host, "Connected to MQTT broker");
                forward(&events, BridgeEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                tracing::debug!(topic = %publish.topic, payload = %payload, "Message received");
                forward(
                    &events,
                    BridgeEvent::Message {
                        topic: publish.topic,
                        payload,
                    },
                );
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                tracing::debug!("Disconnect sent");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => match retry_delay(&e, &config) {
                Some(delay) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "MQTT connection failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(error = %e, "MQTT broker refused the connection");
                    return Err(BridgeError::MqttConnection(e.to_string()));
                }
            },
        }
    }
}

fn forward(events: &mpsc::Sender<BridgeEvent>, event: BridgeEvent) {
    // Never block the event loop; a stuck dispatcher must not stall keep-alives.
    if let Err(e) = events.try_send(event) {
        tracing::warn!(error = %e, "Dropping MQTT event, dispatcher is busy");
    }
}

async fn dispatch_events<H: BridgeHandler>(
    mut events: mpsc::Receiver<BridgeEvent>,
    publisher: Publisher,
    store: EntityStore,
    handler: Arc<H>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Connected => {
                if let Err(e) = subscribe_all(&publisher, &store).await {
                    tracing::warn!(error = %e, "Failed to subscribe");
                }
                announce(&publisher, &store).await;
            }
            BridgeEvent::Message { topic, payload } if topic == HASS_STATUS_TOPIC => {
                if payload.trim() == "online" {
                    tracing::info!("Home Assistant came online, re-announcing entities");
                    announce(&publisher, &store).await;
                }
            }
            BridgeEvent::Message { topic, payload } => {
                let Some(entity) = command_target(publisher.topics(), &store, &topic) else {
                    continue;
                };

                let value = EntityValue::parse(&payload);
                tracing::info!(entity = %entity, value = %value, "Command received");
                if let Err(e) = handler.on_command(entity, value).await {
                    tracing::warn!(entity = %entity, error = %e, "Command rejected");
                }
            }
        }
    }
}

/// Entity addressed by a command topic.
///
/// The entity must be registered and accept commands, and the topic's kind
/// must match the entity's kind.
fn command_target<'a>(topics: &TopicBuilder, store: &EntityStore, topic: &'a str) -> Option<&'a str> {
    let Some((kind, entity)) = topics.parse_command_topic(topic) else {
        tracing::debug!(topic = %topic, "Ignoring message on unexpected topic");
        return None;
    };

    match store.kind(entity) {
        Some(registered) if registered == kind && registered.accepts_commands() => Some(entity),
        Some(registered) => {
            tracing::debug!(
                entity = %entity,
                topic_kind = %kind,
                kind = %registered,
                "Ignoring command on topic of another kind"
            );
            None
        }
        None => {
            tracing::debug!(entity = %entity, "Ignoring command for unknown entity");
            None
        }
    }
}

async fn subscribe_all(publisher: &Publisher, store: &EntityStore) -> Result<()> {
    publisher.subscribe(HASS_STATUS_TOPIC).await?;

    for entity in store.descriptors() {
        if entity.kind.accepts_commands() {
            let topic = publisher.topics().command_topic(entity.kind, &entity.name);
            publisher.subscribe(&topic).await?;
        }
    }

    Ok(())
}

/// Publish discovery configs, availability and the full state.
async fn announce(publisher: &Publisher, store: &EntityStore) {
    let stats = publisher.publish_discovery(&store.descriptors()).await;
    if stats.failed == 0 {
        tracing::info!(published = stats.success, "Published discovery configs");
    } else {
        tracing::warn!(
            failed = stats.failed,
            total = stats.total(),
            success_rate = stats.success_rate(),
            "Some discovery configs were not published"
        );
    }

    if let Err(e) = BridgeStatus::Online.publish(publisher).await {
        tracing::warn!(error = %e, "Failed to publish online status");
    }

    if let Err(e) = publisher.publish_updates(store, true).await {
        tracing::warn!(error = %e, "Failed to publish initial state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnectReturnCode;
    use std::io;

    #[test]
    fn test_retry_delay_refused_socket() {
        let config = MqttConfig::default();
        let error = ConnectionError::Io(io::Error::new(ErrorKind::ConnectionRefused, "refused"));

        assert_eq!(retry_delay(&error, &config), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_retry_delay_unreachable() {
        let config = MqttConfig {
            unreachable_retry_secs: 30,
            ..MqttConfig::default()
        };
        let error = ConnectionError::Io(io::Error::new(ErrorKind::HostUnreachable, "no route"));

        assert_eq!(retry_delay(&error, &config), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_no_retry_when_broker_rejects_credentials() {
        let config = MqttConfig::default();
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);

        assert_eq!(retry_delay(&error, &config), None);
    }

    #[test]
    fn test_command_target_checks_kind() {
        let topics = TopicBuilder::new("walli");
        let store = EntityStore::new([
            EntityDescriptor::number("I_max_cmd", "Max current"),
            EntityDescriptor::switch("remote_enable", "Remote enable"),
        ]);

        assert_eq!(
            command_target(&topics, &store, "homeassistant/number/walli/I_max_cmd"),
            Some("I_max_cmd")
        );
        assert_eq!(
            command_target(&topics, &store, "homeassistant/switch/walli/remote_enable"),
            Some("remote_enable")
        );
        // Registered, but announced under another kind
        assert_eq!(
            command_target(&topics, &store, "homeassistant/switch/walli/I_max_cmd"),
            None
        );
        assert_eq!(
            command_target(&topics, &store, "homeassistant/number/walli/bogus"),
            None
        );
    }

    #[test]
    fn test_mqtt_options_use_secrets() {
        let config = MqttConfig {
            username: Some("hass".to_string()),
            password: Some("pw".to_string()),
            client_id: "walli-bridge".to_string(),
            ..MqttConfig::default()
        };

        let options = mqtt_options(&config, &TopicBuilder::new("walli")).unwrap();

        assert_eq!(options.client_id(), "walli-bridge");
        assert_eq!(
            options.credentials(),
            Some(("hass".to_string(), "pw".to_string()))
        );
        assert!(options.last_will().is_some());
    }
}
