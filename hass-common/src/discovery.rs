//! Entity descriptors and Home Assistant MQTT discovery payloads.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, EntityValue};
use crate::topics::TopicBuilder;

/// Static description of an entity exposed to Home Assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity key (used in topics and state payloads).
    pub name: String,
    /// Entity platform.
    pub kind: EntityKind,
    /// Human-readable name, prefixed with the device name in Home Assistant.
    pub friendly_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Material Design icon name without the `mdi:` prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Value before the first update arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<EntityValue>,
}

impl EntityDescriptor {
    fn new(kind: EntityKind, name: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            friendly_name: friendly_name.into(),
            device_class: None,
            state_class: None,
            unit: None,
            icon: None,
            min: None,
            max: None,
            step: None,
            initial: None,
        }
    }

    /// Create a sensor descriptor.
    pub fn sensor(name: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self::new(EntityKind::Sensor, name, friendly_name)
    }

    /// Create a switch descriptor.
    pub fn switch(name: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self::new(EntityKind::Switch, name, friendly_name)
    }

    /// Create a number descriptor.
    pub fn number(name: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self::new(EntityKind::Number, name, friendly_name)
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_state_class(mut self, state_class: impl Into<String>) -> Self {
        self.state_class = Some(state_class.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Set the range of a number entity.
    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self.step = Some(step);
        self
    }

    pub fn with_initial(mut self, value: impl Into<EntityValue>) -> Self {
        self.initial = Some(value.into());
        self
    }
}

/// Device block of a discovery payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
}

/// Discovery config payload for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub name: String,
    pub state_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub value_template: String,
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Build the discovery topic and payload for an entity.
pub fn discovery_message(
    topics: &TopicBuilder,
    entity: &EntityDescriptor,
) -> (String, DiscoveryPayload) {
    let device = topics.device();
    let is_number = entity.kind == EntityKind::Number;

    let payload = DiscoveryPayload {
        device_class: entity.device_class.clone(),
        state_class: entity.state_class.clone(),
        name: format!("{} {}", device, entity.friendly_name),
        state_topic: topics.state_topic(entity.kind),
        command_topic: entity
            .kind
            .accepts_commands()
            .then(|| topics.command_topic(entity.kind, &entity.name)),
        availability_topic: topics.availability_topic(),
        unit_of_measurement: entity.unit.clone(),
        value_template: format!("{{{{value_json.{}}}}}", entity.name),
        unique_id: format!("{}_{}", device, entity.name),
        min: entity.min.filter(|_| is_number),
        max: entity.max.filter(|_| is_number),
        step: entity.step.filter(|_| is_number),
        device: DeviceInfo {
            identifiers: vec![device.to_string()],
            name: device.to_string(),
        },
        icon: entity.icon.as_ref().map(|icon| format!("mdi:{}", icon)),
    };

    (topics.config_topic(entity.kind, &entity.name), payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_discovery() {
        let topics = TopicBuilder::new("walli");
        let entity = EntityDescriptor::sensor("temperature", "Temperature")
            .with_device_class("temperature")
            .with_state_class("measurement")
            .with_unit("°C")
            .with_icon("thermometer");

        let (topic, payload) = discovery_message(&topics, &entity);

        assert_eq!(topic, "homeassistant/sensor/walli/temperature/config");
        assert_eq!(payload.name, "walli Temperature");
        assert_eq!(payload.state_topic, "homeassistant/sensor/walli/state");
        assert_eq!(payload.command_topic, None);
        assert_eq!(payload.value_template, "{{value_json.temperature}}");
        assert_eq!(payload.unique_id, "walli_temperature");
        assert_eq!(payload.icon.as_deref(), Some("mdi:thermometer"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["unit_of_measurement"], "°C");
        assert_eq!(json["device"]["identifiers"][0], "walli");
        assert!(json.get("command_topic").is_none());
        assert!(json.get("min").is_none());
    }

    #[test]
    fn test_number_discovery_has_range_and_command_topic() {
        let topics = TopicBuilder::new("walli");
        let entity = EntityDescriptor::number("I_max_cmd", "Max current")
            .with_unit("A")
            .with_range(0.0, 16.0, 0.1);

        let (topic, payload) = discovery_message(&topics, &entity);

        assert_eq!(topic, "homeassistant/number/walli/I_max_cmd/config");
        assert_eq!(
            payload.command_topic.as_deref(),
            Some("homeassistant/number/walli/I_max_cmd")
        );
        assert_eq!(payload.min, Some(0.0));
        assert_eq!(payload.max, Some(16.0));
        assert_eq!(payload.step, Some(0.1));
    }

    #[test]
    fn test_range_ignored_for_switch() {
        let topics = TopicBuilder::new("walli");
        let entity = EntityDescriptor::switch("remote_enable", "Remote enable")
            .with_range(0.0, 1.0, 1.0)
            .with_initial(EntityValue::off());

        let (_, payload) = discovery_message(&topics, &entity);

        assert_eq!(payload.min, None);
        assert_eq!(
            payload.command_topic.as_deref(),
            Some("homeassistant/switch/walli/remote_enable")
        );
    }
}
