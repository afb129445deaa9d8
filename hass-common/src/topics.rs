use crate::entity::EntityKind;

/// Default Home Assistant discovery prefix.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Topic Home Assistant publishes its own status (`online`/`offline`) on.
pub const HASS_STATUS_TOPIC: &str = "hass/status";

/// Builder for the MQTT topics of one device.
///
/// Topics follow the pattern:
/// `<prefix>/<kind>/<device>/<entity>[/config]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
    device: String,
}

impl TopicBuilder {
    /// Create a builder with the default discovery prefix.
    pub fn new(device: impl Into<String>) -> Self {
        Self::with_prefix(DISCOVERY_PREFIX, device)
    }

    /// Create a builder with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device: device.into(),
        }
    }

    /// The device name used in topics.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Discovery config topic for an entity.
    ///
    /// # Example
    /// ```
    /// use hass_common::{EntityKind, TopicBuilder};
    ///
    /// let topics = TopicBuilder::new("walli");
    /// assert_eq!(
    ///     topics.config_topic(EntityKind::Sensor, "power_kW"),
    ///     "homeassistant/sensor/walli/power_kW/config"
    /// );
    /// ```
    pub fn config_topic(&self, kind: EntityKind, entity: &str) -> String {
        format!("{}/{}/{}/{}/config", self.prefix, kind, self.device, entity)
    }

    /// State topic shared by all entities of one kind.
    ///
    /// # Example
    /// ```
    /// use hass_common::{EntityKind, TopicBuilder};
    ///
    /// let topics = TopicBuilder::new("walli");
    /// assert_eq!(topics.state_topic(EntityKind::Switch), "homeassistant/switch/walli/state");
    /// ```
    pub fn state_topic(&self, kind: EntityKind) -> String {
        format!("{}/{}/{}/state", self.prefix, kind, self.device)
    }

    /// Command topic of a switch or number entity.
    pub fn command_topic(&self, kind: EntityKind, entity: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, kind, self.device, entity)
    }

    /// Availability topic (carries `online`/`offline`, retained).
    pub fn availability_topic(&self) -> String {
        format!("{}/sensor/{}/availability", self.prefix, self.device)
    }

    /// Extract the entity name from a command topic of this device.
    ///
    /// Returns `None` for topics of other devices, state/config topics and
    /// sensor topics (sensors take no commands).
    pub fn parse_command_topic<'a>(&self, topic: &'a str) -> Option<(EntityKind, &'a str)> {
        let mut parts = topic.split('/');
        let prefix = parts.next()?;
        let kind = EntityKind::parse(parts.next()?)?;
        let device = parts.next()?;
        let entity = parts.next()?;

        if parts.next().is_some()
            || prefix != self.prefix
            || device != self.device
            || !kind.accepts_commands()
            || entity.is_empty()
            || entity == "state"
        {
            return None;
        }

        Some((kind, entity))
    }
}

/// Normalize a human-entered device name for use in topics.
///
/// Spaces are removed and the name is lowercased.
pub fn normalize_device_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let topics = TopicBuilder::new("walli");

        assert_eq!(
            topics.command_topic(EntityKind::Number, "I_max_cmd"),
            "homeassistant/number/walli/I_max_cmd"
        );
        assert_eq!(
            topics.availability_topic(),
            "homeassistant/sensor/walli/availability"
        );
    }

    #[test]
    fn test_custom_prefix() {
        let topics = TopicBuilder::with_prefix("ha", "garage");
        assert_eq!(topics.state_topic(EntityKind::Number), "ha/number/garage/state");
        assert_eq!(topics.device(), "garage");
    }

    #[test]
    fn test_parse_command_topic() {
        let topics = TopicBuilder::new("walli");

        assert_eq!(
            topics.parse_command_topic("homeassistant/switch/walli/remote_enable"),
            Some((EntityKind::Switch, "remote_enable"))
        );
        assert_eq!(
            topics.parse_command_topic("homeassistant/number/walli/I_max_cmd"),
            Some((EntityKind::Number, "I_max_cmd"))
        );
        assert_eq!(topics.parse_command_topic("homeassistant/number/walli/state"), None);
        assert_eq!(topics.parse_command_topic("homeassistant/sensor/walli/power_kW"), None);
        assert_eq!(topics.parse_command_topic("homeassistant/number/other/I_max_cmd"), None);
        assert_eq!(
            topics.parse_command_topic("homeassistant/number/walli/I_max_cmd/config"),
            None
        );
        assert_eq!(topics.parse_command_topic("hass/status"), None);
    }

    #[test]
    fn test_normalize_device_name() {
        assert_eq!(normalize_device_name("Walli 13"), "walli13");
        assert_eq!(normalize_device_name("garage"), "garage");
    }
}
