use serde::{Deserialize, Serialize};
use std::fmt;

/// Home Assistant entity platforms supported by the bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Read-only measurement.
    Sensor,
    /// ON/OFF control.
    Switch,
    /// Numeric setting with a range.
    Number,
}

impl EntityKind {
    /// All kinds, in publishing order.
    pub const ALL: [EntityKind; 3] = [EntityKind::Sensor, EntityKind::Switch, EntityKind::Number];

    /// Topic segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::Switch => "switch",
            EntityKind::Number => "number",
        }
    }

    /// Whether Home Assistant can send commands to entities of this kind.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, EntityKind::Switch | EntityKind::Number)
    }

    /// Parse a topic segment.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sensor" => Some(EntityKind::Sensor),
            "switch" => Some(EntityKind::Switch),
            "number" => Some(EntityKind::Number),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of an entity, as published in state payloads and received in commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl EntityValue {
    /// Switch state "ON".
    pub fn on() -> Self {
        EntityValue::Text("ON".to_string())
    }

    /// Switch state "OFF".
    pub fn off() -> Self {
        EntityValue::Text("OFF".to_string())
    }

    /// Interpret an MQTT payload: integer first, then float, otherwise text.
    pub fn parse(payload: &str) -> Self {
        let trimmed = payload.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return EntityValue::Integer(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => EntityValue::Float(f),
            _ => EntityValue::Text(trimmed.to_string()),
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EntityValue::Integer(i) => Some(*i as f64),
            EntityValue::Float(f) => Some(*f),
            EntityValue::Text(_) => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for EntityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityValue::Integer(i) => write!(f, "{}", i),
            EntityValue::Float(v) => write!(f, "{}", v),
            EntityValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityValue {
    fn from(v: i64) -> Self {
        EntityValue::Integer(v)
    }
}

impl From<u16> for EntityValue {
    fn from(v: u16) -> Self {
        EntityValue::Integer(i64::from(v))
    }
}

impl From<f64> for EntityValue {
    fn from(v: f64) -> Self {
        EntityValue::Float(v)
    }
}

impl From<&str> for EntityValue {
    fn from(v: &str) -> Self {
        EntityValue::Text(v.to_string())
    }
}

impl From<String> for EntityValue {
    fn from(v: String) -> Self {
        EntityValue::Text(v)
    }
}
