//! Register map of the Heidelberg Energy Control wallbox.
//!
//! Telemetry is read in four blocks per capture and decoded into physical
//! units. Writable entities map to single holding registers with a
//! per-entity encode function.

use std::collections::BTreeMap;
use std::fmt;

use hass_common::{EntityDescriptor, EntityValue};

/// Modbus register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterKind {
    /// Read-only input registers (function 0x04).
    Input,
    /// Read/write holding registers (function 0x03 / 0x06).
    Holding,
}

impl RegisterKind {
    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous run of registers fetched with one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
}

/// Blocks read by every capture, in bus order.
pub const CAPTURE_BLOCKS: [RegisterBlock; 4] = [
    RegisterBlock {
        kind: RegisterKind::Input,
        start: 4,
        count: 15,
    },
    RegisterBlock {
        kind: RegisterKind::Input,
        start: 100,
        count: 2,
    },
    RegisterBlock {
        kind: RegisterKind::Holding,
        start: 257,
        count: 3,
    },
    RegisterBlock {
        kind: RegisterKind::Holding,
        start: 261,
        count: 2,
    },
];

/// How a raw register turns into an entity value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decode {
    /// Raw value as an integer.
    Integer,
    /// Raw value divided by the factor.
    Scaled(f64),
    /// 32-bit counter, high word at the address and low word right after it,
    /// divided by the factor.
    Wide(f64),
    /// `"ON"` when the raw value equals the given one, `"OFF"` otherwise.
    Switch(u16),
}

/// One decoded telemetry field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub name: &'static str,
    pub kind: RegisterKind,
    pub address: u16,
    pub decode: Decode,
}

const fn input(name: &'static str, address: u16, decode: Decode) -> Telemetry {
    Telemetry {
        name,
        kind: RegisterKind::Input,
        address,
        decode,
    }
}

const fn holding(name: &'static str, address: u16, decode: Decode) -> Telemetry {
    Telemetry {
        name,
        kind: RegisterKind::Holding,
        address,
        decode,
    }
}

/// Fields produced by a capture.
pub const TELEMETRY: &[Telemetry] = &[
    input("layout_version", 4, Decode::Integer),
    input("charging_state", 5, Decode::Integer),
    input("I_L1", 6, Decode::Scaled(10.0)),
    input("I_L2", 7, Decode::Scaled(10.0)),
    input("I_L3", 8, Decode::Scaled(10.0)),
    input("temperature", 9, Decode::Scaled(10.0)),
    input("V_L1", 10, Decode::Integer),
    input("V_L2", 11, Decode::Integer),
    input("V_L3", 12, Decode::Integer),
    input("extern_lock_state", 13, Decode::Integer),
    input("power_kW", 14, Decode::Scaled(1000.0)),
    input("energy_pwr_on", 15, Decode::Wide(1000.0)),
    input("energy_kWh", 17, Decode::Wide(1000.0)),
    input("I_max_cfg", 100, Decode::Integer),
    input("I_min_cfg", 101, Decode::Integer),
    holding("modbus_watchdog_timeout", 257, Decode::Scaled(1000.0)),
    holding("standby", 258, Decode::Switch(STANDBY_ENABLED)),
    holding("remote_enable", 259, Decode::Switch(1)),
    holding("I_max_cmd", 261, Decode::Scaled(10.0)),
    holding("I_fail_safe", 262, Decode::Scaled(10.0)),
];

/// Standby register value that enables power saving.
const STANDBY_ENABLED: u16 = 0;

/// Standby register value that keeps the wallbox awake.
const STANDBY_DISABLED: u16 = 4;

/// Raw register values gathered by one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterImage {
    values: BTreeMap<(RegisterKind, u16), u16>,
}

impl RegisterImage {
    /// Create an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store consecutive registers starting at `start`.
    pub fn insert_block(&mut self, kind: RegisterKind, start: u16, words: &[u16]) {
        for (address, word) in (start..).zip(words) {
            self.values.insert((kind, address), *word);
        }
    }

    /// Store one register.
    pub fn insert(&mut self, kind: RegisterKind, address: u16, value: u16) {
        self.values.insert((kind, address), value);
    }

    /// Raw value of one register.
    pub fn get(&self, kind: RegisterKind, address: u16) -> Option<u16> {
        self.values.get(&(kind, address)).copied()
    }
}

/// Decoded device state: logical field name to value.
pub type DeviceSnapshot = BTreeMap<String, EntityValue>;

impl Telemetry {
    /// Decode this field from a register image.
    ///
    /// Returns `None` if a register it needs is missing.
    pub fn decode(&self, image: &RegisterImage) -> Option<EntityValue> {
        let raw = image.get(self.kind, self.address)?;

        let value = match self.decode {
            Decode::Integer => EntityValue::Integer(i64::from(raw)),
            Decode::Scaled(factor) => EntityValue::Float(f64::from(raw) / factor),
            Decode::Wide(factor) => {
                let low = image.get(self.kind, self.address.checked_add(1)?)?;
                let combined = (u32::from(raw) << 16) | u32::from(low);
                EntityValue::Float(f64::from(combined) / factor)
            }
            Decode::Switch(on) if raw == on => EntityValue::on(),
            Decode::Switch(_) => EntityValue::off(),
        };

        Some(value)
    }
}

/// Decode every telemetry field present in the image.
pub fn decode_snapshot(image: &RegisterImage) -> DeviceSnapshot {
    TELEMETRY
        .iter()
        .filter_map(|field| {
            field
                .decode(image)
                .map(|value| (field.name.to_string(), value))
        })
        .collect()
}

/// A device-owned entity that can be commanded.
#[derive(Debug, Clone, Copy)]
pub struct Writable {
    pub name: &'static str,
    /// Holding register address.
    pub address: u16,
    /// Turns an entity value into the raw register value.
    pub encode: fn(&EntityValue) -> Option<u16>,
}

/// Entities accepted by the `write` operation.
pub const WRITABLE: &[Writable] = &[
    Writable {
        name: "modbus_watchdog_timeout",
        address: 257,
        encode: encode_millis,
    },
    Writable {
        name: "standby",
        address: 258,
        encode: encode_standby,
    },
    Writable {
        name: "remote_enable",
        address: 259,
        encode: encode_remote_enable,
    },
    Writable {
        name: "I_max_cmd",
        address: 261,
        encode: encode_deci,
    },
    Writable {
        name: "I_fail_safe",
        address: 262,
        encode: encode_deci,
    },
];

/// Look up a writable entity by name.
pub fn writable(name: &str) -> Option<&'static Writable> {
    WRITABLE.iter().find(|w| w.name == name)
}

fn scaled(value: &EntityValue, factor: f64) -> Option<u16> {
    let raw = (value.as_f64()? * factor).round();
    (raw.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&raw)).then_some(raw as u16)
}

fn switch(value: &EntityValue, on: u16, off: u16) -> Option<u16> {
    match value.as_str()? {
        "ON" => Some(on),
        "OFF" => Some(off),
        _ => None,
    }
}

fn encode_millis(value: &EntityValue) -> Option<u16> {
    scaled(value, 1000.0)
}

fn encode_deci(value: &EntityValue) -> Option<u16> {
    scaled(value, 10.0)
}

fn encode_standby(value: &EntityValue) -> Option<u16> {
    switch(value, STANDBY_ENABLED, STANDBY_DISABLED)
}

fn encode_remote_enable(value: &EntityValue) -> Option<u16> {
    switch(value, 1, 0)
}

/// Home Assistant entities backed by wallbox registers.
pub fn device_entities() -> Vec<EntityDescriptor> {
    let current = |name: &str, friendly: &str| {
        EntityDescriptor::sensor(name, friendly)
            .with_device_class("current")
            .with_state_class("measurement")
            .with_unit("A")
            .with_icon("current-ac")
    };
    let voltage = |name: &str, friendly: &str| {
        EntityDescriptor::sensor(name, friendly)
            .with_device_class("voltage")
            .with_state_class("measurement")
            .with_unit("V")
            .with_icon("sine-wave")
    };
    let energy = |name: &str, friendly: &str| {
        EntityDescriptor::sensor(name, friendly)
            .with_device_class("energy")
            .with_state_class("total_increasing")
            .with_unit("kWh")
            .with_icon("lightning-bolt")
    };
    let current_limit = |name: &str, friendly: &str| {
        EntityDescriptor::number(name, friendly)
            .with_device_class("current")
            .with_unit("A")
            .with_icon("current-ac")
            .with_range(0.0, 16.0, 0.1)
    };

    vec![
        EntityDescriptor::sensor("layout_version", "Register layout version")
            .with_icon("information-outline"),
        EntityDescriptor::sensor("charging_state", "Charging state").with_icon("ev-station"),
        current("I_L1", "Current L1"),
        current("I_L2", "Current L2"),
        current("I_L3", "Current L3"),
        EntityDescriptor::sensor("temperature", "Temperature")
            .with_device_class("temperature")
            .with_state_class("measurement")
            .with_unit("°C")
            .with_icon("thermometer"),
        voltage("V_L1", "Voltage L1"),
        voltage("V_L2", "Voltage L2"),
        voltage("V_L3", "Voltage L3"),
        EntityDescriptor::sensor("extern_lock_state", "External lock state").with_icon("lock"),
        EntityDescriptor::sensor("power_kW", "Power")
            .with_device_class("power")
            .with_state_class("measurement")
            .with_unit("kW")
            .with_icon("flash"),
        energy("energy_pwr_on", "Energy since power on"),
        energy("energy_kWh", "Energy"),
        EntityDescriptor::sensor("I_max_cfg", "Max current (hardware)")
            .with_device_class("current")
            .with_unit("A")
            .with_icon("current-ac"),
        EntityDescriptor::sensor("I_min_cfg", "Min current (hardware)")
            .with_device_class("current")
            .with_unit("A")
            .with_icon("current-ac"),
        EntityDescriptor::number("modbus_watchdog_timeout", "Modbus watchdog timeout")
            .with_device_class("duration")
            .with_unit("s")
            .with_icon("timer-outline")
            .with_range(0.0, 65.0, 1.0),
        EntityDescriptor::switch("standby", "Standby").with_icon("sleep"),
        EntityDescriptor::switch("remote_enable", "Remote enable").with_icon("power"),
        current_limit("I_max_cmd", "Max current command"),
        current_limit("I_fail_safe", "Fail safe current"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(values: &[(RegisterKind, u16, u16)]) -> RegisterImage {
        let mut image = RegisterImage::new();
        for (kind, address, value) in values {
            image.insert(*kind, *address, *value);
        }
        image
    }

    #[test]
    fn test_capture_blocks_cover_telemetry() {
        for field in TELEMETRY {
            let covered = CAPTURE_BLOCKS.iter().any(|b| {
                b.kind == field.kind && (b.start..b.start + b.count).contains(&field.address)
            });
            assert!(covered, "{} not covered by a capture block", field.name);
        }
    }

    #[test]
    fn test_decode_scaled_and_integer() {
        use RegisterKind::Input;
        let image = image_with(&[(Input, 5, 7), (Input, 6, 50), (Input, 9, 250), (Input, 10, 230)]);
        let snapshot = decode_snapshot(&image);

        assert_eq!(snapshot["charging_state"], EntityValue::Integer(7));
        assert_eq!(snapshot["I_L1"], EntityValue::Float(5.0));
        assert_eq!(snapshot["temperature"], EntityValue::Float(25.0));
        assert_eq!(snapshot["V_L1"], EntityValue::Integer(230));
        // Fields with missing registers are left out
        assert!(!snapshot.contains_key("power_kW"));
    }

    #[test]
    fn test_decode_wide_counter() {
        use RegisterKind::Input;

        let low_only = image_with(&[(Input, 17, 0), (Input, 18, 3)]);
        assert_eq!(
            decode_snapshot(&low_only)["energy_kWh"],
            EntityValue::Float(0.003)
        );

        let high_only = image_with(&[(Input, 17, 3), (Input, 18, 0)]);
        assert_eq!(
            decode_snapshot(&high_only)["energy_kWh"],
            EntityValue::Float(196.608)
        );

        // Low word missing
        assert!(!decode_snapshot(&image_with(&[(Input, 15, 1)])).contains_key("energy_pwr_on"));
    }

    #[test]
    fn test_decode_switches() {
        use RegisterKind::Holding;

        let image = image_with(&[(Holding, 258, 0), (Holding, 259, 0)]);
        let snapshot = decode_snapshot(&image);
        assert_eq!(snapshot["standby"], EntityValue::on());
        assert_eq!(snapshot["remote_enable"], EntityValue::off());

        let image = image_with(&[(Holding, 258, 4), (Holding, 259, 1)]);
        let snapshot = decode_snapshot(&image);
        assert_eq!(snapshot["standby"], EntityValue::off());
        assert_eq!(snapshot["remote_enable"], EntityValue::on());
    }

    #[test]
    fn test_min_current_reads_its_own_register() {
        use RegisterKind::Input;
        let snapshot = decode_snapshot(&image_with(&[(Input, 100, 16), (Input, 101, 6)]));

        assert_eq!(snapshot["I_max_cfg"], EntityValue::Integer(16));
        assert_eq!(snapshot["I_min_cfg"], EntityValue::Integer(6));
    }

    #[test]
    fn test_encode_numbers() {
        let i_max = writable("I_max_cmd").unwrap();
        assert_eq!(i_max.address, 261);
        assert_eq!((i_max.encode)(&EntityValue::Integer(16)), Some(160));
        assert_eq!((i_max.encode)(&EntityValue::Float(6.5)), Some(65));

        let watchdog = writable("modbus_watchdog_timeout").unwrap();
        assert_eq!((watchdog.encode)(&EntityValue::Float(15.0)), Some(15000));

        // Out of range or not numeric
        assert_eq!((i_max.encode)(&EntityValue::Integer(-1)), None);
        assert_eq!((watchdog.encode)(&EntityValue::Integer(70)), None);
        assert_eq!((i_max.encode)(&EntityValue::on()), None);
    }

    #[test]
    fn test_encode_switches() {
        let remote = writable("remote_enable").unwrap();
        assert_eq!((remote.encode)(&EntityValue::on()), Some(1));
        assert_eq!((remote.encode)(&EntityValue::off()), Some(0));
        // Integers are not switch states
        assert_eq!((remote.encode)(&EntityValue::Integer(1)), None);

        let standby = writable("standby").unwrap();
        assert_eq!(standby.address, 258);
        assert_eq!((standby.encode)(&EntityValue::on()), Some(0));
        assert_eq!((standby.encode)(&EntityValue::off()), Some(4));
    }

    #[test]
    fn test_writable_lookup() {
        assert!(writable("power_kW").is_none());
        assert!(writable("polling_interval").is_none());
        assert_eq!(WRITABLE.len(), 5);
    }

    #[test]
    fn test_entities_match_telemetry() {
        let entities = device_entities();

        for field in TELEMETRY {
            assert!(
                entities.iter().any(|e| e.name == field.name),
                "{} has no entity",
                field.name
            );
        }
        for w in WRITABLE {
            let entity = entities.iter().find(|e| e.name == w.name).unwrap();
            assert!(entity.kind.accepts_commands(), "{} is not commandable", w.name);
        }
    }
}
