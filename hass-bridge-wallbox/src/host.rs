//! Sensors of the machine running the bridge.
//!
//! Published next to the wallbox entities under the same device:
//!
//! ```text
//! hostname          host name
//! host_ip           first non-loopback address, IPv4 preferred
//! wifi_strength     signal level of the wireless interface in dBm (0 when absent)
//! cpu_temperature   CPU package / SoC temperature in °C
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use sysinfo::{Components, Networks};

use hass_common::{EntityDescriptor, EntityValue};

use crate::config::HostConfig;

pub const HOSTNAME: &str = "hostname";
pub const HOST_IP: &str = "host_ip";
pub const WIFI_STRENGTH: &str = "wifi_strength";
pub const CPU_TEMPERATURE: &str = "cpu_temperature";

/// Temperature sensor chips that report the CPU, in order of preference.
const CPU_SENSORS: [&str; 5] = ["cpu-thermal", "cpu_thermal", "coretemp", "soc_thermal", "k10temp"];

const WIRELESS_STATUS: &str = "/proc/net/wireless";

/// Entities for the host sensors.
pub fn host_entities() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::sensor(HOSTNAME, "Hostname").with_icon("card-account-details"),
        EntityDescriptor::sensor(HOST_IP, "Host IP").with_icon("lan"),
        EntityDescriptor::sensor(WIFI_STRENGTH, "Wifi Strength")
            .with_device_class("signal_strength")
            .with_state_class("measurement")
            .with_unit("dBm")
            .with_icon("wifi"),
        EntityDescriptor::sensor(CPU_TEMPERATURE, "CPU Temperature")
            .with_device_class("temperature")
            .with_state_class("measurement")
            .with_unit("°C")
            .with_icon("thermometer"),
    ]
}

/// One reading of the host sensors.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReading {
    pub hostname: String,
    pub ip: IpAddr,
    pub wifi_dbm: i64,
    /// `None` when no known CPU sensor is exposed.
    pub cpu_temperature: Option<f64>,
}

impl HostReading {
    /// Entity values for the store.
    pub fn into_values(self) -> Vec<(String, EntityValue)> {
        let mut values = vec![
            (HOSTNAME.to_string(), EntityValue::Text(self.hostname)),
            (HOST_IP.to_string(), EntityValue::Text(self.ip.to_string())),
            (WIFI_STRENGTH.to_string(), EntityValue::Integer(self.wifi_dbm)),
        ];
        if let Some(celsius) = self.cpu_temperature {
            values.push((CPU_TEMPERATURE.to_string(), EntityValue::Float(celsius)));
        }
        values
    }
}

/// Reads the host sensors.
///
/// Reading blocks on sysfs/procfs; call it from `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct HostSensors {
    wifi_interface: String,
    wireless_status: PathBuf,
}

impl HostSensors {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            wifi_interface: config.wifi_interface.clone(),
            wireless_status: PathBuf::from(WIRELESS_STATUS),
        }
    }

    pub fn read(&self) -> HostReading {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let networks = Networks::new_with_refreshed_list();
        let ip = pick_host_ip(networks.list().iter().map(|(name, data)| {
            let addrs = data.ip_networks().iter().map(|net| net.addr).collect();
            (name.as_str(), addrs)
        }))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let wifi_dbm = match std::fs::read_to_string(&self.wireless_status) {
            Ok(contents) => parse_wifi_level(&contents, &self.wifi_interface).unwrap_or(0),
            Err(e) => {
                tracing::debug!(error = %e, "No wireless status available");
                0
            }
        };

        let components = Components::new_with_refreshed_list();
        let cpu_temperature = pick_cpu_temperature(components.list().iter().map(|c| {
            let celsius: Option<f32> = c.temperature().into();
            (c.label(), celsius)
        }));

        let reading = HostReading {
            hostname,
            ip,
            wifi_dbm,
            cpu_temperature,
        };
        tracing::debug!(?reading, "Host sensors read");
        reading
    }
}

/// First usable address, IPv4 preferred, interfaces in name order.
fn pick_host_ip<'a>(interfaces: impl IntoIterator<Item = (&'a str, Vec<IpAddr>)>) -> Option<IpAddr> {
    let mut interfaces: Vec<_> = interfaces.into_iter().collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));

    let usable = |addr: &&IpAddr| match addr {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    };
    let addrs = || interfaces.iter().flat_map(|(_, addrs)| addrs.iter()).filter(usable);

    addrs()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs().next())
        .copied()
}

/// Signal level column of `/proc/net/wireless` for `interface`.
fn parse_wifi_level(contents: &str, interface: &str) -> Option<i64> {
    let line = contents.lines().find(|line| {
        line.trim_start()
            .strip_prefix(interface)
            .is_some_and(|rest| rest.starts_with(':'))
    })?;

    // face: status link level noise ...
    let level = line.split_whitespace().nth(3)?;
    let level: f64 = level.trim_end_matches('.').parse().ok()?;
    Some(level as i64)
}

/// Temperature of the first known CPU sensor, rounded to 0.1 °C.
fn pick_cpu_temperature<'a>(
    components: impl IntoIterator<Item = (&'a str, Option<f32>)>,
) -> Option<f64> {
    let readings: Vec<_> = components
        .into_iter()
        .filter_map(|(label, celsius)| Some((label, celsius.filter(|c| c.is_finite())?)))
        .collect();

    CPU_SENSORS.iter().find_map(|sensor| {
        readings
            .iter()
            .find(|(label, _)| label.starts_with(sensor))
            .map(|(_, celsius)| (f64::from(*celsius) * 10.0).round() / 10.0)
    })
}
