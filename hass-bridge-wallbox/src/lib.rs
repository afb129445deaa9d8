//! Home Assistant bridge for the Heidelberg Energy Control wallbox.
//!
//! This bridge polls the wallbox over Modbus RTU and exposes it to Home
//! Assistant through MQTT discovery. Commands from Home Assistant become
//! register writes.
//!
//! # Topics
//!
//! ```text
//! homeassistant/<kind>/<device>/<entity>/config   discovery (retained)
//! homeassistant/<kind>/<device>/state             JSON state per kind
//! homeassistant/<kind>/<device>/<entity>          commands (switch, number)
//! homeassistant/sensor/<device>/availability      online / offline
//! ```
//!
//! All bus access goes through the [`worker`] queue; see [`worker::DeviceWorker`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod registers;
pub mod router;
pub mod transport;
pub mod trigger;
pub mod worker;

pub use bridge::{WallboxBridge, entities};
pub use config::{TransportConfig, WallboxBridgeConfig};
pub use error::{DeviceError, TransportError};
pub use worker::{DeviceHandle, DeviceWorker, Operation, Task, TaskHandle, TaskOutput};
