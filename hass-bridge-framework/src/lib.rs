//! Hass Bridge Framework
//!
//! Common abstractions for building bridges that expose devices to Home Assistant
//! over MQTT discovery.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (broker connection, discovery,
//!   command dispatch, shutdown)
//! - [`Publisher`] for publishing discovery, availability and state messages
//! - [`EntityStore`] for the shared entity state with dirty tracking
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for availability reporting
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hass_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.yaml");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let runner = BridgeRunner::new_with_args("mybridge", config, Some(&args), entities())?;
//!     let handler = Arc::new(MyHandler::new(runner.store(), runner.publisher()));
//!
//!     // Run until Ctrl+C
//!     runner.run(handler).await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;
mod store;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{PublishStats, Publisher, StatePublisher};
pub use runner::{BridgeHandler, BridgeRunner, retry_delay};
pub use status::BridgeStatus;
pub use store::{Entity, EntityStore};

// Re-export commonly used types from hass-common
pub use hass_common::{
    DiscoveryConfig, EntityDescriptor, EntityKind, EntityValue, LoggingConfig, MqttConfig,
    TopicBuilder,
};
