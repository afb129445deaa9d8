//! Capture completion and command routing.
//!
//! Commands for device registers become write tasks followed by a
//! confirming capture. `polling_interval` and `manual_poll` are handled by
//! the bridge itself. Routing never waits for the bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use hass_bridge_framework::{EntityStore, StatePublisher};
use hass_common::{EntityDescriptor, EntityValue, update_config_scalar};

use crate::config::POLLING_INTERVAL_KEY;
use crate::error::DeviceError;
use crate::host::HostSensors;
use crate::registers;
use crate::trigger::CaptureTrigger;
use crate::worker::{DeviceHandle, Operation, TaskHandle, TaskOutput};

/// Capture period in seconds, settable from Home Assistant.
pub const POLLING_INTERVAL: &str = "polling_interval";

/// Switch that requests an immediate capture.
pub const MANUAL_POLL: &str = "manual_poll";

/// Entities owned by the bridge rather than by wallbox registers.
pub fn local_entities(polling_interval_secs: u64) -> Vec<EntityDescriptor> {
    let initial = i64::try_from(polling_interval_secs).unwrap_or(i64::MAX);

    vec![
        EntityDescriptor::number(POLLING_INTERVAL, "Polling interval")
            .with_device_class("duration")
            .with_unit("s")
            .with_icon("timer-sync-outline")
            .with_range(1.0, 3600.0, 1.0)
            .with_initial(initial),
        EntityDescriptor::switch(MANUAL_POLL, "Manual poll")
            .with_icon("refresh")
            .with_initial(EntityValue::off()),
    ]
}

/// Enqueues captures and folds their snapshots into the entity store.
#[derive(Clone)]
pub struct CapturePipeline {
    device: DeviceHandle,
    store: EntityStore,
    publisher: Arc<dyn StatePublisher>,
    host: Option<HostSensors>,
}

impl CapturePipeline {
    pub fn new(device: DeviceHandle, store: EntityStore, publisher: Arc<dyn StatePublisher>) -> Self {
        Self {
            device,
            store,
            publisher,
            host: None,
        }
    }

    /// Refresh the host sensors on every capture.
    pub fn with_host(mut self, host: HostSensors) -> Self {
        self.host = Some(host);
        self
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Enqueue a capture.
    ///
    /// The returned task applies the snapshot and publishes the changed
    /// entities once the worker is done. A failed capture leaves the device
    /// entities untouched; host sensors are refreshed either way.
    pub fn request(&self) -> Result<JoinHandle<()>, DeviceError> {
        let handle = self.device.submit(Operation::Capture)?;
        let pipeline = self.clone();

        Ok(tokio::spawn(async move { pipeline.complete(handle).await }))
    }

    async fn complete(&self, handle: TaskHandle) {
        let host_changed = self.refresh_host().await;

        let captured = match handle.wait().await {
            Ok(TaskOutput::Snapshot(snapshot)) => {
                let changed = self.store.apply(snapshot);
                tracing::debug!(changed, "Snapshot applied");
                true
            }
            Ok(other) => {
                tracing::warn!(output = ?other, "Unexpected capture output");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Capture failed, keeping previous state");
                false
            }
        };

        if captured || host_changed > 0 {
            self.publish().await;
        }
    }

    async fn refresh_host(&self) -> usize {
        let Some(host) = self.host.clone() else {
            return 0;
        };

        match tokio::task::spawn_blocking(move || host.read()).await {
            Ok(reading) => self.store.apply(reading.into_values()),
            Err(e) => {
                tracing::warn!(error = %e, "Host sensor read failed");
                0
            }
        }
    }

    /// Publish the entities changed since the last publish.
    pub async fn publish(&self) {
        if let Err(e) = self.publisher.publish_updates(&self.store, false).await {
            tracing::warn!(error = %e, "Failed to publish state");
        }
    }
}

/// Routes `(entity, value)` commands from Home Assistant.
pub struct CommandRouter {
    pipeline: CapturePipeline,
    trigger: Arc<Mutex<CaptureTrigger>>,
    config_path: Option<PathBuf>,
    settle_delay: Duration,
}

impl CommandRouter {
    /// Create a router.
    ///
    /// With `config_path`, polling interval changes are written back to that
    /// file.
    pub fn new(
        pipeline: CapturePipeline,
        trigger: Arc<Mutex<CaptureTrigger>>,
        config_path: Option<PathBuf>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            pipeline,
            trigger,
            config_path,
            settle_delay,
        }
    }

    /// Route one command.
    pub async fn route(&self, entity: &str, value: EntityValue) -> Result<(), DeviceError> {
        match entity {
            POLLING_INTERVAL => self.set_polling_interval(value).await,
            MANUAL_POLL => self.manual_poll(&value),
            name => self.write(name, value).map(|_| ()),
        }
    }

    /// Enqueue a register write and, once it succeeds, a confirming capture
    /// after the settle delay.
    ///
    /// Returns the follow-up task; unknown entities and unencodable values
    /// are rejected before anything is queued.
    pub fn write(&self, entity: &str, value: EntityValue) -> Result<JoinHandle<()>, DeviceError> {
        let register =
            registers::writable(entity).ok_or_else(|| DeviceError::UnknownEntity(entity.to_string()))?;
        if (register.encode)(&value).is_none() {
            return Err(DeviceError::invalid_value(entity, &value));
        }

        let handle = self.pipeline.device().submit(Operation::Write {
            entity: entity.to_string(),
            value,
        })?;

        let pipeline = self.pipeline.clone();
        let settle_delay = self.settle_delay;
        let entity = entity.to_string();

        Ok(tokio::spawn(async move {
            if let Err(e) = handle.wait().await {
                tracing::warn!(entity = %entity, error = %e, "Write failed");
                return;
            }

            tokio::time::sleep(settle_delay).await;

            match pipeline.request() {
                // The capture publishes on its own
                Ok(capture) => {
                    let _ = capture.await;
                }
                Err(e) => tracing::warn!(entity = %entity, error = %e, "Could not queue capture"),
            }
        }))
    }

    fn manual_poll(&self, value: &EntityValue) -> Result<(), DeviceError> {
        match value.as_str() {
            Some("ON") => {
                tracing::info!("Manual poll requested");
                self.pipeline.request().map(|_| ())
            }
            Some("OFF") => Ok(()),
            _ => Err(DeviceError::invalid_value(MANUAL_POLL, value)),
        }
    }

    async fn set_polling_interval(&self, value: EntityValue) -> Result<(), DeviceError> {
        let seconds = value
            .as_f64()
            .map(f64::round)
            .filter(|s| *s >= 1.0 && *s <= u32::MAX as f64)
            .ok_or_else(|| DeviceError::invalid_value(POLLING_INTERVAL, &value))?
            as u64;

        self.pipeline
            .store()
            .set_entity(POLLING_INTERVAL, EntityValue::from(seconds as i64))
            .map_err(|_| DeviceError::UnknownEntity(POLLING_INTERVAL.to_string()))?;

        self.trigger
            .lock()
            .await
            .update_interval(Duration::from_secs(seconds))
            .await;

        if let Some(path) = &self.config_path {
            let path = path.clone();
            let persisted = tokio::task::spawn_blocking(move || {
                update_config_scalar(&path, POLLING_INTERVAL_KEY, seconds)
            })
            .await;

            match persisted {
                Ok(Ok(())) => tracing::info!(seconds, "Polling interval saved"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to save polling interval"),
                Err(e) => tracing::warn!(error = %e, "Failed to save polling interval"),
            }
        }

        self.pipeline.publish().await;
        Ok(())
    }
}
