//! Wallbox side of the bridge: worker, capture timer and command routing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use hass_bridge_framework::{BridgeHandler, EntityStore, StatePublisher};
use hass_common::{EntityDescriptor, EntityValue};

use crate::config::WallboxBridgeConfig;
use crate::error::DeviceError;
use crate::host::{self, HostSensors};
use crate::registers;
use crate::router::{self, CapturePipeline, CommandRouter};
use crate::transport::Connector;
use crate::trigger::{CaptureTrigger, WallClock};
use crate::worker::{DeviceHandle, DeviceWorker, Operation, Task};

/// Every entity the bridge announces.
pub fn entities(config: &WallboxBridgeConfig) -> Vec<EntityDescriptor> {
    let mut entities = registers::device_entities();
    entities.extend(router::local_entities(config.polling_interval_seconds));
    if config.host.enabled {
        entities.extend(host::host_entities());
    }
    entities
}

/// Running wallbox bridge.
pub struct WallboxBridge {
    device: DeviceHandle,
    router: CommandRouter,
    trigger: Arc<Mutex<CaptureTrigger>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WallboxBridge {
    /// Spawn the worker, connect, take a first capture and start the timer.
    ///
    /// `config_path` is where polling interval changes are saved.
    pub fn start<C: Connector + 'static>(
        config: &WallboxBridgeConfig,
        config_path: Option<PathBuf>,
        connector: C,
        store: EntityStore,
        publisher: Arc<dyn StatePublisher>,
        clock: WallClock,
    ) -> Result<Self, DeviceError> {
        let (device, worker) = DeviceWorker::spawn(connector, config.transport.max_read_attempts);
        device.enqueue(Task::new(Operation::Connect))?;

        let mut pipeline = CapturePipeline::new(device.clone(), store, publisher);
        if config.host.enabled {
            pipeline = pipeline.with_host(HostSensors::new(&config.host));
        }
        pipeline.request()?;

        let timer_pipeline = pipeline.clone();
        let mut trigger = CaptureTrigger::new(
            Duration::from_secs(config.polling_interval_seconds),
            clock,
            move || {
                if let Err(e) = timer_pipeline.request() {
                    tracing::warn!(error = %e, "Scheduled capture skipped");
                }
            },
        );
        trigger.start();
        let trigger = Arc::new(Mutex::new(trigger));

        let router = CommandRouter::new(
            pipeline,
            trigger.clone(),
            config_path,
            Duration::from_millis(config.settle_delay_ms),
        );

        tracing::info!(
            port = %config.transport.port,
            bus_id = config.transport.bus_id,
            polling_interval_secs = config.polling_interval_seconds,
            "Wallbox bridge started"
        );

        Ok(Self {
            device,
            router,
            trigger,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Producer handle of the device queue.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Stop the timer, then the worker.
    ///
    /// Tasks still queued behind the exit are dropped.
    pub async fn shutdown(&self) {
        self.trigger.lock().await.exit().await;

        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };

        match self.device.submit(Operation::Exit) {
            Ok(handle) => {
                if let Err(e) = handle.wait().await {
                    tracing::warn!(error = %e, "Worker did not exit cleanly");
                }
                let _ = worker.await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not queue exit, aborting worker");
                worker.abort();
            }
        }
    }
}

#[async_trait]
impl BridgeHandler for WallboxBridge {
    type Error = DeviceError;

    async fn on_command(&self, entity: &str, value: EntityValue) -> Result<(), DeviceError> {
        self.router.route(entity, value).await
    }

    async fn on_shutdown(&self) {
        self.shutdown().await;
    }
}
