//! Device task queue worker.
//!
//! A single task owns the Modbus transport and drains a bounded FIFO of
//! [`Task`]s, so at most one bus operation runs at a time. Producers never
//! block: a full queue rejects the task with [`DeviceError::QueueFull`].
//!
//! # Example
//!
//! ```ignore
//! let (device, worker) = DeviceWorker::spawn(RtuConnector::new(config.transport.clone()), 3);
//! device.enqueue(Task::new(Operation::Connect))?;
//!
//! let snapshot = device.submit(Operation::Capture)?.wait().await?;
//! ```

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use hass_common::EntityValue;

use crate::error::{DeviceError, TransportError};
use crate::registers::{self, CAPTURE_BLOCKS, DeviceSnapshot, RegisterImage, RegisterKind};
use crate::transport::{Connector, ModbusTransport};

/// Maximum number of queued tasks.
pub const QUEUE_CAPACITY: usize = 10;

/// Device operations understood by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Open the transport (reopening it if already open).
    Connect,
    /// Read all telemetry blocks and decode them.
    Capture,
    /// Encode `value` for a writable entity and write its register.
    Write { entity: String, value: EntityValue },
    /// Read single registers by address.
    RawRead { input: Vec<u16>, holding: Vec<u16> },
    /// Write one holding register verbatim.
    RawWrite { address: u16, value: u16 },
    /// Close the transport and stop the worker.
    Exit,
}

impl Operation {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Capture => "capture",
            Operation::Write { .. } => "write",
            Operation::RawRead { .. } => "raw_read",
            Operation::RawWrite { .. } => "raw_write",
            Operation::Exit => "exit",
        }
    }
}

/// One register value returned by a raw read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    pub kind: RegisterKind,
    pub address: u16,
    pub value: u16,
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Connected,
    Snapshot(DeviceSnapshot),
    Written { address: u16, raw: u16 },
    Registers(Vec<RegisterValue>),
    Stopped,
}

/// What a task's completion channel receives.
pub type TaskResult = Result<TaskOutput, DeviceError>;

/// A unit of work for the worker.
#[derive(Debug)]
pub struct Task {
    operation: Operation,
    completion: Option<oneshot::Sender<TaskResult>>,
}

impl Task {
    /// A task whose result is only logged.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            completion: None,
        }
    }

    /// A task together with the handle that receives its result.
    pub fn with_completion(operation: Operation) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            operation,
            completion: Some(tx),
        };
        (task, TaskHandle { rx })
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// Receives the result of one task.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Wait for the task to finish.
    ///
    /// A task dropped without running (worker exited first) yields
    /// [`DeviceError::WorkerStopped`].
    pub async fn wait(self) -> TaskResult {
        self.rx.await.unwrap_or(Err(DeviceError::WorkerStopped))
    }
}

/// Producer side of the task queue.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<Task>,
}

impl DeviceHandle {
    /// Queue a task without waiting.
    pub fn enqueue(&self, task: Task) -> Result<(), DeviceError> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                tracing::warn!(
                    operation = task.operation.name(),
                    capacity = QUEUE_CAPACITY,
                    "Task queue full, dropping task"
                );
                DeviceError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => DeviceError::WorkerStopped,
        })
    }

    /// Queue an operation and return the handle for its result.
    pub fn submit(&self, operation: Operation) -> Result<TaskHandle, DeviceError> {
        let (task, handle) = Task::with_completion(operation);
        self.enqueue(task)?;
        Ok(handle)
    }

    /// Number of tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        QUEUE_CAPACITY - self.tx.capacity()
    }

    /// Whether the worker has stopped accepting tasks.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the task queue; owns the transport.
pub struct DeviceWorker<C> {
    connector: C,
    transport: Option<Box<dyn ModbusTransport>>,
    max_read_attempts: u32,
    tasks: mpsc::Receiver<Task>,
}

impl<C: Connector + 'static> DeviceWorker<C> {
    /// Start the worker task.
    ///
    /// Returns the producer handle and the worker's join handle. The worker
    /// runs until it processes [`Operation::Exit`] or every handle is dropped.
    pub fn spawn(connector: C, max_read_attempts: u32) -> (DeviceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = Self {
            connector,
            transport: None,
            max_read_attempts: max_read_attempts.max(1),
            tasks: rx,
        };

        (DeviceHandle { tx }, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        tracing::info!(max_read_attempts = self.max_read_attempts, "Device worker started");

        while let Some(task) = self.tasks.recv().await {
            let Task {
                operation,
                completion,
            } = task;
            let name = operation.name();
            let exiting = operation == Operation::Exit;

            let result = self.dispatch(operation).await;

            match &result {
                Ok(_) => tracing::debug!(operation = name, "Task completed"),
                Err(e) => tracing::warn!(operation = name, error = %e, "Task failed"),
            }

            if let Some(completion) = completion {
                // The waiter may have given up; nothing to do then
                let _ = completion.send(result);
            }

            if exiting {
                break;
            }
        }

        self.tasks.close();
        let mut dropped = 0;
        while let Ok(task) = self.tasks.try_recv() {
            drop(task);
            dropped += 1;
        }

        // Reached when every handle was dropped without an exit task
        self.close().await;

        tracing::info!(dropped, "Device worker stopped");
    }

    async fn dispatch(&mut self, operation: Operation) -> TaskResult {
        match operation {
            Operation::Connect => self.connect().await.map(|()| TaskOutput::Connected),
            Operation::Capture => self.capture().await.map(TaskOutput::Snapshot),
            Operation::Write { entity, value } => self.write(&entity, &value).await,
            Operation::RawRead { input, holding } => self
                .raw_read(&input, &holding)
                .await
                .map(TaskOutput::Registers),
            Operation::RawWrite { address, value } => self
                .write_register(address, value)
                .await
                .map(|()| TaskOutput::Written {
                    address,
                    raw: value,
                }),
            Operation::Exit => {
                self.close().await;
                Ok(TaskOutput::Stopped)
            }
        }
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.close().await;

        let transport = self
            .connector
            .connect()
            .await
            .map_err(|e| DeviceError::Connect(e.to_string()))?;
        self.transport = Some(transport);

        tracing::info!("Wallbox connected");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "Error closing transport");
            }
            tracing::debug!("Transport closed");
        }
    }

    /// Read registers, retrying transport errors and short responses.
    async fn read(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        let transport = self.transport.as_mut().ok_or(DeviceError::NotConnected)?;
        let mut last_error = String::new();

        for attempt in 1..=self.max_read_attempts {
            match transport.read_registers(kind, address, count).await {
                Ok(words) if words.len() == usize::from(count) => return Ok(words),
                Ok(words) => {
                    last_error = TransportError::ShortResponse {
                        expected: count,
                        actual: words.len(),
                    }
                    .to_string();
                }
                Err(e) => last_error = e.to_string(),
            }

            tracing::debug!(
                kind = %kind,
                address,
                attempt,
                error = %last_error,
                "Modbus read attempt failed"
            );
        }

        tracing::error!(
            kind = %kind,
            address,
            attempts = self.max_read_attempts,
            error = %last_error,
            "Modbus read failed"
        );

        Err(DeviceError::ModbusRead {
            kind,
            address,
            attempts: self.max_read_attempts,
            message: last_error,
        })
    }

    async fn capture(&mut self) -> Result<DeviceSnapshot, DeviceError> {
        let mut image = RegisterImage::new();

        // Any failed block discards the whole capture
        for block in CAPTURE_BLOCKS {
            let words = self.read(block.kind, block.start, block.count).await?;
            image.insert_block(block.kind, block.start, &words);
        }

        let snapshot = registers::decode_snapshot(&image);

        tracing::info!(
            remote_enable = ?snapshot.get("remote_enable"),
            I_max_cmd = ?snapshot.get("I_max_cmd"),
            I_fail_safe = ?snapshot.get("I_fail_safe"),
            "Wallbox state captured"
        );

        Ok(snapshot)
    }

    async fn write(&mut self, entity: &str, value: &EntityValue) -> TaskResult {
        let register =
            registers::writable(entity).ok_or_else(|| DeviceError::UnknownEntity(entity.to_string()))?;
        let raw = (register.encode)(value).ok_or_else(|| DeviceError::invalid_value(entity, value))?;

        self.write_register(register.address, raw).await?;

        tracing::info!(entity = %entity, value = %value, address = register.address, raw, "Entity written");
        Ok(TaskOutput::Written {
            address: register.address,
            raw,
        })
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), DeviceError> {
        let transport = self.transport.as_mut().ok_or(DeviceError::NotConnected)?;

        transport
            .write_register(address, value)
            .await
            .map_err(|e| DeviceError::Write {
                address,
                message: e.to_string(),
            })?;

        tracing::debug!(address, value, "Holding register written");
        Ok(())
    }

    async fn raw_read(
        &mut self,
        input: &[u16],
        holding: &[u16],
    ) -> Result<Vec<RegisterValue>, DeviceError> {
        let requests = input
            .iter()
            .map(|a| (RegisterKind::Input, *a))
            .chain(holding.iter().map(|a| (RegisterKind::Holding, *a)));

        let mut values = Vec::with_capacity(input.len() + holding.len());
        for (kind, address) in requests {
            let words = self.read(kind, address, 1).await?;
            values.push(RegisterValue {
                kind,
                address,
                value: words[0],
            });
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BusOp, MockBus, MockConnector};

    fn spawn(bus: &MockBus, attempts: u32) -> (DeviceHandle, JoinHandle<()>) {
        DeviceWorker::spawn(MockConnector::new(bus.clone()), attempts)
    }

    async fn connected(bus: &MockBus, attempts: u32) -> (DeviceHandle, JoinHandle<()>) {
        let (device, worker) = spawn(bus, attempts);
        let result = device.submit(Operation::Connect).unwrap().wait().await;
        assert_eq!(result, Ok(TaskOutput::Connected));
        (device, worker)
    }

    #[tokio::test]
    async fn test_operations_need_connection() {
        let bus = MockBus::new();
        let (device, _worker) = spawn(&bus, 3);

        let result = device.submit(Operation::Capture).unwrap().wait().await;
        assert_eq!(result, Err(DeviceError::NotConnected));

        let result = device
            .submit(Operation::RawWrite {
                address: 261,
                value: 60,
            })
            .unwrap()
            .wait()
            .await;
        assert_eq!(result, Err(DeviceError::NotConnected));
        assert!(bus.log().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let bus = MockBus::new();
        bus.fail_connect(true);
        let (device, _worker) = spawn(&bus, 3);

        let result = device.submit(Operation::Connect).unwrap().wait().await;
        assert!(matches!(result, Err(DeviceError::Connect(_))));

        // The worker keeps serving after a failed task
        bus.fail_connect(false);
        let result = device.submit(Operation::Connect).unwrap().wait().await;
        assert_eq!(result, Ok(TaskOutput::Connected));
        assert_eq!(bus.connects(), 1);
    }

    #[tokio::test]
    async fn test_short_response_counts_as_failed_attempt() {
        let bus = MockBus::new();
        let (device, _worker) = connected(&bus, 2).await;
        bus.short_next_reads(1);

        let result = device.submit(Operation::Capture).unwrap().wait().await;

        assert!(matches!(result, Ok(TaskOutput::Snapshot(_))));
        assert_eq!(bus.read_count(), CAPTURE_BLOCKS.len() + 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_per_read() {
        let bus = MockBus::new();
        let (device, _worker) = connected(&bus, 3).await;

        // Four failures in total, but never more than two for the same read
        bus.fail_reads_at(RegisterKind::Input, 4, 2);
        bus.fail_reads_at(RegisterKind::Input, 100, 2);

        let result = device.submit(Operation::Capture).unwrap().wait().await;

        assert!(matches!(result, Ok(TaskOutput::Snapshot(_))));
        assert_eq!(bus.read_count(), CAPTURE_BLOCKS.len() + 4);
    }

    #[tokio::test]
    async fn test_raw_read_and_write() {
        let bus = MockBus::new();
        bus.set_register(RegisterKind::Input, 5, 7);
        bus.set_register(RegisterKind::Holding, 259, 1);
        let (device, _worker) = connected(&bus, 1).await;

        let result = device
            .submit(Operation::RawRead {
                input: vec![5],
                holding: vec![259],
            })
            .unwrap()
            .wait()
            .await;
        assert_eq!(
            result,
            Ok(TaskOutput::Registers(vec![
                RegisterValue {
                    kind: RegisterKind::Input,
                    address: 5,
                    value: 7,
                },
                RegisterValue {
                    kind: RegisterKind::Holding,
                    address: 259,
                    value: 1,
                },
            ]))
        );

        let result = device
            .submit(Operation::RawWrite {
                address: 257,
                value: 15000,
            })
            .unwrap()
            .wait()
            .await;
        assert_eq!(
            result,
            Ok(TaskOutput::Written {
                address: 257,
                raw: 15000,
            })
        );
        assert_eq!(bus.register(RegisterKind::Holding, 257), 15000);
    }

    #[tokio::test]
    async fn test_write_rejects_before_touching_bus() {
        let bus = MockBus::new();
        let (device, _worker) = connected(&bus, 1).await;

        let result = device
            .submit(Operation::Write {
                entity: "power_kW".to_string(),
                value: EntityValue::Integer(3),
            })
            .unwrap()
            .wait()
            .await;
        assert_eq!(result, Err(DeviceError::UnknownEntity("power_kW".to_string())));

        let result = device
            .submit(Operation::Write {
                entity: "remote_enable".to_string(),
                value: EntityValue::Integer(1),
            })
            .unwrap()
            .wait()
            .await;
        assert!(matches!(result, Err(DeviceError::InvalidValue { .. })));

        assert!(bus.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_reported() {
        let bus = MockBus::new();
        bus.fail_writes(true);
        let (device, _worker) = connected(&bus, 1).await;

        let result = device
            .submit(Operation::Write {
                entity: "standby".to_string(),
                value: EntityValue::off(),
            })
            .unwrap()
            .wait()
            .await;

        assert!(matches!(result, Err(DeviceError::Write { address: 258, .. })));
    }

    #[tokio::test]
    async fn test_exit_closes_transport() {
        let bus = MockBus::new();
        let (device, worker) = connected(&bus, 1).await;

        let result = device.submit(Operation::Exit).unwrap().wait().await;
        assert_eq!(result, Ok(TaskOutput::Stopped));

        worker.await.unwrap();
        assert_eq!(bus.log().last(), Some(&BusOp::Close));
        assert!(device.is_closed());
        assert_eq!(
            device.submit(Operation::Capture).unwrap_err(),
            DeviceError::WorkerStopped
        );
    }

    #[tokio::test]
    async fn test_queued_tasks_dropped_on_exit() {
        let bus = MockBus::new();
        let (device, worker) = spawn(&bus, 1);

        // Nothing runs until this task yields, so both land in the queue
        device.enqueue(Task::new(Operation::Exit)).unwrap();
        let pending = device.submit(Operation::Connect).unwrap();
        assert_eq!(device.pending(), 2);

        assert_eq!(pending.wait().await, Err(DeviceError::WorkerStopped));
        worker.await.unwrap();
        assert_eq!(bus.connects(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_dropped() {
        let bus = MockBus::new();
        let (device, worker) = connected(&bus, 1).await;

        drop(device);
        worker.await.unwrap();

        assert_eq!(bus.log(), vec![BusOp::Close]);
    }
}
