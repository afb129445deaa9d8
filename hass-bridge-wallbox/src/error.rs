//! Error types for wallbox I/O.

use std::time::Duration;

use thiserror::Error;

use crate::registers::RegisterKind;

/// Outcome of a device task that did not complete.
///
/// Every variant is contained in the task that produced it; none of them stop
/// the worker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// The task queue is at capacity; the task was dropped.
    #[error("Task queue is full")]
    QueueFull,

    /// Opening the serial transport failed.
    #[error("Could not connect to the wallbox: {0}")]
    Connect(String),

    /// A register read failed on every attempt.
    #[error("Reading {kind} register {address} failed after {attempts} attempts: {message}")]
    ModbusRead {
        kind: RegisterKind,
        address: u16,
        attempts: u32,
        message: String,
    },

    /// The entity is not known to the bridge.
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// The value cannot be encoded for the entity.
    #[error("Invalid value '{value}' for {entity}")]
    InvalidValue { entity: String, value: String },

    /// The transport has not been opened.
    #[error("Wallbox is not connected")]
    NotConnected,

    /// A holding register write failed.
    #[error("Writing holding register {address} failed: {message}")]
    Write { address: u16, message: String },

    /// The worker exited before running the task.
    #[error("Device worker stopped")]
    WorkerStopped,
}

impl DeviceError {
    /// Create an invalid value error.
    pub fn invalid_value(entity: &str, value: impl ToString) -> Self {
        Self::InvalidValue {
            entity: entity.to_string(),
            value: value.to_string(),
        }
    }
}

/// Failure of a single request on the bus.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port could not be opened.
    #[error("Serial open failed: {0}")]
    Open(String),

    /// Transport or protocol level failure.
    #[error("Modbus error: {0}")]
    Modbus(String),

    /// The device answered with a Modbus exception.
    #[error("Exception: {0}")]
    Exception(String),

    /// No response within the per-call timeout.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The response carried fewer registers than requested.
    #[error("Expected {expected} registers, got {actual}")]
    ShortResponse { expected: u16, actual: usize },
}
