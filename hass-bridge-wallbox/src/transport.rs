//! Modbus transport abstraction and the RTU implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::registers::RegisterKind;

/// An open connection to the wallbox.
///
/// Owned exclusively by the device worker, so methods take `&mut self`.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Read `count` consecutive registers starting at `address`.
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write one holding register.
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError>;

    /// Release the underlying port.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ModbusTransport>, TransportError>;
}

/// Connector for a serial Modbus RTU line.
#[derive(Debug, Clone)]
pub struct RtuConnector {
    config: TransportConfig,
}

impl RtuConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RtuConnector {
    async fn connect(&self) -> Result<Box<dyn ModbusTransport>, TransportError> {
        let config = &self.config;
        let timeout = Duration::from_millis(config.timeout_ms);

        let parity = match config.parity.to_lowercase().as_str() {
            "none" => tokio_serial::Parity::None,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::Even,
        };

        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .timeout(timeout);

        let serial = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| TransportError::Open(format!("{}: {}", config.port, e)))?;

        tracing::info!(
            port = %config.port,
            baud_rate = config.baud_rate,
            bus_id = config.bus_id,
            "Serial port opened"
        );

        Ok(Box::new(RtuTransport {
            ctx: rtu::attach_slave(serial, Slave(config.bus_id)),
            timeout,
        }))
    }
}

/// Modbus RTU client bound to one slave id.
pub struct RtuTransport {
    ctx: Context,
    timeout: Duration,
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = &mut self.ctx;
        let request = async move {
            match kind {
                RegisterKind::Input => ctx.read_input_registers(address, count).await,
                RegisterKind::Holding => ctx.read_holding_registers(address, count).await,
            }
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|e| TransportError::Modbus(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        tokio::time::timeout(self.timeout, self.ctx.write_single_register(address, value))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|e| TransportError::Modbus(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| TransportError::Modbus(e.to_string()))
    }
}
