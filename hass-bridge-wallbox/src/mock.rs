//! Scripted in-memory wallbox used to exercise the worker without a serial line.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::registers::RegisterKind;
use crate::transport::{Connector, ModbusTransport};

/// One request seen by the mock bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Read {
        kind: RegisterKind,
        address: u16,
        count: u16,
    },
    Write {
        address: u16,
        value: u16,
    },
    Close,
}

#[derive(Debug, Default)]
struct BusState {
    registers: BTreeMap<(RegisterKind, u16), u16>,
    log: Vec<BusOp>,
    connects: usize,
    fail_connect: bool,
    failing_addresses: BTreeMap<(RegisterKind, u16), usize>,
    fail_all_reads: bool,
    short_reads: usize,
    fail_writes: bool,
}

/// Shared register file and failure script.
///
/// Clones share state, so a test keeps one clone for inspection and hands
/// another to [`MockConnector`].
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set one register.
    pub fn set_register(&self, kind: RegisterKind, address: u16, value: u16) {
        self.lock().registers.insert((kind, address), value);
    }

    /// Set consecutive registers starting at `start`.
    pub fn set_registers(&self, kind: RegisterKind, start: u16, values: &[u16]) {
        let mut state = self.lock();
        for (address, value) in (start..).zip(values) {
            state.registers.insert((kind, address), *value);
        }
    }

    /// Current value of a register; unset registers read as 0.
    pub fn register(&self, kind: RegisterKind, address: u16) -> u16 {
        self.lock()
            .registers
            .get(&(kind, address))
            .copied()
            .unwrap_or(0)
    }

    /// Make connection attempts fail.
    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Fail the next `count` read requests starting at `address`.
    pub fn fail_reads_at(&self, kind: RegisterKind, address: u16, count: usize) {
        self.lock().failing_addresses.insert((kind, address), count);
    }

    /// Fail every read request.
    pub fn fail_all_reads(&self, fail: bool) {
        self.lock().fail_all_reads = fail;
    }

    /// Answer the next `count` read requests with one register too few.
    pub fn short_next_reads(&self, count: usize) {
        self.lock().short_reads = count;
    }

    /// Make register writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Requests seen so far, in order.
    pub fn log(&self) -> Vec<BusOp> {
        self.lock().log.clone()
    }

    /// Writes seen so far, in order.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                BusOp::Write { address, value } => Some((*address, *value)),
                _ => None,
            })
            .collect()
    }

    /// Number of read requests seen so far, failed ones included.
    pub fn read_count(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|op| matches!(op, BusOp::Read { .. }))
            .count()
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }
}

/// Connector handing out transports on a [`MockBus`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    bus: MockBus,
}

impl MockConnector {
    pub fn new(bus: MockBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn ModbusTransport>, TransportError> {
        let mut state = self.bus.lock();
        if state.fail_connect {
            return Err(TransportError::Open("mock port unavailable".to_string()));
        }
        state.connects += 1;

        Ok(Box::new(MockTransport {
            bus: self.bus.clone(),
        }))
    }
}

/// Transport reading and writing the mock register file.
#[derive(Debug)]
pub struct MockTransport {
    bus: MockBus,
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut state = self.bus.lock();
        state.log.push(BusOp::Read {
            kind,
            address,
            count,
        });

        if state.fail_all_reads {
            return Err(TransportError::Modbus("simulated read failure".to_string()));
        }
        if let Some(remaining) = state.failing_addresses.get_mut(&(kind, address)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Timeout(std::time::Duration::from_secs(10)));
            }
        }

        let mut count = count;
        if state.short_reads > 0 {
            state.short_reads -= 1;
            count = count.saturating_sub(1);
        }

        Ok((address..)
            .take(usize::from(count))
            .map(|a| state.registers.get(&(kind, a)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        state.log.push(BusOp::Write { address, value });

        if state.fail_writes {
            return Err(TransportError::Exception("IllegalDataAddress".to_string()));
        }

        state.registers.insert((RegisterKind::Holding, address), value);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.bus.lock().log.push(BusOp::Close);
        Ok(())
    }
}
