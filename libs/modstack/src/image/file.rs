//! File records and FIFO queues of a process image

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::register::{Register, RegisterCell};
use crate::constants::MAX_FIFO_SIZE;
use crate::error::{ModbusError, ModbusResult};

/// One record of a file: a fixed number of registers
#[derive(Debug)]
pub struct Record {
    number: u16,
    registers: Vec<Arc<Register>>,
}

impl Record {
    pub fn new(number: u16, register_count: usize) -> Self {
        Self {
            number,
            registers: (0..register_count)
                .map(|_| Arc::new(Register::default()))
                .collect(),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn register(&self, index: usize) -> ModbusResult<&Arc<Register>> {
        self.registers.get(index).ok_or_else(|| {
            ModbusError::illegal_address(format!(
                "record {} has no register {} (size {})",
                self.number,
                index,
                self.registers.len()
            ))
        })
    }
}

/// File: indexed records of registers, sizes fixed at construction
#[derive(Debug)]
pub struct File {
    number: u16,
    records: Vec<Record>,
}

impl File {
    pub fn new(number: u16, record_count: usize, registers_per_record: usize) -> Self {
        Self {
            number,
            records: (0..record_count)
                .map(|index| Record::new(index as u16, registers_per_record))
                .collect(),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, number: u16) -> ModbusResult<&Record> {
        self.records.get(number as usize).ok_or_else(|| {
            ModbusError::illegal_address(format!(
                "file {} has no record {} (size {})",
                self.number,
                number,
                self.records.len()
            ))
        })
    }

    /// Read `count` registers of `record` starting at register 0
    pub fn read(&self, record: u16, count: usize) -> ModbusResult<Vec<u16>> {
        let record = self.record(record)?;
        (0..count)
            .map(|index| record.register(index).map(|reg| reg.value()))
            .collect()
    }

    /// Write `values` into `record` starting at register 0
    pub fn write(&self, record: u16, values: &[u16]) -> ModbusResult<()> {
        let record = self.record(record)?;
        if values.len() > record.register_count() {
            return Err(ModbusError::illegal_address(format!(
                "record {} holds {} registers, {} written",
                record.number(),
                record.register_count(),
                values.len()
            )));
        }
        for (index, value) in values.iter().enumerate() {
            record.register(index)?.set_value(*value);
        }
        Ok(())
    }
}

/// FIFO queue of up to 31 register values; the oldest entry is evicted on overflow
#[derive(Debug)]
pub struct Fifo {
    address: u16,
    values: Mutex<VecDeque<u16>>,
}

impl Fifo {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            values: Mutex::new(VecDeque::with_capacity(MAX_FIFO_SIZE)),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn push(&self, value: u16) {
        let mut values = self.values.lock();
        if values.len() == MAX_FIFO_SIZE {
            values.pop_front();
        }
        values.push_back(value);
    }

    /// Snapshot of the queue, oldest first
    pub fn values(&self) -> Vec<u16> {
        self.values.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    pub fn clear(&self) {
        self.values.lock().clear();
    }
}
