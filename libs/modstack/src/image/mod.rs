//! Slave-side process image
//!
//! The addressable memory a slave exposes: coils, discrete inputs, input
//! registers, holding registers, files and FIFO queues. Tables are guarded
//! by their own lock for add/remove; values are guarded per cell.
//!
//! Offsets are dense from 0 when cells are appended with `add_*`. Placing a
//! cell with `set_*` beyond the end leaves a gap, and any access that
//! touches a gap fails with an illegal-address error.

mod file;
mod register;

pub use file::{Fifo, File, Record};
pub use register::{Coil, Observer, Register, RegisterCell, VALUE_CHANGED};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ModbusError, ModbusResult};

/// Offset-indexed table with optional gaps
#[derive(Debug)]
struct Table<T> {
    kind: &'static str,
    cells: RwLock<Vec<Option<Arc<T>>>>,
}

impl<T> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            cells: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, cell: Arc<T>) -> usize {
        let mut cells = self.cells.write();
        cells.push(Some(cell));
        cells.len() - 1
    }

    fn set(&self, offset: usize, cell: Arc<T>) {
        let mut cells = self.cells.write();
        if offset >= cells.len() {
            cells.resize_with(offset + 1, || None);
        }
        cells[offset] = Some(cell);
    }

    fn remove(&self, offset: usize) -> Option<Arc<T>> {
        let mut cells = self.cells.write();
        let removed = cells.get_mut(offset).and_then(Option::take);
        while matches!(cells.last(), Some(None)) {
            cells.pop();
        }
        removed
    }

    fn len(&self) -> usize {
        self.cells.read().len()
    }

    fn get(&self, offset: usize) -> ModbusResult<Arc<T>> {
        self.cells
            .read()
            .get(offset)
            .and_then(Clone::clone)
            .ok_or_else(|| ModbusError::illegal_address(format!("no {} at {}", self.kind, offset)))
    }

    fn range(&self, offset: usize, count: usize) -> ModbusResult<Vec<Arc<T>>> {
        let cells = self.cells.read();
        let end = offset.checked_add(count).unwrap_or(usize::MAX);
        if end > cells.len() {
            return Err(ModbusError::illegal_address(format!(
                "{} range {}..{} outside 0..{}",
                self.kind,
                offset,
                end,
                cells.len()
            )));
        }
        cells[offset..end]
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                cell.clone().ok_or_else(|| {
                    ModbusError::illegal_address(format!("no {} at {}", self.kind, offset + index))
                })
            })
            .collect()
    }
}

/// Process image of one unit
#[derive(Debug)]
pub struct ProcessImage {
    unit_id: u8,
    coils: Table<Coil>,
    discrete_inputs: Table<Coil>,
    input_registers: Table<Register>,
    registers: Table<Register>,
    files: RwLock<BTreeMap<u16, Arc<File>>>,
    fifos: RwLock<BTreeMap<u16, Arc<Fifo>>>,
}

impl ProcessImage {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            coils: Table::new("coil"),
            discrete_inputs: Table::new("discrete input"),
            input_registers: Table::new("input register"),
            registers: Table::new("register"),
            files: RwLock::new(BTreeMap::new()),
            fifos: RwLock::new(BTreeMap::new()),
        }
    }

    /// Image with `count` zeroed holding registers at offsets 0..count
    pub fn with_registers(unit_id: u8, count: usize) -> Self {
        let image = Self::new(unit_id);
        for _ in 0..count {
            image.add_register(Arc::new(Register::default()));
        }
        image
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    // ===== Coils (digital outputs) =====

    pub fn add_coil(&self, coil: Arc<Coil>) -> usize {
        self.coils.add(coil)
    }

    pub fn set_coil(&self, offset: usize, coil: Arc<Coil>) {
        self.coils.set(offset, coil);
    }

    pub fn remove_coil(&self, offset: usize) -> Option<Arc<Coil>> {
        self.coils.remove(offset)
    }

    pub fn coil(&self, offset: usize) -> ModbusResult<Arc<Coil>> {
        self.coils.get(offset)
    }

    pub fn coil_range(&self, offset: usize, count: usize) -> ModbusResult<Vec<Arc<Coil>>> {
        self.coils.range(offset, count)
    }

    pub fn coil_count(&self) -> usize {
        self.coils.len()
    }

    // ===== Discrete inputs (digital inputs) =====

    pub fn add_discrete_input(&self, input: Arc<Coil>) -> usize {
        self.discrete_inputs.add(input)
    }

    pub fn set_discrete_input(&self, offset: usize, input: Arc<Coil>) {
        self.discrete_inputs.set(offset, input);
    }

    pub fn remove_discrete_input(&self, offset: usize) -> Option<Arc<Coil>> {
        self.discrete_inputs.remove(offset)
    }

    pub fn discrete_input(&self, offset: usize) -> ModbusResult<Arc<Coil>> {
        self.discrete_inputs.get(offset)
    }

    pub fn discrete_input_range(&self, offset: usize, count: usize) -> ModbusResult<Vec<Arc<Coil>>> {
        self.discrete_inputs.range(offset, count)
    }

    pub fn discrete_input_count(&self) -> usize {
        self.discrete_inputs.len()
    }

    // ===== Input registers =====

    pub fn add_input_register(&self, register: Arc<Register>) -> usize {
        self.input_registers.add(register)
    }

    pub fn set_input_register(&self, offset: usize, register: Arc<Register>) {
        self.input_registers.set(offset, register);
    }

    pub fn remove_input_register(&self, offset: usize) -> Option<Arc<Register>> {
        self.input_registers.remove(offset)
    }

    pub fn input_register(&self, offset: usize) -> ModbusResult<Arc<Register>> {
        self.input_registers.get(offset)
    }

    pub fn input_register_range(
        &self,
        offset: usize,
        count: usize,
    ) -> ModbusResult<Vec<Arc<Register>>> {
        self.input_registers.range(offset, count)
    }

    pub fn input_register_count(&self) -> usize {
        self.input_registers.len()
    }

    // ===== Holding registers =====

    pub fn add_register(&self, register: Arc<Register>) -> usize {
        self.registers.add(register)
    }

    pub fn set_register(&self, offset: usize, register: Arc<Register>) {
        self.registers.set(offset, register);
    }

    pub fn remove_register(&self, offset: usize) -> Option<Arc<Register>> {
        self.registers.remove(offset)
    }

    pub fn register(&self, offset: usize) -> ModbusResult<Arc<Register>> {
        self.registers.get(offset)
    }

    pub fn register_range(&self, offset: usize, count: usize) -> ModbusResult<Vec<Arc<Register>>> {
        self.registers.range(offset, count)
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    // ===== Files =====

    /// Add a file, replacing any file with the same number
    pub fn add_file(&self, file: Arc<File>) {
        self.files.write().insert(file.number(), file);
    }

    pub fn remove_file(&self, number: u16) -> Option<Arc<File>> {
        self.files.write().remove(&number)
    }

    pub fn file(&self, number: u16) -> ModbusResult<Arc<File>> {
        self.files
            .read()
            .get(&number)
            .cloned()
            .ok_or_else(|| ModbusError::illegal_address(format!("no file {}", number)))
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    // ===== FIFO queues =====

    /// Add a FIFO, replacing any FIFO at the same address
    pub fn add_fifo(&self, fifo: Arc<Fifo>) {
        self.fifos.write().insert(fifo.address(), fifo);
    }

    pub fn remove_fifo(&self, address: u16) -> Option<Arc<Fifo>> {
        self.fifos.write().remove(&address)
    }

    pub fn fifo(&self, address: u16) -> ModbusResult<Arc<Fifo>> {
        self.fifos
            .read()
            .get(&address)
            .cloned()
            .ok_or_else(|| ModbusError::illegal_address(format!("no FIFO at {}", address)))
    }

    pub fn fifo_count(&self) -> usize {
        self.fifos.read().len()
    }
}
