//! Modbus master facade
//!
//! Binds a unit ID and reference range to a request, runs it through the
//! transaction engine and unpacks the typed result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::MasterConfig;
use crate::connection::{MasterConnection, Target, TcpConnection, UdpConnection};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{ModbusRequest, ModbusResponse};
use crate::pdu::{RecordData, RecordRequest, RequestPdu, ResponsePdu};
use crate::transaction::{Transaction, TransactionIdCounter};

#[cfg(feature = "serial")]
use crate::config::SerialParameters;
#[cfg(feature = "serial")]
use crate::connection::SerialConnection;

/// Modbus master (client)
pub struct ModbusMaster {
    connection: Mutex<Box<dyn MasterConnection>>,
    transaction: Transaction,
}

fn unexpected(expected: &str, response: &ResponsePdu) -> ModbusError {
    ModbusError::protocol(format!(
        "expected {} response, got FC={:02X}",
        expected,
        response.function_code()
    ))
}

/// Register reads must answer with exactly the requested count
fn exact_registers(values: Vec<u16>, count: usize) -> ModbusResult<Vec<u16>> {
    if values.len() != count {
        return Err(ModbusError::protocol(format!(
            "response carries {} registers, {} requested",
            values.len(),
            count
        )));
    }
    Ok(values)
}

/// Bit reads may only pad the last byte
fn exact_bits(mut values: Vec<bool>, count: usize) -> ModbusResult<Vec<bool>> {
    if values.len() < count || values.len() > count.div_ceil(8) * 8 {
        return Err(ModbusError::protocol(format!(
            "response carries {} bits, {} requested",
            values.len(),
            count
        )));
    }
    values.truncate(count);
    Ok(values)
}

impl ModbusMaster {
    /// Master over an arbitrary connection, sharing the process-wide transaction counter
    pub fn with_connection(connection: Box<dyn MasterConnection>) -> Self {
        Self {
            connection: Mutex::new(connection),
            transaction: Transaction::default(),
        }
    }

    /// Modbus TCP master
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::with_connection(Box::new(TcpConnection::new(host, port)))
    }

    /// RTU-over-TCP master (headless framing with CRC on a TCP stream)
    pub fn rtu_over_tcp(host: impl Into<String>, port: u16) -> Self {
        Self::with_connection(Box::new(TcpConnection::new(host, port).rtu_over_tcp(true)))
    }

    /// Modbus UDP master
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::with_connection(Box::new(UdpConnection::new(host, port)))
    }

    /// Serial RTU master; the port is shared with other masters on the same device
    #[cfg(feature = "serial")]
    pub fn serial(parameters: SerialParameters) -> Self {
        Self::with_connection(Box::new(SerialConnection::new(parameters)))
    }

    /// Master for `device:<portName>`, `tcp:<host>[:<port>]` or `udp:<host>[:<port>]`
    pub fn from_address(address: &str) -> ModbusResult<Self> {
        Self::from_config(&MasterConfig {
            target: address.to_string(),
            ..MasterConfig::default()
        })
    }

    pub fn from_config(config: &MasterConfig) -> ModbusResult<Self> {
        config.validate()?;
        let mut master = match Target::parse(&config.target)? {
            Target::Tcp { host, port } if config.rtu_over_tcp => Self::rtu_over_tcp(host, port),
            Target::Tcp { host, port } => Self::tcp(host, port),
            Target::Udp { host, port } => Self::udp(host, port),
            #[cfg(feature = "serial")]
            Target::Device(port_name) => {
                let parameters = SerialParameters {
                    port_name,
                    ..config.serial.clone()
                };
                parameters.validate()?;
                Self::serial(parameters)
            },
            #[cfg(not(feature = "serial"))]
            Target::Device(port_name) => {
                return Err(ModbusError::config(format!(
                    "serial support is disabled, cannot open {}",
                    port_name
                )));
            },
        };
        master.set_timeout(config.timeout());
        master.set_retries(config.retries);
        master.set_retry_delay(config.retry_delay());
        master.set_check_validity(config.check_validity);
        master.set_reconnecting(config.reconnecting);
        info!("Modbus master for {}", config.target);
        Ok(master)
    }

    // ===== Settings =====

    pub async fn timeout(&self) -> Duration {
        self.connection.lock().await.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connection.get_mut().set_timeout(timeout);
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.transaction.set_retries(retries);
    }

    pub fn set_retry_delay(&mut self, retry_delay: Duration) {
        self.transaction.set_retry_delay(retry_delay);
    }

    pub fn set_check_validity(&mut self, check_validity: bool) {
        self.transaction.set_check_validity(check_validity);
    }

    pub fn set_reconnecting(&mut self, reconnecting: bool) {
        self.transaction.set_reconnecting(reconnecting);
    }

    /// Use a private transaction-ID counter instead of the process-wide one
    pub fn set_counter(&mut self, counter: Arc<TransactionIdCounter>) {
        let mut transaction = Transaction::new(counter);
        transaction.set_retries(self.transaction.retries());
        transaction.set_retry_delay(self.transaction.retry_delay());
        transaction.set_check_validity(self.transaction.check_validity());
        transaction.set_reconnecting(self.transaction.reconnecting());
        self.transaction = transaction;
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    // ===== Connection =====

    pub async fn connect(&self) -> ModbusResult<()> {
        self.connection.lock().await.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.lock().await.close().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_connected()
    }

    /// Execute a raw request; only one request runs at a time per master
    pub async fn execute(&self, mut request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.pdu.validate()?;
        let mut connection = self.connection.lock().await;
        self.transaction
            .execute(&mut **connection, &mut request)
            .await
    }

    async fn request(&self, unit_id: u8, pdu: RequestPdu) -> ModbusResult<ResponsePdu> {
        Ok(self.execute(ModbusRequest::new(unit_id, pdu)).await?.pdu)
    }

    // ===== Function codes =====

    /// FC01
    pub async fn read_coils(&self, unit_id: u8, reference: u16, count: u16) -> ModbusResult<Vec<bool>> {
        match self
            .request(unit_id, RequestPdu::ReadCoils { reference, count })
            .await?
        {
            ResponsePdu::ReadCoils { values } => exact_bits(values, count as usize),
            other => Err(unexpected("read coils", &other)),
        }
    }

    /// FC02
    pub async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        reference: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        match self
            .request(unit_id, RequestPdu::ReadDiscreteInputs { reference, count })
            .await?
        {
            ResponsePdu::ReadDiscreteInputs { values } => exact_bits(values, count as usize),
            other => Err(unexpected("read discrete inputs", &other)),
        }
    }

    /// FC03
    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        reference: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        match self
            .request(unit_id, RequestPdu::ReadHoldingRegisters { reference, count })
            .await?
        {
            ResponsePdu::ReadHoldingRegisters { values } => exact_registers(values, count as usize),
            other => Err(unexpected("read holding registers", &other)),
        }
    }

    /// FC04
    pub async fn read_input_registers(
        &self,
        unit_id: u8,
        reference: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        match self
            .request(unit_id, RequestPdu::ReadInputRegisters { reference, count })
            .await?
        {
            ResponsePdu::ReadInputRegisters { values } => exact_registers(values, count as usize),
            other => Err(unexpected("read input registers", &other)),
        }
    }

    /// FC05; returns the coil state echoed by the slave
    pub async fn write_coil(&self, unit_id: u8, reference: u16, value: bool) -> ModbusResult<bool> {
        match self
            .request(unit_id, RequestPdu::WriteSingleCoil { reference, value })
            .await?
        {
            ResponsePdu::WriteSingleCoil { value, .. } => Ok(value),
            other => Err(unexpected("write coil", &other)),
        }
    }

    /// FC06
    pub async fn write_register(&self, unit_id: u8, reference: u16, value: u16) -> ModbusResult<()> {
        match self
            .request(unit_id, RequestPdu::WriteSingleRegister { reference, value })
            .await?
        {
            ResponsePdu::WriteSingleRegister { .. } => Ok(()),
            other => Err(unexpected("write register", &other)),
        }
    }

    /// FC15
    pub async fn write_coils(&self, unit_id: u8, reference: u16, values: &[bool]) -> ModbusResult<()> {
        let pdu = RequestPdu::WriteMultipleCoils {
            reference,
            values: values.to_vec(),
        };
        match self.request(unit_id, pdu).await? {
            ResponsePdu::WriteMultipleCoils { .. } => Ok(()),
            other => Err(unexpected("write coils", &other)),
        }
    }

    /// FC16
    pub async fn write_registers(&self, unit_id: u8, reference: u16, values: &[u16]) -> ModbusResult<()> {
        let pdu = RequestPdu::WriteMultipleRegisters {
            reference,
            values: values.to_vec(),
        };
        match self.request(unit_id, pdu).await? {
            ResponsePdu::WriteMultipleRegisters { .. } => Ok(()),
            other => Err(unexpected("write registers", &other)),
        }
    }

    /// FC20; one register vector per sub-request
    pub async fn read_file_record(
        &self,
        unit_id: u8,
        records: &[RecordRequest],
    ) -> ModbusResult<Vec<Vec<u16>>> {
        let pdu = RequestPdu::ReadFileRecord {
            records: records.to_vec(),
        };
        match self.request(unit_id, pdu).await? {
            ResponsePdu::ReadFileRecord { records: values } if values.len() == records.len() => {
                Ok(values)
            },
            other => Err(unexpected("read file record", &other)),
        }
    }

    /// FC21
    pub async fn write_file_record(&self, unit_id: u8, records: Vec<RecordData>) -> ModbusResult<()> {
        match self
            .request(unit_id, RequestPdu::WriteFileRecord { records })
            .await?
        {
            ResponsePdu::WriteFileRecord { .. } => Ok(()),
            other => Err(unexpected("write file record", &other)),
        }
    }

    /// FC22: `(current & and_mask) | (or_mask & !and_mask)`
    pub async fn mask_write_register(
        &self,
        unit_id: u8,
        reference: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        let pdu = RequestPdu::MaskWriteRegister {
            reference,
            and_mask,
            or_mask,
        };
        match self.request(unit_id, pdu).await? {
            ResponsePdu::MaskWriteRegister { .. } => Ok(()),
            other => Err(unexpected("mask write register", &other)),
        }
    }

    /// FC23: write first, then read
    pub async fn read_write_registers(
        &self,
        unit_id: u8,
        read_reference: u16,
        read_count: u16,
        write_reference: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        let pdu = RequestPdu::ReadWriteMultipleRegisters {
            read_reference,
            read_count,
            write_reference,
            values: values.to_vec(),
        };
        match self.request(unit_id, pdu).await? {
            ResponsePdu::ReadWriteMultipleRegisters { values } => exact_registers(values, read_count as usize),
            other => Err(unexpected("read/write registers", &other)),
        }
    }

    /// FC24
    pub async fn read_fifo_queue(&self, unit_id: u8, reference: u16) -> ModbusResult<Vec<u16>> {
        match self
            .request(unit_id, RequestPdu::ReadFifoQueue { reference })
            .await?
        {
            ResponsePdu::ReadFifoQueue { values } => Ok(values),
            other => Err(unexpected("read FIFO queue", &other)),
        }
    }
}
