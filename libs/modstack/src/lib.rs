//! Modbus master/slave stack
//!
//! Speaks Modbus over TCP (MBAP or RTU-over-TCP), UDP and serial RTU.
//!
//! # Layers
//!
//! - [`pdu`] - function-code payloads, encoded and decoded big-endian
//! - [`transport`] - framing of one message on a medium (MBAP header,
//!   headless with CRC16, serial line timing)
//! - [`transaction`] - request/response pairing with retries, randomized
//!   backoff, reconnects and transaction ID checking
//! - [`master`] - typed read/write calls for one remote device
//! - [`image`] - the registers, coils, files and FIFOs a slave exposes
//! - [`slave`] - listeners answering requests from process images
//!
//! # Features
//!
//! - `serial` (default) - serial RTU via `tokio-serial`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use modstack::{ModbusMaster, ModbusSlave, ProcessImage};
//!
//! # async fn run() -> modstack::ModbusResult<()> {
//! let slave = ModbusSlave::tcp(1502)?;
//! slave.add_process_image(Arc::new(ProcessImage::with_registers(1, 10)));
//! slave.start().await?;
//!
//! let master = ModbusMaster::from_address("tcp:127.0.0.1:1502")?;
//! master.connect().await?;
//! let values = master.read_holding_registers(1, 0, 10).await?;
//! assert_eq!(values, vec![0; 10]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod image;
pub mod master;
pub mod message;
pub mod pdu;
pub mod slave;
pub mod transaction;
pub mod transport;

pub use config::{MasterConfig, Parity, SerialParameters, SlaveConfig, StopBits, TransportKind};
pub use connection::{MasterConnection, PortRegistry, Target, TcpConnection, UdpConnection};
#[cfg(feature = "serial")]
pub use connection::{SerialConnection, SerialPortRegistry};
pub use error::{ExceptionCode, ModbusError, ModbusResult};
pub use image::{Coil, Fifo, File, Observer, ProcessImage, Record, Register, RegisterCell};
pub use master::ModbusMaster;
pub use message::{Frame, MessageHeader, ModbusRequest, ModbusResponse};
pub use pdu::{RecordData, RecordRequest, RequestPdu, ResponsePdu};
pub use slave::{ListenerState, ModbusSlave, ProcessImageTable, SlaveRegistry, StatsSnapshot};
pub use transaction::{Transaction, TransactionIdCounter};
