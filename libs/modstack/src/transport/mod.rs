//! Modbus transports
//!
//! A transport frames and deframes one message at a time on an open medium.
//! Stream media (TCP, serial, in-memory pipes) share [`StreamTransport`];
//! the master side of UDP uses [`UdpTransport`].

mod framing;
mod stream;
mod udp;

#[cfg(feature = "serial")]
mod serial;

pub use framing::{crc16, decode_headless, decode_mbap, decode_mbap_header, encode_headless, encode_mbap};
pub use stream::{Framing, SerialTiming, StreamTransport};
pub use udp::UdpTransport;

#[cfg(feature = "serial")]
pub use serial::{open_serial, SerialTransport};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ModbusResult;
use crate::message::{Frame, ModbusRequest, ModbusResponse};

/// Which side of the exchange a frame comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Read by a slave: waits indefinitely for the first byte, then the
    /// rest of the frame must arrive within the timeout
    Request,
    /// Read by a master: the whole frame must arrive within the timeout
    Response,
}

/// Frame-level I/O on one open medium
#[async_trait]
pub trait ModbusTransport: Send {
    /// Read one complete frame
    async fn read_frame(&mut self, kind: FrameKind) -> ModbusResult<Frame>;

    /// Write one complete frame
    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()>;

    fn set_timeout(&mut self, timeout: Duration);

    fn timeout(&self) -> Duration;

    /// Headless framings carry no transaction ID
    fn is_headless(&self) -> bool;

    async fn close(&mut self) -> ModbusResult<()>;

    async fn write_request(&mut self, request: &ModbusRequest) -> ModbusResult<()> {
        self.write_frame(&request.to_frame()).await
    }

    async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
        let frame = self.read_frame(FrameKind::Response).await?;
        ModbusResponse::from_frame(&frame)
    }

    async fn write_response(&mut self, response: &ModbusResponse) -> ModbusResult<()> {
        self.write_frame(&response.to_frame()).await
    }
}
