//! Framed Modbus messages
//!
//! A [`Frame`] is what transports move: the header fields that survive the
//! framing plus the raw PDU bytes. Requests and responses decode their PDU
//! from a frame separately, so a slave can still answer a frame whose PDU
//! does not parse.

use bytes::Bytes;

use crate::error::ModbusResult;
use crate::pdu::{RequestPdu, ResponsePdu};

/// Header fields of a Modbus ADU
///
/// Headless framings only carry `unit_id`; the other fields are then zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
}

impl MessageHeader {
    pub fn new(transaction_id: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
        }
    }
}

/// Raw frame: header plus PDU bytes (function code first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub pdu: Bytes,
}

impl Frame {
    pub fn new(header: MessageHeader, pdu: Bytes) -> Self {
        Self { header, pdu }
    }

    /// Function code, 0 for an empty PDU
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or(0)
    }

    /// Value of the MBAP length field: unit ID + function code + payload
    pub fn mbap_length(&self) -> u16 {
        (self.pdu.len() + 1) as u16
    }
}

/// Request addressed to one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub header: MessageHeader,
    pub pdu: RequestPdu,
}

impl ModbusRequest {
    pub fn new(unit_id: u8, pdu: RequestPdu) -> Self {
        Self {
            header: MessageHeader::new(0, unit_id),
            pdu,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }

    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn set_transaction_id(&mut self, transaction_id: u16) {
        self.header.transaction_id = transaction_id;
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header, self.pdu.to_bytes())
    }

    pub fn from_frame(frame: &Frame) -> ModbusResult<Self> {
        Ok(Self {
            header: frame.header,
            pdu: RequestPdu::decode(&frame.pdu)?,
        })
    }
}

/// Response from one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub header: MessageHeader,
    pub pdu: ResponsePdu,
}

impl ModbusResponse {
    pub fn new(header: MessageHeader, pdu: ResponsePdu) -> Self {
        Self { header, pdu }
    }

    /// Response that mirrors the request header
    pub fn for_request(request: &MessageHeader, pdu: ResponsePdu) -> Self {
        Self::new(*request, pdu)
    }

    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }

    pub fn is_exception(&self) -> bool {
        self.pdu.is_exception()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header, self.pdu.to_bytes())
    }

    pub fn from_frame(frame: &Frame) -> ModbusResult<Self> {
        Ok(Self {
            header: frame.header,
            pdu: ResponsePdu::decode(&frame.pdu)?,
        })
    }
}
