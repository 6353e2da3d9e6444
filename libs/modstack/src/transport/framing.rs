//! Byte-level framing shared by stream and datagram transports
//!
//! - MBAP: `[tid:u16][pid:u16][len:u16][unit:u8][pdu]`, `len` = PDU + 1
//! - Headless: `[unit:u8][pdu]`, optionally followed by CRC16 (low byte first)

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MAX_MESSAGE_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{Frame, MessageHeader};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus RTU CRC16 (poly 0xA001 reflected, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Build an MBAP frame (header + unit ID + PDU)
pub fn encode_mbap(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + frame.pdu.len());
    buf.put_u16(frame.header.transaction_id);
    buf.put_u16(frame.header.protocol_id);
    buf.put_u16(frame.mbap_length());
    buf.put_u8(frame.header.unit_id);
    buf.put_slice(&frame.pdu);
    buf
}

/// Parse the 7 leading bytes of an MBAP frame
///
/// Returns the header and the number of PDU bytes that follow.
pub fn decode_mbap_header(data: &[u8]) -> ModbusResult<(MessageHeader, usize)> {
    if data.len() < MBAP_HEADER_LEN + 1 {
        return Err(ModbusError::protocol(format!(
            "MBAP header too short: {} bytes",
            data.len()
        )));
    }
    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let protocol_id = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    let unit_id = data[6];

    if protocol_id != 0 {
        return Err(ModbusError::protocol(format!(
            "Invalid protocol ID: expected 0, got {}",
            protocol_id
        )));
    }
    if !(2..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(ModbusError::protocol(format!(
            "Invalid MBAP length field: {}",
            length
        )));
    }

    Ok((
        MessageHeader {
            transaction_id,
            protocol_id,
            unit_id,
        },
        length - 1,
    ))
}

/// Parse a complete MBAP frame (one datagram)
pub fn decode_mbap(data: &[u8]) -> ModbusResult<Frame> {
    let (header, pdu_len) = decode_mbap_header(data)?;
    let body = &data[MBAP_HEADER_LEN + 1..];
    if body.len() != pdu_len {
        return Err(ModbusError::protocol(format!(
            "Invalid MBAP frame length: header announces {} PDU bytes, got {}",
            pdu_len,
            body.len()
        )));
    }
    debug!(
        "MBAP frame: tid={:04X}, unit={}, FC={:02X}, PDU_len={}",
        header.transaction_id,
        header.unit_id,
        body[0],
        pdu_len
    );
    Ok(Frame::new(header, Bytes::copy_from_slice(body)))
}

/// Build a headless frame (unit ID + PDU [+ CRC])
pub fn encode_headless(frame: &Frame, with_crc: bool) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + frame.pdu.len() + 2);
    buf.put_u8(frame.header.unit_id);
    buf.put_slice(&frame.pdu);
    if with_crc {
        let crc = crc16(&buf);
        buf.put_u16_le(crc);
    }
    buf
}

/// Parse a complete headless frame
pub fn decode_headless(data: &[u8], with_crc: bool) -> ModbusResult<Frame> {
    let min_len = if with_crc { 4 } else { 2 };
    if data.len() < min_len || data.len() > MAX_MESSAGE_LENGTH {
        return Err(ModbusError::protocol(format!(
            "Invalid headless frame length: {}",
            data.len()
        )));
    }

    let body = if with_crc {
        let (body, tail) = data.split_at(data.len() - 2);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        let calculated = crc16(body);
        if received != calculated {
            return Err(ModbusError::protocol(format!(
                "CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
            )));
        }
        body
    } else {
        data
    };

    Ok(Frame::new(
        MessageHeader::new(0, body[0]),
        Bytes::copy_from_slice(&body[1..]),
    ))
}
