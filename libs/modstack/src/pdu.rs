//! Modbus PDU codec
//!
//! A PDU is the function code plus its payload, independent of framing.
//! Requests and responses are tagged enums keyed by function code; both
//! encode into a `BytesMut` and decode from a byte slice. All multi-byte
//! fields are big-endian.
//!
//! Headless framings carry no length field, so [`FrameLen`] describes how
//! many payload bytes follow a given function code on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::constants::*;
use crate::error::{ExceptionCode, ModbusError, ModbusResult};

/// Sub-request of Read File Record (FC20)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRequest {
    pub file_number: u16,
    pub record_number: u16,
    pub record_length: u16,
}

/// Sub-request of Write File Record (FC21), echoed in its response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordData {
    pub file_number: u16,
    pub record_number: u16,
    pub values: Vec<u16>,
}

/// Request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    ReadCoils {
        reference: u16,
        count: u16,
    },
    ReadDiscreteInputs {
        reference: u16,
        count: u16,
    },
    ReadHoldingRegisters {
        reference: u16,
        count: u16,
    },
    ReadInputRegisters {
        reference: u16,
        count: u16,
    },
    WriteSingleCoil {
        reference: u16,
        value: bool,
    },
    WriteSingleRegister {
        reference: u16,
        value: u16,
    },
    WriteMultipleCoils {
        reference: u16,
        values: Vec<bool>,
    },
    WriteMultipleRegisters {
        reference: u16,
        values: Vec<u16>,
    },
    ReadFileRecord {
        records: Vec<RecordRequest>,
    },
    WriteFileRecord {
        records: Vec<RecordData>,
    },
    MaskWriteRegister {
        reference: u16,
        and_mask: u16,
        or_mask: u16,
    },
    ReadWriteMultipleRegisters {
        read_reference: u16,
        read_count: u16,
        write_reference: u16,
        values: Vec<u16>,
    },
    ReadFifoQueue {
        reference: u16,
    },
    /// Function code this stack does not implement; answered with IllegalFunction
    Unsupported {
        function_code: u8,
        data: Bytes,
    },
}

/// Response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePdu {
    /// Bits as transmitted; padding bits of the last byte included
    ReadCoils {
        values: Vec<bool>,
    },
    ReadDiscreteInputs {
        values: Vec<bool>,
    },
    ReadHoldingRegisters {
        values: Vec<u16>,
    },
    ReadInputRegisters {
        values: Vec<u16>,
    },
    WriteSingleCoil {
        reference: u16,
        value: bool,
    },
    WriteSingleRegister {
        reference: u16,
        value: u16,
    },
    WriteMultipleCoils {
        reference: u16,
        count: u16,
    },
    WriteMultipleRegisters {
        reference: u16,
        count: u16,
    },
    ReadFileRecord {
        records: Vec<Vec<u16>>,
    },
    WriteFileRecord {
        records: Vec<RecordData>,
    },
    MaskWriteRegister {
        reference: u16,
        and_mask: u16,
        or_mask: u16,
    },
    ReadWriteMultipleRegisters {
        values: Vec<u16>,
    },
    ReadFifoQueue {
        values: Vec<u16>,
    },
    Exception {
        function_code: u8,
        exception: ExceptionCode,
    },
}

/// Payload length of a PDU on a headless wire, after the function code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// Exactly this many bytes
    Fixed(usize),
    /// `offset` bytes, then a big-endian count of `width` bytes, then that many bytes
    Prefixed { offset: usize, width: usize },
}

impl FrameLen {
    /// Payload shape of a request with this function code, `None` when unknown
    pub fn request(function_code: u8) -> Option<Self> {
        match function_code {
            FC_READ_COILS
            | FC_READ_DISCRETE_INPUTS
            | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS
            | FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER => Some(FrameLen::Fixed(4)),
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => Some(FrameLen::Prefixed {
                offset: 4,
                width: 1,
            }),
            FC_READ_FILE_RECORD | FC_WRITE_FILE_RECORD => Some(FrameLen::Prefixed {
                offset: 0,
                width: 1,
            }),
            FC_MASK_WRITE_REGISTER => Some(FrameLen::Fixed(6)),
            FC_READ_WRITE_MULTIPLE_REGISTERS => Some(FrameLen::Prefixed {
                offset: 8,
                width: 1,
            }),
            FC_READ_FIFO_QUEUE => Some(FrameLen::Fixed(2)),
            _ => None,
        }
    }

    /// Payload shape of a response with this function code, `None` when unknown
    pub fn response(function_code: u8) -> Option<Self> {
        if function_code & EXCEPTION_OFFSET != 0 {
            return Some(FrameLen::Fixed(1));
        }
        match function_code {
            FC_READ_COILS
            | FC_READ_DISCRETE_INPUTS
            | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS
            | FC_READ_FILE_RECORD
            | FC_WRITE_FILE_RECORD
            | FC_READ_WRITE_MULTIPLE_REGISTERS => Some(FrameLen::Prefixed {
                offset: 0,
                width: 1,
            }),
            FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS => Some(FrameLen::Fixed(4)),
            FC_MASK_WRITE_REGISTER => Some(FrameLen::Fixed(6)),
            FC_READ_FIFO_QUEUE => Some(FrameLen::Prefixed {
                offset: 0,
                width: 2,
            }),
            _ => None,
        }
    }
}

/// Pack bits LSB-first into bytes
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits LSB-first from bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(bytes.len() * 8))
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Bounds-checked big-endian cursor over a PDU payload
struct PduReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PduReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> ModbusResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ModbusError::protocol(format!(
                "PDU truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ModbusResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> ModbusResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn registers(&mut self, count: usize) -> ModbusResult<Vec<u16>> {
        (0..count).map(|_| self.u16()).collect()
    }

    fn finish(&self, function_code: u8) -> ModbusResult<()> {
        if self.remaining() != 0 {
            return Err(ModbusError::protocol(format!(
                "{} trailing bytes after FC{:02X} payload",
                self.remaining(),
                function_code
            )));
        }
        Ok(())
    }
}

fn check_quantity(what: &str, count: usize, max: usize) -> ModbusResult<()> {
    if count == 0 || count > max {
        return Err(ModbusError::invalid_argument(format!(
            "{} quantity {} outside 1..={}",
            what, count, max
        )));
    }
    Ok(())
}

fn check_byte_count(declared: usize, expected: usize) -> ModbusResult<()> {
    if declared != expected {
        return Err(ModbusError::invalid_argument(format!(
            "byte count {} does not match quantity ({} expected)",
            declared, expected
        )));
    }
    Ok(())
}

fn coil_value(raw: u16) -> ModbusResult<bool> {
    match raw {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        other => Err(ModbusError::invalid_argument(format!(
            "coil value 0x{:04X} is neither 0xFF00 nor 0x0000",
            other
        ))),
    }
}

fn check_reference_type(reference_type: u8) -> ModbusResult<()> {
    if reference_type != FILE_REFERENCE_TYPE {
        return Err(ModbusError::invalid_argument(format!(
            "file reference type {} (expected {})",
            reference_type, FILE_REFERENCE_TYPE
        )));
    }
    Ok(())
}

impl RequestPdu {
    pub fn function_code(&self) -> u8 {
        match self {
            RequestPdu::ReadCoils { .. } => FC_READ_COILS,
            RequestPdu::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            RequestPdu::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            RequestPdu::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            RequestPdu::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            RequestPdu::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            RequestPdu::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            RequestPdu::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
            RequestPdu::ReadFileRecord { .. } => FC_READ_FILE_RECORD,
            RequestPdu::WriteFileRecord { .. } => FC_WRITE_FILE_RECORD,
            RequestPdu::MaskWriteRegister { .. } => FC_MASK_WRITE_REGISTER,
            RequestPdu::ReadWriteMultipleRegisters { .. } => FC_READ_WRITE_MULTIPLE_REGISTERS,
            RequestPdu::ReadFifoQueue { .. } => FC_READ_FIFO_QUEUE,
            RequestPdu::Unsupported { function_code, .. } => *function_code,
        }
    }

    /// Check quantities against protocol limits before a request is sent
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            RequestPdu::ReadCoils { count, .. } | RequestPdu::ReadDiscreteInputs { count, .. } => {
                check_quantity("bit read", *count as usize, MAX_BITS)
            },
            RequestPdu::ReadHoldingRegisters { count, .. }
            | RequestPdu::ReadInputRegisters { count, .. } => {
                check_quantity("register read", *count as usize, MAX_READ_REGISTERS)
            },
            RequestPdu::WriteMultipleCoils { values, .. } => {
                check_quantity("coil write", values.len(), MAX_WRITE_COILS)
            },
            RequestPdu::WriteMultipleRegisters { values, .. } => {
                check_quantity("register write", values.len(), MAX_WRITE_REGISTERS)
            },
            RequestPdu::ReadWriteMultipleRegisters {
                read_count, values, ..
            } => {
                check_quantity("register read", *read_count as usize, MAX_READ_REGISTERS)?;
                check_quantity(
                    "register write",
                    values.len(),
                    MAX_READ_WRITE_WRITE_REGISTERS,
                )
            },
            RequestPdu::ReadFileRecord { records } => {
                // 7 bytes per sub-request behind FC + byte count; response grows by 2 + 2n each
                let request_len = 2 + records.len() * 7;
                let response_len = 2 + records
                    .iter()
                    .map(|r| 2 + 2 * r.record_length as usize)
                    .sum::<usize>();
                if records.is_empty() || request_len > MAX_PDU_SIZE || response_len > MAX_PDU_SIZE
                {
                    return Err(ModbusError::invalid_argument(format!(
                        "read file record with {} sub-requests does not fit a PDU",
                        records.len()
                    )));
                }
                Ok(())
            },
            RequestPdu::WriteFileRecord { records } => {
                let len = 2 + records
                    .iter()
                    .map(|r| 7 + 2 * r.values.len())
                    .sum::<usize>();
                if records.is_empty() || len > MAX_PDU_SIZE {
                    return Err(ModbusError::invalid_argument(format!(
                        "write file record of {} bytes does not fit a PDU",
                        len
                    )));
                }
                Ok(())
            },
            RequestPdu::WriteSingleCoil { .. }
            | RequestPdu::WriteSingleRegister { .. }
            | RequestPdu::MaskWriteRegister { .. }
            | RequestPdu::ReadFifoQueue { .. }
            | RequestPdu::Unsupported { .. } => Ok(()),
        }
    }

    /// Append function code and payload to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            RequestPdu::ReadCoils { reference, count }
            | RequestPdu::ReadDiscreteInputs { reference, count }
            | RequestPdu::ReadHoldingRegisters { reference, count }
            | RequestPdu::ReadInputRegisters { reference, count } => {
                buf.put_u16(*reference);
                buf.put_u16(*count);
            },
            RequestPdu::WriteSingleCoil { reference, value } => {
                buf.put_u16(*reference);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            },
            RequestPdu::WriteSingleRegister { reference, value } => {
                buf.put_u16(*reference);
                buf.put_u16(*value);
            },
            RequestPdu::WriteMultipleCoils { reference, values } => {
                let packed = pack_bits(values);
                buf.put_u16(*reference);
                buf.put_u16(values.len() as u16);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            },
            RequestPdu::WriteMultipleRegisters { reference, values } => {
                buf.put_u16(*reference);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                values.iter().for_each(|v| buf.put_u16(*v));
            },
            RequestPdu::ReadFileRecord { records } => {
                buf.put_u8((records.len() * 7) as u8);
                for record in records {
                    buf.put_u8(FILE_REFERENCE_TYPE);
                    buf.put_u16(record.file_number);
                    buf.put_u16(record.record_number);
                    buf.put_u16(record.record_length);
                }
            },
            RequestPdu::WriteFileRecord { records } => {
                encode_record_data(records, buf);
            },
            RequestPdu::MaskWriteRegister {
                reference,
                and_mask,
                or_mask,
            } => {
                buf.put_u16(*reference);
                buf.put_u16(*and_mask);
                buf.put_u16(*or_mask);
            },
            RequestPdu::ReadWriteMultipleRegisters {
                read_reference,
                read_count,
                write_reference,
                values,
            } => {
                buf.put_u16(*read_reference);
                buf.put_u16(*read_count);
                buf.put_u16(*write_reference);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                values.iter().for_each(|v| buf.put_u16(*v));
            },
            RequestPdu::ReadFifoQueue { reference } => {
                buf.put_u16(*reference);
            },
            RequestPdu::Unsupported { data, .. } => {
                buf.put_slice(data);
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PDU_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a request PDU (function code first)
    ///
    /// Unknown function codes decode as [`RequestPdu::Unsupported`]. A
    /// truncated payload is a `Protocol` error; a well-formed payload with
    /// out-of-range quantities is an `InvalidArgument` error.
    pub fn decode(pdu: &[u8]) -> ModbusResult<Self> {
        let (&function_code, payload) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::protocol("empty request PDU"))?;
        let mut r = PduReader::new(payload);

        let request = match function_code {
            FC_READ_COILS => RequestPdu::ReadCoils {
                reference: r.u16()?,
                count: r.u16()?,
            },
            FC_READ_DISCRETE_INPUTS => RequestPdu::ReadDiscreteInputs {
                reference: r.u16()?,
                count: r.u16()?,
            },
            FC_READ_HOLDING_REGISTERS => RequestPdu::ReadHoldingRegisters {
                reference: r.u16()?,
                count: r.u16()?,
            },
            FC_READ_INPUT_REGISTERS => RequestPdu::ReadInputRegisters {
                reference: r.u16()?,
                count: r.u16()?,
            },
            FC_WRITE_SINGLE_COIL => RequestPdu::WriteSingleCoil {
                reference: r.u16()?,
                value: coil_value(r.u16()?)?,
            },
            FC_WRITE_SINGLE_REGISTER => RequestPdu::WriteSingleRegister {
                reference: r.u16()?,
                value: r.u16()?,
            },
            FC_WRITE_MULTIPLE_COILS => {
                let reference = r.u16()?;
                let count = r.u16()? as usize;
                let byte_count = r.u8()? as usize;
                check_quantity("coil write", count, MAX_WRITE_COILS)?;
                check_byte_count(byte_count, count.div_ceil(8))?;
                RequestPdu::WriteMultipleCoils {
                    reference,
                    values: unpack_bits(r.bytes(byte_count)?, count),
                }
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let reference = r.u16()?;
                let count = r.u16()? as usize;
                let byte_count = r.u8()? as usize;
                check_quantity("register write", count, MAX_WRITE_REGISTERS)?;
                check_byte_count(byte_count, count * 2)?;
                RequestPdu::WriteMultipleRegisters {
                    reference,
                    values: r.registers(count)?,
                }
            },
            FC_READ_FILE_RECORD => {
                let byte_count = r.u8()? as usize;
                if byte_count == 0 || byte_count % 7 != 0 {
                    return Err(ModbusError::invalid_argument(format!(
                        "read file record byte count {} is not a multiple of 7",
                        byte_count
                    )));
                }
                let mut records = Vec::with_capacity(byte_count / 7);
                for _ in 0..byte_count / 7 {
                    check_reference_type(r.u8()?)?;
                    records.push(RecordRequest {
                        file_number: r.u16()?,
                        record_number: r.u16()?,
                        record_length: r.u16()?,
                    });
                }
                RequestPdu::ReadFileRecord { records }
            },
            FC_WRITE_FILE_RECORD => RequestPdu::WriteFileRecord {
                records: decode_record_data(&mut r)?,
            },
            FC_MASK_WRITE_REGISTER => RequestPdu::MaskWriteRegister {
                reference: r.u16()?,
                and_mask: r.u16()?,
                or_mask: r.u16()?,
            },
            FC_READ_WRITE_MULTIPLE_REGISTERS => {
                let read_reference = r.u16()?;
                let read_count = r.u16()?;
                let write_reference = r.u16()?;
                let write_count = r.u16()? as usize;
                let byte_count = r.u8()? as usize;
                check_quantity(
                    "register write",
                    write_count,
                    MAX_READ_WRITE_WRITE_REGISTERS,
                )?;
                check_byte_count(byte_count, write_count * 2)?;
                RequestPdu::ReadWriteMultipleRegisters {
                    read_reference,
                    read_count,
                    write_reference,
                    values: r.registers(write_count)?,
                }
            },
            FC_READ_FIFO_QUEUE => RequestPdu::ReadFifoQueue {
                reference: r.u16()?,
            },
            other => {
                debug!(
                    "Unsupported request FC={:02X} ({})",
                    other,
                    function_code_description(other)
                );
                return Ok(RequestPdu::Unsupported {
                    function_code: other,
                    data: Bytes::copy_from_slice(payload),
                });
            },
        };
        r.finish(function_code)?;
        request.validate()?;
        Ok(request)
    }
}

fn encode_record_data(records: &[RecordData], buf: &mut BytesMut) {
    let len: usize = records.iter().map(|r| 7 + 2 * r.values.len()).sum();
    buf.put_u8(len as u8);
    for record in records {
        buf.put_u8(FILE_REFERENCE_TYPE);
        buf.put_u16(record.file_number);
        buf.put_u16(record.record_number);
        buf.put_u16(record.values.len() as u16);
        record.values.iter().for_each(|v| buf.put_u16(*v));
    }
}

fn decode_record_data(r: &mut PduReader<'_>) -> ModbusResult<Vec<RecordData>> {
    let byte_count = r.u8()? as usize;
    let mut body = PduReader::new(r.bytes(byte_count)?);
    let mut records = Vec::new();
    while body.remaining() > 0 {
        check_reference_type(body.u8()?)?;
        let file_number = body.u16()?;
        let record_number = body.u16()?;
        let length = body.u16()? as usize;
        records.push(RecordData {
            file_number,
            record_number,
            values: body.registers(length)?,
        });
    }
    Ok(records)
}

impl ResponsePdu {
    pub fn function_code(&self) -> u8 {
        match self {
            ResponsePdu::ReadCoils { .. } => FC_READ_COILS,
            ResponsePdu::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            ResponsePdu::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            ResponsePdu::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            ResponsePdu::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            ResponsePdu::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ResponsePdu::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            ResponsePdu::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
            ResponsePdu::ReadFileRecord { .. } => FC_READ_FILE_RECORD,
            ResponsePdu::WriteFileRecord { .. } => FC_WRITE_FILE_RECORD,
            ResponsePdu::MaskWriteRegister { .. } => FC_MASK_WRITE_REGISTER,
            ResponsePdu::ReadWriteMultipleRegisters { .. } => FC_READ_WRITE_MULTIPLE_REGISTERS,
            ResponsePdu::ReadFifoQueue { .. } => FC_READ_FIFO_QUEUE,
            ResponsePdu::Exception { function_code, .. } => function_code | EXCEPTION_OFFSET,
        }
    }

    /// Exception response for a request with `function_code`
    pub fn exception(function_code: u8, exception: ExceptionCode) -> Self {
        ResponsePdu::Exception {
            function_code: function_code & !EXCEPTION_OFFSET,
            exception,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, ResponsePdu::Exception { .. })
    }

    /// Append function code and payload to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            ResponsePdu::ReadCoils { values } | ResponsePdu::ReadDiscreteInputs { values } => {
                let packed = pack_bits(values);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            },
            ResponsePdu::ReadHoldingRegisters { values }
            | ResponsePdu::ReadInputRegisters { values }
            | ResponsePdu::ReadWriteMultipleRegisters { values } => {
                buf.put_u8((values.len() * 2) as u8);
                values.iter().for_each(|v| buf.put_u16(*v));
            },
            ResponsePdu::WriteSingleCoil { reference, value } => {
                buf.put_u16(*reference);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            },
            ResponsePdu::WriteSingleRegister {
                reference,
                value: count,
            }
            | ResponsePdu::WriteMultipleCoils { reference, count }
            | ResponsePdu::WriteMultipleRegisters { reference, count } => {
                buf.put_u16(*reference);
                buf.put_u16(*count);
            },
            ResponsePdu::ReadFileRecord { records } => {
                let len: usize = records.iter().map(|r| 2 + 2 * r.len()).sum();
                buf.put_u8(len as u8);
                for record in records {
                    buf.put_u8((1 + 2 * record.len()) as u8);
                    buf.put_u8(FILE_REFERENCE_TYPE);
                    record.iter().for_each(|v| buf.put_u16(*v));
                }
            },
            ResponsePdu::WriteFileRecord { records } => {
                encode_record_data(records, buf);
            },
            ResponsePdu::MaskWriteRegister {
                reference,
                and_mask,
                or_mask,
            } => {
                buf.put_u16(*reference);
                buf.put_u16(*and_mask);
                buf.put_u16(*or_mask);
            },
            ResponsePdu::ReadFifoQueue { values } => {
                buf.put_u16((2 + 2 * values.len()) as u16);
                buf.put_u16(values.len() as u16);
                values.iter().for_each(|v| buf.put_u16(*v));
            },
            ResponsePdu::Exception { exception, .. } => {
                buf.put_u8(u8::from(*exception));
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PDU_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a response PDU (function code first)
    ///
    /// Function codes with the exception bit set decode as
    /// [`ResponsePdu::Exception`]; any other unknown code is a `Protocol` error.
    pub fn decode(pdu: &[u8]) -> ModbusResult<Self> {
        let (&function_code, payload) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::protocol("empty response PDU"))?;
        let mut r = PduReader::new(payload);

        let response = if function_code & EXCEPTION_OFFSET != 0 {
            let exception = ExceptionCode::from(r.u8()?);
            debug!(
                "Exception response FC={:02X} ({}): {}",
                function_code,
                function_code_description(function_code),
                exception
            );
            ResponsePdu::Exception {
                function_code: function_code & !EXCEPTION_OFFSET,
                exception,
            }
        } else {
            match function_code {
                FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                    let byte_count = r.u8()? as usize;
                    let bytes = r.bytes(byte_count)?;
                    let values = unpack_bits(bytes, byte_count * 8);
                    if function_code == FC_READ_COILS {
                        ResponsePdu::ReadCoils { values }
                    } else {
                        ResponsePdu::ReadDiscreteInputs { values }
                    }
                },
                FC_READ_HOLDING_REGISTERS
                | FC_READ_INPUT_REGISTERS
                | FC_READ_WRITE_MULTIPLE_REGISTERS => {
                    let byte_count = r.u8()? as usize;
                    if byte_count % 2 != 0 {
                        return Err(ModbusError::protocol(format!(
                            "odd register byte count {}",
                            byte_count
                        )));
                    }
                    let values = r.registers(byte_count / 2)?;
                    match function_code {
                        FC_READ_HOLDING_REGISTERS => ResponsePdu::ReadHoldingRegisters { values },
                        FC_READ_INPUT_REGISTERS => ResponsePdu::ReadInputRegisters { values },
                        _ => ResponsePdu::ReadWriteMultipleRegisters { values },
                    }
                },
                FC_WRITE_SINGLE_COIL => ResponsePdu::WriteSingleCoil {
                    reference: r.u16()?,
                    value: coil_value(r.u16()?)?,
                },
                FC_WRITE_SINGLE_REGISTER => ResponsePdu::WriteSingleRegister {
                    reference: r.u16()?,
                    value: r.u16()?,
                },
                FC_WRITE_MULTIPLE_COILS => ResponsePdu::WriteMultipleCoils {
                    reference: r.u16()?,
                    count: r.u16()?,
                },
                FC_WRITE_MULTIPLE_REGISTERS => ResponsePdu::WriteMultipleRegisters {
                    reference: r.u16()?,
                    count: r.u16()?,
                },
                FC_READ_FILE_RECORD => {
                    let byte_count = r.u8()? as usize;
                    let mut body = PduReader::new(r.bytes(byte_count)?);
                    let mut records = Vec::new();
                    while body.remaining() > 0 {
                        let length = body.u8()? as usize;
                        if length == 0 || length % 2 == 0 {
                            return Err(ModbusError::protocol(format!(
                                "invalid file sub-response length {}",
                                length
                            )));
                        }
                        check_reference_type(body.u8()?)?;
                        records.push(body.registers((length - 1) / 2)?);
                    }
                    ResponsePdu::ReadFileRecord { records }
                },
                FC_WRITE_FILE_RECORD => ResponsePdu::WriteFileRecord {
                    records: decode_record_data(&mut r)?,
                },
                FC_MASK_WRITE_REGISTER => ResponsePdu::MaskWriteRegister {
                    reference: r.u16()?,
                    and_mask: r.u16()?,
                    or_mask: r.u16()?,
                },
                FC_READ_FIFO_QUEUE => {
                    let byte_count = r.u16()? as usize;
                    let count = r.u16()? as usize;
                    if count > MAX_FIFO_SIZE || byte_count != 2 + 2 * count {
                        return Err(ModbusError::protocol(format!(
                            "FIFO response with byte count {} and {} entries",
                            byte_count, count
                        )));
                    }
                    ResponsePdu::ReadFifoQueue {
                        values: r.registers(count)?,
                    }
                },
                other => {
                    return Err(ModbusError::protocol(format!(
                        "unknown response function code 0x{:02X}",
                        other
                    )));
                },
            }
        };
        r.finish(function_code)?;
        Ok(response)
    }
}
