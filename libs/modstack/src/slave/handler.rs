//! Request dispatch against process images

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::image::{ProcessImage, RegisterCell};
use crate::message::{Frame, ModbusRequest, ModbusResponse};
use crate::pdu::{RequestPdu, ResponsePdu};

/// Unit ID that answers for every unit when it is the only image registered
pub const WILDCARD_UNIT: u8 = 0;

/// Process images of one slave, keyed by unit ID
#[derive(Debug, Default)]
pub struct ProcessImageTable {
    images: RwLock<HashMap<u8, Arc<ProcessImage>>>,
}

impl ProcessImageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `image` under its unit ID, returning the image it replaces
    pub fn add(&self, image: Arc<ProcessImage>) -> Option<Arc<ProcessImage>> {
        self.images.write().insert(image.unit_id(), image)
    }

    pub fn remove(&self, unit_id: u8) -> Option<Arc<ProcessImage>> {
        self.images.write().remove(&unit_id)
    }

    /// Image registered under exactly `unit_id`
    pub fn get(&self, unit_id: u8) -> Option<Arc<ProcessImage>> {
        self.images.read().get(&unit_id).cloned()
    }

    /// Image answering for `unit_id`, falling back to a lone unit 0 image
    /// when `wildcard` is set
    pub fn resolve(&self, unit_id: u8, wildcard: bool) -> Option<Arc<ProcessImage>> {
        let images = self.images.read();
        if let Some(image) = images.get(&unit_id) {
            return Some(image.clone());
        }
        if wildcard && images.len() == 1 {
            return images.get(&WILDCARD_UNIT).cloned();
        }
        None
    }

    pub fn units(&self) -> Vec<u8> {
        let mut units: Vec<u8> = self.images.read().keys().copied().collect();
        units.sort_unstable();
        units
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}

/// Counters kept by a running listener
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    requests: AtomicU64,
    exceptions: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub requests: u64,
    pub exceptions: u64,
}

impl ListenerStats {
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_response(&self, exception: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if exception {
            self.exceptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
        }
    }
}

/// Turns request frames into response frames for one listener
#[derive(Debug, Clone)]
pub(crate) struct RequestHandler {
    images: Arc<ProcessImageTable>,
    stats: Arc<ListenerStats>,
    /// Set for TCP/UDP, where unknown units get an exception and a lone
    /// unit 0 image answers for all; a serial line ignores unknown units
    shared_medium: bool,
}

impl RequestHandler {
    pub(crate) fn new(
        images: Arc<ProcessImageTable>,
        stats: Arc<ListenerStats>,
        shared_medium: bool,
    ) -> Self {
        Self {
            images,
            stats,
            shared_medium,
        }
    }

    pub(crate) fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Response frame for `frame`, or `None` when the request is not ours to answer
    pub(crate) fn handle(&self, frame: &Frame) -> Option<Frame> {
        let unit_id = frame.header.unit_id;
        let function_code = frame.function_code();

        let pdu = match self.images.resolve(unit_id, self.shared_medium) {
            None if !self.shared_medium => {
                debug!("Ignoring request for unit {} on serial line", unit_id);
                return None;
            },
            None => {
                debug!("No process image for unit {}", unit_id);
                ResponsePdu::exception(function_code, ExceptionCode::IllegalDataAddress)
            },
            Some(image) => match ModbusRequest::from_frame(frame) {
                Ok(request) => respond(&image, &request.pdu),
                Err(e) => {
                    debug!("Malformed request 0x{:02X} for unit {}: {}", function_code, unit_id, e);
                    ResponsePdu::exception(function_code, ExceptionCode::IllegalDataValue)
                },
            },
        };

        self.stats.record_response(pdu.is_exception());
        Some(ModbusResponse::for_request(&frame.header, pdu).to_frame())
    }
}

/// Apply `request` to `image`, mapping failures to an exception response
pub fn respond(image: &ProcessImage, request: &RequestPdu) -> ResponsePdu {
    let function_code = request.function_code();
    match apply(image, request) {
        Ok(pdu) => pdu,
        Err(e) => {
            let exception = match e.exception_code() {
                Some(code) => code,
                None => {
                    warn!("Request 0x{:02X} failed: {}", function_code, e);
                    ExceptionCode::SlaveDeviceFailure
                },
            };
            debug!("Request 0x{:02X} answered with {}", function_code, exception);
            ResponsePdu::exception(function_code, exception)
        },
    }
}

/// Read or mutate `image` as `request` asks
///
/// Every referenced cell is resolved before the first write, so a request
/// with a bad address leaves the image untouched.
pub fn apply(image: &ProcessImage, request: &RequestPdu) -> ModbusResult<ResponsePdu> {
    match request {
        RequestPdu::ReadCoils { reference, count } => {
            let coils = image.coil_range(usize::from(*reference), usize::from(*count))?;
            Ok(ResponsePdu::ReadCoils {
                values: coils.iter().map(|coil| coil.is_set()).collect(),
            })
        },
        RequestPdu::ReadDiscreteInputs { reference, count } => {
            let inputs =
                image.discrete_input_range(usize::from(*reference), usize::from(*count))?;
            Ok(ResponsePdu::ReadDiscreteInputs {
                values: inputs.iter().map(|input| input.is_set()).collect(),
            })
        },
        RequestPdu::ReadHoldingRegisters { reference, count } => {
            let registers = image.register_range(usize::from(*reference), usize::from(*count))?;
            Ok(ResponsePdu::ReadHoldingRegisters {
                values: registers.iter().map(|reg| reg.value()).collect(),
            })
        },
        RequestPdu::ReadInputRegisters { reference, count } => {
            let registers =
                image.input_register_range(usize::from(*reference), usize::from(*count))?;
            Ok(ResponsePdu::ReadInputRegisters {
                values: registers.iter().map(|reg| reg.value()).collect(),
            })
        },
        RequestPdu::WriteSingleCoil { reference, value } => {
            image.coil(usize::from(*reference))?.set(*value);
            Ok(ResponsePdu::WriteSingleCoil {
                reference: *reference,
                value: *value,
            })
        },
        RequestPdu::WriteSingleRegister { reference, value } => {
            image.register(usize::from(*reference))?.set_value(*value);
            Ok(ResponsePdu::WriteSingleRegister {
                reference: *reference,
                value: *value,
            })
        },
        RequestPdu::WriteMultipleCoils { reference, values } => {
            let coils = image.coil_range(usize::from(*reference), values.len())?;
            for (coil, value) in coils.iter().zip(values) {
                coil.set(*value);
            }
            Ok(ResponsePdu::WriteMultipleCoils {
                reference: *reference,
                count: values.len() as u16,
            })
        },
        RequestPdu::WriteMultipleRegisters { reference, values } => {
            let registers = image.register_range(usize::from(*reference), values.len())?;
            for (register, value) in registers.iter().zip(values) {
                register.set_value(*value);
            }
            Ok(ResponsePdu::WriteMultipleRegisters {
                reference: *reference,
                count: values.len() as u16,
            })
        },
        RequestPdu::ReadFileRecord { records } => {
            let mut out = Vec::with_capacity(records.len());
            for record in records {
                let file = image.file(record.file_number)?;
                out.push(file.read(record.record_number, usize::from(record.record_length))?);
            }
            Ok(ResponsePdu::ReadFileRecord { records: out })
        },
        RequestPdu::WriteFileRecord { records } => {
            let mut targets = Vec::with_capacity(records.len());
            for record in records {
                let file = image.file(record.file_number)?;
                let size = file.record(record.record_number)?.register_count();
                if record.values.len() > size {
                    return Err(ModbusError::illegal_address(format!(
                        "file {} record {} holds {} registers, {} written",
                        record.file_number,
                        record.record_number,
                        size,
                        record.values.len()
                    )));
                }
                targets.push(file);
            }
            for (file, record) in targets.iter().zip(records) {
                file.write(record.record_number, &record.values)?;
            }
            Ok(ResponsePdu::WriteFileRecord {
                records: records.clone(),
            })
        },
        RequestPdu::MaskWriteRegister {
            reference,
            and_mask,
            or_mask,
        } => {
            let register = image.register(usize::from(*reference))?;
            register.update(|current| (current & and_mask) | (or_mask & !and_mask));
            Ok(ResponsePdu::MaskWriteRegister {
                reference: *reference,
                and_mask: *and_mask,
                or_mask: *or_mask,
            })
        },
        RequestPdu::ReadWriteMultipleRegisters {
            read_reference,
            read_count,
            write_reference,
            values,
        } => {
            let written = image.register_range(usize::from(*write_reference), values.len())?;
            let read = image.register_range(usize::from(*read_reference), usize::from(*read_count))?;
            // Write happens before the read
            for (register, value) in written.iter().zip(values) {
                register.set_value(*value);
            }
            Ok(ResponsePdu::ReadWriteMultipleRegisters {
                values: read.iter().map(|reg| reg.value()).collect(),
            })
        },
        RequestPdu::ReadFifoQueue { reference } => Ok(ResponsePdu::ReadFifoQueue {
            values: image.fifo(*reference)?.values(),
        }),
        RequestPdu::Unsupported { function_code, .. } => Err(ModbusError::slave_exception(
            *function_code,
            ExceptionCode::IllegalFunction,
        )),
    }
}
