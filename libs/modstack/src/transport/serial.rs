//! Serial RTU transport on top of tokio-serial

use std::time::Duration;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use super::stream::{SerialTiming, StreamTransport};
use crate::config::{Parity, SerialParameters, StopBits};
use crate::error::{ModbusError, ModbusResult};

pub type SerialTransport = StreamTransport<SerialStream>;

fn data_bits(bits: u8) -> ModbusResult<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ModbusError::config(format!("unsupported data bits: {}", other))),
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn stop_bits(stop_bits: StopBits) -> tokio_serial::StopBits {
    match stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

/// Open a serial port with RTU framing and line timing
///
/// A missing or busy device is a configuration error.
pub fn open_serial(parameters: &SerialParameters, timeout: Duration) -> ModbusResult<SerialTransport> {
    parameters.validate()?;

    let stream = tokio_serial::new(&parameters.port_name, parameters.baud_rate)
        .data_bits(data_bits(parameters.data_bits)?)
        .parity(parity(parameters.parity))
        .stop_bits(stop_bits(parameters.stop_bits))
        .timeout(timeout)
        .open_native_async()
        .map_err(|e| {
            ModbusError::config(format!(
                "cannot open serial port {}: {}",
                parameters.port_name, e
            ))
        })?;

    let timing = SerialTiming::from_baud(
        parameters.baud_rate,
        parameters.transmit_delay(),
        parameters.echo,
    );
    info!(
        "Opened serial port {} at {} baud (message gap {:?})",
        parameters.port_name, parameters.baud_rate, timing.message_gap
    );

    let mut transport =
        StreamTransport::rtu(stream, parameters.port_name.clone()).with_timing(timing);
    super::ModbusTransport::set_timeout(&mut transport, timeout);
    Ok(transport)
}
