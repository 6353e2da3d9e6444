//! Modbus stack error types
//!
//! A single error type is surfaced to callers. The variants fall into the
//! families the transaction engine cares about: transport failures that are
//! worth retrying, definitive answers from the remote unit, and local usage
//! or configuration mistakes that fail fast.

use std::fmt;
use thiserror::Error;

/// Result type for modstack operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Modbus exception codes carried by exception responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetNoResponse,
    /// Code not defined by the protocol
    Unknown(u8),
}

impl ExceptionCode {
    /// Human-readable description of the exception
    pub fn description(&self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal function",
            ExceptionCode::IllegalDataAddress => "Illegal data address",
            ExceptionCode::IllegalDataValue => "Illegal data value",
            ExceptionCode::SlaveDeviceFailure => "Slave device failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveDeviceBusy => "Slave device busy",
            ExceptionCode::NegativeAcknowledge => "Negative acknowledge",
            ExceptionCode::MemoryParityError => "Memory parity error",
            ExceptionCode::GatewayPathUnavailable => "Gateway path unavailable",
            ExceptionCode::GatewayTargetNoResponse => "Gateway target device failed to respond",
            ExceptionCode::Unknown(_) => "Unknown exception",
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x07 => ExceptionCode::NegativeAcknowledge,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetNoResponse,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        match code {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::NegativeAcknowledge => 0x07,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetNoResponse => 0x0B,
            ExceptionCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), u8::from(*self))
    }
}

/// Modbus stack errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Connect/read/write failure on the underlying medium
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Peer closed the stream before a complete frame arrived
    #[error("End of stream: {message}")]
    EndOfStream { message: String },

    /// No (complete) frame within the configured timeout
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// Malformed frame, bad length or checksum
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Well-formed exception response from the remote unit
    #[error("Slave exception for function 0x{function_code:02X}: {exception}")]
    SlaveException {
        function_code: u8,
        exception: ExceptionCode,
    },

    /// Reference outside the populated range of a process image
    #[error("Illegal address: {message}")]
    IllegalAddress { message: String },

    /// Malformed local input
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Missing or invalid connection parameters
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation requires an open connection
    #[error("Not connected")]
    NotConnected,

    /// Transaction gave up after its retry budget
    #[error("Executing transaction failed (tried {retries} times): {last_error}")]
    RetriesExhausted {
        retries: u32,
        last_error: Box<ModbusError>,
    },
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ModbusError::EndOfStream {
                message: err.to_string(),
            },
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ModbusError::Timeout {
                    message: err.to_string(),
                }
            },
            _ => ModbusError::Io {
                message: err.to_string(),
            },
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::timeout("operation timed out")
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn io(msg: impl Into<String>) -> Self {
        ModbusError::Io {
            message: msg.into(),
        }
    }

    pub fn end_of_stream(msg: impl Into<String>) -> Self {
        ModbusError::EndOfStream {
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout {
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol {
            message: msg.into(),
        }
    }

    pub fn illegal_address(msg: impl Into<String>) -> Self {
        ModbusError::IllegalAddress {
            message: msg.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config {
            message: msg.into(),
        }
    }

    pub fn slave_exception(function_code: u8, exception: ExceptionCode) -> Self {
        ModbusError::SlaveException {
            function_code: function_code & 0x7F,
            exception,
        }
    }

    /// Whether this error belongs to the I/O family (connect, read, write,
    /// timeout, end of stream, exhausted retries)
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            ModbusError::Io { .. }
                | ModbusError::EndOfStream { .. }
                | ModbusError::Timeout { .. }
                | ModbusError::NotConnected
                | ModbusError::RetriesExhausted { .. }
        )
    }

    /// Whether the transaction engine may retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ModbusError::RetriesExhausted { .. } => false,
            ModbusError::Protocol { .. } => true,
            other => other.is_io(),
        }
    }

    /// Whether the connection should be re-established before the next attempt
    ///
    /// A late reply to a timed-out request would desynchronise a stream, so
    /// timeouts reconnect too.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ModbusError::Io { .. }
                | ModbusError::EndOfStream { .. }
                | ModbusError::Timeout { .. }
                | ModbusError::NotConnected
        )
    }

    /// Exception code for errors that are reported to a master as an exception response
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::SlaveException { exception, .. } => Some(*exception),
            ModbusError::IllegalAddress { .. } => Some(ExceptionCode::IllegalDataAddress),
            ModbusError::InvalidArgument { .. } => Some(ExceptionCode::IllegalDataValue),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_roundtrip_known_codes() {
        for code in [1u8, 2, 3, 4, 5, 6, 7, 8, 10, 11] {
            let exception = ExceptionCode::from(code);
            assert!(!matches!(exception, ExceptionCode::Unknown(_)));
            assert_eq!(u8::from(exception), code);
        }
    }

    #[test]
    fn test_exception_code_unknown_preserved() {
        let exception = ExceptionCode::from(0x42);
        assert_eq!(exception, ExceptionCode::Unknown(0x42));
        assert_eq!(u8::from(exception), 0x42);
    }

    #[test]
    fn test_slave_exception_message_is_descriptive() {
        let err = ModbusError::slave_exception(0x83, ExceptionCode::IllegalDataAddress);
        let text = err.to_string();
        assert!(text.contains("0x03"));
        assert!(text.contains("Illegal data address"));
        assert!(!err.is_io());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        assert!(matches!(ModbusError::from(eof), ModbusError::EndOfStream { .. }));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(ModbusError::from(timed_out), ModbusError::Timeout { .. }));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        let err = ModbusError::from(refused);
        assert!(matches!(err, ModbusError::Io { .. }));
        assert!(err.needs_reconnect());
    }

    #[test]
    fn test_retries_exhausted_reports_count() {
        let err = ModbusError::RetriesExhausted {
            retries: 5,
            last_error: Box::new(ModbusError::timeout("no answer")),
        };
        assert!(err.is_io());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("tried 5 times"));
    }

    #[test]
    fn test_exception_code_mapping_for_slave_side_errors() {
        assert_eq!(
            ModbusError::illegal_address("ref 12").exception_code(),
            Some(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            ModbusError::invalid_argument("short").exception_code(),
            Some(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(ModbusError::timeout("x").exception_code(), None);
    }
}
