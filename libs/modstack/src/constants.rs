//! Modbus protocol constants and stack defaults
//!
//! Frame limits follow Modbus Application Protocol v1.1b3; the
//! defaults are the values used when a master or slave is created without
//! explicit configuration.

use std::time::Duration;

// ============================================================================
// Stack defaults
// ============================================================================

/// Default Modbus TCP/UDP port
pub const DEFAULT_PORT: u16 = 502;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default response timeout as Duration
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Default number of attempts a transaction makes before giving up
pub const DEFAULT_RETRIES: u32 = 5;

/// Base of the randomized retry backoff in milliseconds
pub const DEFAULT_RETRY_SLEEP_MS: u64 = 500;

/// Largest transaction identifier before the counter wraps to 0
pub const MAX_TRANSACTION_ID: u16 = 32767;

/// Maximum serial ADU length (address + PDU + CRC)
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// Maximum number of bits in one read/write request
pub const MAX_BITS: usize = 2000;

/// Default number of concurrently served TCP connections per slave
pub const DEFAULT_POOL_SIZE: usize = 5;

/// How long a stopping listener waits for its workers before aborting them
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP listen backlog
pub const DEFAULT_BACKLOG: u32 = 50;

/// Capacity of the slave-side UDP inbound/outbound queues
pub const UDP_QUEUE_CAPACITY: usize = 128;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length: Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size: RS485 ADU (256) - address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest datagram/frame the stack ever has to buffer
pub const MAX_FRAME_SIZE: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

/// Function code bit marking an exception response
pub const EXCEPTION_OFFSET: u8 = 0x80;

// ============================================================================
// Quantity limits
// ============================================================================

/// Maximum registers read by FC03/FC04/FC23
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum registers written by FC16
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum registers written by FC23
pub const MAX_READ_WRITE_WRITE_REGISTERS: usize = 121;

/// Maximum coils written by FC15
pub const MAX_WRITE_COILS: usize = 1968;

/// Capacity of a Modbus FIFO queue
pub const MAX_FIFO_SIZE: usize = 31;

/// Reference type byte of every file sub-request
pub const FILE_REFERENCE_TYPE: u8 = 6;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Read File Record (FC20)
pub const FC_READ_FILE_RECORD: u8 = 0x14;

/// Write File Record (FC21)
pub const FC_WRITE_FILE_RECORD: u8 = 0x15;

/// Mask Write Register (FC22)
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Read/Write Multiple Registers (FC23)
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

/// Read FIFO Queue (FC24)
pub const FC_READ_FIFO_QUEUE: u8 = 0x18;

/// Get human-readable function code description
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & !EXCEPTION_OFFSET {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_COIL => "Write Single Coil",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        FC_READ_FILE_RECORD => "Read File Record",
        FC_WRITE_FILE_RECORD => "Write File Record",
        FC_MASK_WRITE_REGISTER => "Mask Write Register",
        FC_READ_WRITE_MULTIPLE_REGISTERS => "Read/Write Multiple Registers",
        FC_READ_FIFO_QUEUE => "Read FIFO Queue",
        _ => "Unknown Function",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_FRAME_SIZE, 260);
        assert_eq!(MAX_MESSAGE_LENGTH, 1 + MAX_PDU_SIZE + 2);
    }

    #[test]
    fn test_register_limits_fit_in_pdu() {
        assert!(1 + 1 + MAX_READ_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 2 + 2 + 1 + MAX_READ_WRITE_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8) <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_function_code_description_masks_exception_bit() {
        assert_eq!(function_code_description(0x03), "Read Holding Registers");
        assert_eq!(function_code_description(0x83), "Read Holding Registers");
        assert_eq!(function_code_description(0x42), "Unknown Function");
    }
}
