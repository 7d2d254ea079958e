//! Modbus protocol constants based on official specification
//!
//! These constants are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const TCP_HEADER_SIZE: usize = 7;

/// Maximum Modbus TCP ADU size (MBAP header + PDU)
pub const TCP_MAX_LENGTH: usize = 260;

/// Protocol identifier in the MBAP header, always zero
pub const TCP_PROTOCOL_IDENTIFIER: u16 = 0x0000;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// This is the fundamental limit inherited from RS485 implementation:
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Minimum RTU ADU size: slave id + function code + CRC(2)
pub const RTU_MIN_SIZE: usize = 4;

/// Maximum RTU ADU size
pub const RTU_MAX_SIZE: usize = 256;

/// RTU exception response size: slave id + function code + exception + CRC(2)
pub const RTU_EXCEPTION_SIZE: usize = 5;

/// Minimum binary content of an ASCII frame: slave id + function code + LRC
pub const ASCII_MIN_SIZE: usize = 3;

/// Maximum ASCII frame size in characters
pub const ASCII_MAX_SIZE: usize = 513;

/// ASCII frame start character
pub const ASCII_START: u8 = b':';

/// ASCII frame terminator
pub const ASCII_END: &[u8] = b"\r\n";

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Register Data: N × 2 bytes
/// - Total: 1 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Registers: 2 bytes
/// - Byte Count: 1 byte
/// - Register Values: N × 2 bytes
/// - Total: 1 + 2 + 2 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 6) / 2 = 123.5 → 123 registers
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum write quantity for FC23 (Read/Write Multiple Registers)
///
/// The request additionally carries the read range header (4 bytes), which
/// lowers the write limit from 123 to 121 registers.
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;

/// Maximum FIFO count in an FC24 response
pub const MAX_FIFO_COUNT: u16 = 31;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
pub const MAX_WRITE_COILS: u16 = 1968;

/// ON state for FC05 (Write Single Coil)
pub const COIL_ON: u16 = 0xFF00;

/// OFF state for FC05 (Write Single Coil)
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Datastore
// ============================================================================

/// Size of each register bank address space (full u16 range)
pub const MAX_ADDRESS_SPACE: usize = 65_536;

// ============================================================================
// Timing Defaults
// ============================================================================

/// Default connect/read/write timeout for TCP transports
pub const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout before a TCP connection is closed
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default read/write timeout for serial transports
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle timeout before a serial port is closed
pub const SERIAL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(TCP_HEADER_SIZE, 7);
        assert_eq!(MAX_PDU_SIZE, 253);
        // RTU ADU = slave id + PDU + CRC
        assert_eq!(RTU_MAX_SIZE, 1 + MAX_PDU_SIZE + 2);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);

        let rw_pdu_size = 1 + 4 + 4 + 1 + (MAX_READ_WRITE_REGISTERS as usize * 2);
        assert!(rw_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + (MAX_READ_COILS as usize).div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_COILS as usize).div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }
}
