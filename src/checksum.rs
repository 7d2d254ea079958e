//! Frame checksums: CRC-16/Modbus for RTU and LRC-8 for ASCII.
//!
//! Both serve double duty on serial lines: integrity check and implicit
//! framing aid. Decoders always recompute them, even over channels that are
//! known-reliable, so the codecs match real devices.

use crc::{Crc, CRC_16_MODBUS};

/// CRC-16/Modbus: polynomial 0xA001 (reflected), init 0xFFFF, no final XOR.
/// The `crc` crate implementation is table-driven.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute CRC-16/Modbus over `data`.
///
/// Appended to RTU frames little-endian: low byte first, then high byte.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Compute LRC-8 over `data`: two's complement of the byte sum modulo 256.
///
/// The LRC covers the binary bytes of an ASCII frame (slave id, function
/// code, data), not their hex-character encoding.
pub fn lrc8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}
