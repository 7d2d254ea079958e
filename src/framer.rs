//! ADU framing: MBAP (TCP), RTU (CRC-16) and ASCII (LRC) codecs.
//!
//! Each framer turns a PDU into an on-the-wire frame (`encode`), cross-checks
//! a response frame against the request it answers (`verify`), and extracts
//! the PDU back out (`decode`). Transports stay byte-oriented; everything
//! protocol-shaped lives here.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::checksum::{crc16, lrc8};
use crate::constants::{
    ASCII_END, ASCII_MIN_SIZE, ASCII_START, RTU_MAX_SIZE, RTU_MIN_SIZE, TCP_HEADER_SIZE,
    TCP_PROTOCOL_IDENTIFIER,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;
use crate::protocol::{FunctionCode, SlaveId};

/// Frame codec shared by client and server paths.
pub trait Framer: Send + Sync {
    /// Wrap a PDU into a transport-specific ADU.
    fn encode(&self, pdu: &ModbusPdu) -> ModbusResult<Vec<u8>>;

    /// Cross-check a response ADU against the request ADU it answers.
    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()>;

    /// Extract the PDU from an ADU, validating checksums and length fields.
    fn decode(&self, adu: &[u8]) -> ModbusResult<ModbusPdu>;
}

// ============================================================================
// MBAP (TCP)
// ============================================================================

/// MBAP framer for Modbus TCP.
///
/// Header layout: `transaction_id(u16 BE) || protocol_id(u16 BE) ||
/// length(u16 BE) || unit_id(u8)`, with `length = 1 + 1 + len(data)`.
///
/// The transaction id is a per-framer atomic counter used only to correlate
/// a response with its request on one connection; it does not enable
/// pipelining because `Transport::send` serializes.
pub struct MbapFramer {
    unit_id: SlaveId,
    transaction_id: AtomicU32,
}

impl MbapFramer {
    pub fn new(unit_id: SlaveId) -> Self {
        Self {
            unit_id,
            transaction_id: AtomicU32::new(0),
        }
    }

    /// Next transaction id; wrap past u16 is permitted.
    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed) as u16
    }
}

impl Framer for MbapFramer {
    fn encode(&self, pdu: &ModbusPdu) -> ModbusResult<Vec<u8>> {
        let transaction_id = self.next_transaction_id();
        let length = (1 + pdu.len()) as u16;

        let mut adu = Vec::with_capacity(TCP_HEADER_SIZE + pdu.len());
        adu.extend_from_slice(&transaction_id.to_be_bytes());
        adu.extend_from_slice(&TCP_PROTOCOL_IDENTIFIER.to_be_bytes());
        adu.extend_from_slice(&length.to_be_bytes());
        adu.push(self.unit_id);
        adu.extend_from_slice(pdu.as_slice());

        debug!("MBAP encoded: tid={transaction_id}, length={length}");
        Ok(adu)
    }

    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        if response.len() < TCP_HEADER_SIZE || request.len() < TCP_HEADER_SIZE {
            return Err(ModbusError::short_frame(format!(
                "MBAP frame length {} below header size {}",
                response.len().min(request.len()),
                TCP_HEADER_SIZE
            )));
        }

        let response_tid = u16::from_be_bytes([response[0], response[1]]);
        let request_tid = u16::from_be_bytes([request[0], request[1]]);
        if response_tid != request_tid {
            return Err(ModbusError::protocol(format!(
                "response transaction id {response_tid} does not match request {request_tid}"
            )));
        }

        let response_pid = u16::from_be_bytes([response[2], response[3]]);
        let request_pid = u16::from_be_bytes([request[2], request[3]]);
        if response_pid != request_pid {
            return Err(ModbusError::protocol(format!(
                "response protocol id {response_pid} does not match request {request_pid}"
            )));
        }

        if response[6] != request[6] {
            return Err(ModbusError::protocol(format!(
                "response unit id {} does not match request {}",
                response[6], request[6]
            )));
        }

        Ok(())
    }

    fn decode(&self, adu: &[u8]) -> ModbusResult<ModbusPdu> {
        if adu.len() <= TCP_HEADER_SIZE {
            return Err(ModbusError::short_frame(format!(
                "MBAP frame length {} leaves no PDU",
                adu.len()
            )));
        }

        // The length field counts the unit id plus the PDU.
        let length = u16::from_be_bytes([adu[4], adu[5]]) as usize;
        let pdu_length = adu.len() - TCP_HEADER_SIZE;
        if pdu_length + 1 != length {
            return Err(ModbusError::protocol(format!(
                "length in response {} does not match pdu data length {pdu_length}",
                length.saturating_sub(1)
            )));
        }

        ModbusPdu::from_slice(&adu[TCP_HEADER_SIZE..])
    }
}

// ============================================================================
// RTU (serial, CRC-16)
// ============================================================================

/// RTU framer: `slave_id || function_code || data || crc_lo || crc_hi`.
pub struct RtuFramer {
    slave_id: SlaveId,
}

impl RtuFramer {
    pub fn new(slave_id: SlaveId) -> Self {
        Self { slave_id }
    }
}

impl Framer for RtuFramer {
    fn encode(&self, pdu: &ModbusPdu) -> ModbusResult<Vec<u8>> {
        let length = pdu.len() + 3;
        if length > RTU_MAX_SIZE {
            return Err(ModbusError::invalid_data(format!(
                "frame length {length} must not be bigger than {RTU_MAX_SIZE}"
            )));
        }

        let mut adu = Vec::with_capacity(length);
        adu.push(self.slave_id);
        adu.extend_from_slice(pdu.as_slice());

        let checksum = crc16(&adu);
        adu.extend_from_slice(&checksum.to_le_bytes());
        Ok(adu)
    }

    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        if response.len() < RTU_MIN_SIZE {
            return Err(ModbusError::short_frame(format!(
                "response length {} does not meet minimum {}",
                response.len(),
                RTU_MIN_SIZE
            )));
        }
        if response[0] != request[0] {
            return Err(ModbusError::protocol(format!(
                "response slave id {} does not match request {}",
                response[0], request[0]
            )));
        }
        Ok(())
    }

    fn decode(&self, adu: &[u8]) -> ModbusResult<ModbusPdu> {
        let length = adu.len();
        if length < RTU_MIN_SIZE {
            return Err(ModbusError::short_frame(format!(
                "frame length {length} does not meet minimum {RTU_MIN_SIZE}"
            )));
        }

        let expected = crc16(&adu[..length - 2]);
        let received = u16::from_le_bytes([adu[length - 2], adu[length - 1]]);
        if received != expected {
            return Err(ModbusError::protocol(format!(
                "response crc 0x{received:04X} does not match expected 0x{expected:04X}"
            )));
        }

        ModbusPdu::from_slice(&adu[1..length - 2])
    }
}

// ============================================================================
// ASCII (serial, LRC)
// ============================================================================

/// ASCII framer: `':' || hex(slave_id) || hex(fc) || hex(data) || hex(lrc) || CRLF`.
///
/// All hex pairs are uppercase; the LRC covers the binary bytes, not the hex
/// characters.
pub struct AsciiFramer {
    slave_id: SlaveId,
}

impl AsciiFramer {
    pub fn new(slave_id: SlaveId) -> Self {
        Self { slave_id }
    }
}

const HEX_TABLE: &[u8; 16] = b"0123456789ABCDEF";

/// Encode a byte as two uppercase hex characters.
fn write_hex(out: &mut Vec<u8>, value: u8) {
    out.push(HEX_TABLE[(value >> 4) as usize]);
    out.push(HEX_TABLE[(value & 0x0F) as usize]);
}

/// Decode one hex character.
fn hex_digit(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ModbusError::protocol(format!(
            "invalid hex character 0x{c:02X}"
        ))),
    }
}

/// Decode the hex pair at the start of `data`.
pub(crate) fn read_hex(data: &[u8]) -> ModbusResult<u8> {
    if data.len() < 2 {
        return Err(ModbusError::short_frame("truncated hex pair"));
    }
    Ok((hex_digit(data[0])? << 4) | hex_digit(data[1])?)
}

impl Framer for AsciiFramer {
    fn encode(&self, pdu: &ModbusPdu) -> ModbusResult<Vec<u8>> {
        let mut adu = Vec::with_capacity(pdu.len() * 2 + 7);
        adu.push(ASCII_START);
        write_hex(&mut adu, self.slave_id);
        for &byte in pdu.as_slice() {
            write_hex(&mut adu, byte);
        }

        let mut lrc_input = Vec::with_capacity(pdu.len() + 1);
        lrc_input.push(self.slave_id);
        lrc_input.extend_from_slice(pdu.as_slice());
        write_hex(&mut adu, lrc8(&lrc_input));

        adu.extend_from_slice(ASCII_END);
        Ok(adu)
    }

    fn verify(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let length = response.len();
        // Colon + hex(slave, function, lrc) + CRLF
        if length < ASCII_MIN_SIZE + 6 {
            return Err(ModbusError::short_frame(format!(
                "response length {length} does not meet minimum {}",
                ASCII_MIN_SIZE + 6
            )));
        }
        // Length excluding the colon must be an even number of characters.
        if length % 2 != 1 {
            return Err(ModbusError::protocol(format!(
                "response length {} is not an even number",
                length - 1
            )));
        }
        if response[0] != ASCII_START {
            return Err(ModbusError::protocol("response frame does not start with ':'"));
        }
        if &response[length - 2..] != ASCII_END {
            return Err(ModbusError::protocol(
                "response frame does not end with CRLF",
            ));
        }

        let response_slave = read_hex(&response[1..])?;
        let request_slave = read_hex(&request[1..])?;
        if response_slave != request_slave {
            return Err(ModbusError::protocol(format!(
                "response slave id {response_slave} does not match request {request_slave}"
            )));
        }
        Ok(())
    }

    fn decode(&self, adu: &[u8]) -> ModbusResult<ModbusPdu> {
        let length = adu.len();
        if length < ASCII_MIN_SIZE + 6 {
            return Err(ModbusError::short_frame(format!(
                "frame length {length} does not meet minimum {}",
                ASCII_MIN_SIZE + 6
            )));
        }
        if adu[0] != ASCII_START {
            return Err(ModbusError::protocol("frame does not start with ':'"));
        }
        if &adu[length - 2..] != ASCII_END {
            return Err(ModbusError::protocol("frame does not end with CRLF"));
        }

        let hex_body = &adu[1..length - 2];
        if hex_body.len() % 2 != 0 {
            return Err(ModbusError::protocol(format!(
                "hex content length {} is not even",
                hex_body.len()
            )));
        }

        let mut binary = Vec::with_capacity(hex_body.len() / 2);
        for pair in hex_body.chunks_exact(2) {
            binary.push(read_hex(pair)?);
        }
        if binary.len() < ASCII_MIN_SIZE {
            return Err(ModbusError::short_frame(format!(
                "decoded frame holds {} bytes, need at least {ASCII_MIN_SIZE}",
                binary.len()
            )));
        }

        let received = binary[binary.len() - 1];
        let expected = lrc8(&binary[..binary.len() - 1]);
        if received != expected {
            return Err(ModbusError::protocol(format!(
                "response lrc 0x{received:02X} does not match expected 0x{expected:02X}"
            )));
        }

        // Skip the slave id, drop the LRC.
        ModbusPdu::from_slice(&binary[1..binary.len() - 1])
    }
}

// ============================================================================
// RTU response sizing
// ============================================================================

/// Expected RTU response length for a request ADU.
///
/// Used by the client to know how many bytes to read before turnaround
/// timing. FIFO-queue responses are of undetermined size and fall back to
/// the minimum.
pub fn calculate_response_length(adu: &[u8]) -> usize {
    let mut length = RTU_MIN_SIZE;
    if adu.len() < 2 {
        return length;
    }

    match FunctionCode::from_u8(adu[1]) {
        Ok(FunctionCode::ReadCoils) | Ok(FunctionCode::ReadDiscreteInputs) => {
            if adu.len() >= 6 {
                let count = u16::from_be_bytes([adu[4], adu[5]]) as usize;
                length += 1 + count / 8;
                if count % 8 != 0 {
                    length += 1;
                }
            }
        }
        Ok(FunctionCode::ReadHoldingRegisters)
        | Ok(FunctionCode::ReadInputRegisters)
        | Ok(FunctionCode::ReadWriteMultipleRegisters) => {
            if adu.len() >= 6 {
                let count = u16::from_be_bytes([adu[4], adu[5]]) as usize;
                length += 1 + count * 2;
            }
        }
        Ok(FunctionCode::WriteSingleCoil)
        | Ok(FunctionCode::WriteSingleRegister)
        | Ok(FunctionCode::WriteMultipleCoils)
        | Ok(FunctionCode::WriteMultipleRegisters) => {
            length += 4;
        }
        Ok(FunctionCode::MaskWriteRegister) => {
            length += 6;
        }
        Ok(FunctionCode::ReadFifoQueue) | Err(_) => {}
    }
    length
}
