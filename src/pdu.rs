//! Optimized Modbus PDU data structure
//!
//! Use a fixed-size stack array to avoid heap allocation and improve performance.

use tracing::debug;

use crate::constants::MAX_PDU_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::FunctionCode;

/// High-performance PDU with stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    #[inline]
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Create a PDU from a function code and payload
    #[inline]
    pub fn from_parts(function_code: u8, payload: &[u8]) -> ModbusResult<Self> {
        let mut pdu = Self::new();
        pdu.push(function_code)?;
        pdu.extend(payload)?;
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get the whole PDU (function code followed by payload)
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get the payload after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 0 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Build an exception response PDU: request function code with the high
    /// bit set, followed by the exception code.
    pub fn exception(function_code: u8, exception_code: u8) -> Self {
        let mut pdu = Self::new();
        pdu.data[0] = function_code | 0x80;
        pdu.data[1] = exception_code;
        pdu.len = 2;
        pdu
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match FunctionCode::from_u8(fc & 0x7F) {
            Ok(FunctionCode::ReadCoils) => "Read Coils",
            Ok(FunctionCode::ReadDiscreteInputs) => "Read Discrete Inputs",
            Ok(FunctionCode::ReadHoldingRegisters) => "Read Holding Registers",
            Ok(FunctionCode::ReadInputRegisters) => "Read Input Registers",
            Ok(FunctionCode::WriteSingleCoil) => "Write Single Coil",
            Ok(FunctionCode::WriteSingleRegister) => "Write Single Register",
            Ok(FunctionCode::WriteMultipleCoils) => "Write Multiple Coils",
            Ok(FunctionCode::WriteMultipleRegisters) => "Write Multiple Registers",
            Ok(FunctionCode::MaskWriteRegister) => "Mask Write Register",
            Ok(FunctionCode::ReadWriteMultipleRegisters) => "Read/Write Multiple Registers",
            Ok(FunctionCode::ReadFifoQueue) => "Read FIFO Queue",
            Err(_) => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusPdu")
            .field("function_code", &self.function_code())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add a big-endian u16 field (address, quantity, value or mask)
    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC=0x{:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// Build a read request PDU for FC01-04: address and quantity
    pub fn build_read_request(fc: u8, address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .word(address)?
            .word(quantity)?
            .build())
    }

    /// Build a write-single PDU for FC05/FC06: address and value
    pub fn build_write_single(fc: u8, address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .word(address)?
            .word(value)?
            .build())
    }

    /// Build a write-multiple PDU for FC15/FC16: range header, byte count
    /// and raw payload bytes
    pub fn build_write_multiple(
        fc: u8,
        address: u16,
        quantity: u16,
        values: &[u8],
    ) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .word(address)?
            .word(quantity)?
            .byte(values.len() as u8)?
            .data(values)?
            .build())
    }

    /// Build a mask-write PDU (FC22): address, AND-mask, OR-mask
    pub fn build_mask_write_register(
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FunctionCode::MaskWriteRegister.to_u8())?
            .word(address)?
            .word(and_mask)?
            .word(or_mask)?
            .build())
    }

    /// Build a read/write-multiple PDU (FC23): both range headers followed
    /// by the write byte count and payload
    pub fn build_read_write_registers(
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_quantity: u16,
        values: &[u8],
    ) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FunctionCode::ReadWriteMultipleRegisters.to_u8())?
            .word(read_address)?
            .word(read_quantity)?
            .word(write_address)?
            .word(write_quantity)?
            .byte(values.len() as u8)?
            .data(values)?
            .build())
    }

    /// Build a FIFO queue read PDU (FC24): pointer address only
    pub fn build_read_fifo_queue(address: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FunctionCode::ReadFifoQueue.to_u8())?
            .word(address)?
            .build())
    }
}
