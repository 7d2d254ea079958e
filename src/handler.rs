//! Server-side request dispatcher.
//!
//! Stateless at the request level: each PDU is decoded, bounds-checked,
//! executed against the datastore and answered independently. The checks run
//! in a fixed order per function code:
//!
//! 1. Payload at least the fixed header for the code → else IllegalDataValue.
//! 2. Quantity bounds (same ranges the client enforces) → else
//!    IllegalDataValue.
//! 3. Datastore call; a range error → IllegalDataAddress.
//! 4. Delay/timeout injection; a triggered timeout returns `None`, telling
//!    the transport to suppress the write and keep the connection open.
//! 5. Response PDU: echo for writes, packed payload for reads.
//!
//! Unsupported function codes and ReadFIFOQueue answer IllegalFunction.

use std::sync::Arc;

use tracing::debug;

use crate::constants::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_READ_WRITE_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::config::RegisterType;
use crate::datastore::DataStore;
use crate::pdu::ModbusPdu;
use crate::protocol::{
    pack_bits, registers_to_bytes, unpack_bits, FunctionCode, ModbusException,
};

/// Dispatches request PDUs against a datastore.
pub struct RequestHandler {
    datastore: Arc<DataStore>,
    /// Timeout injection only works where the transport can really drop a
    /// response; serial servers run with it suppressed.
    allow_timeouts: bool,
}

impl RequestHandler {
    /// Handler honoring timeout injection (TCP servers).
    pub fn new(datastore: Arc<DataStore>) -> Self {
        Self {
            datastore,
            allow_timeouts: true,
        }
    }

    /// Handler with timeout injection suppressed (RTU/ASCII servers).
    pub fn with_suppressed_timeouts(datastore: Arc<DataStore>) -> Self {
        Self {
            datastore,
            allow_timeouts: false,
        }
    }

    /// Shared datastore reference.
    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /// Process one request PDU. `None` means "send no response" (timeout
    /// injection).
    pub async fn handle_request(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let Some(fc) = request.function_code() else {
            return Some(exception(0, ModbusException::IllegalFunction));
        };

        debug!(
            "handling FC=0x{fc:02X} ({})",
            ModbusPdu::function_code_description(fc)
        );

        match FunctionCode::from_u8(fc) {
            Ok(FunctionCode::ReadCoils) => self.handle_read_bits(request, RegisterType::Coils).await,
            Ok(FunctionCode::ReadDiscreteInputs) => {
                self.handle_read_bits(request, RegisterType::DiscreteInputs).await
            }
            Ok(FunctionCode::ReadHoldingRegisters) => {
                self.handle_read_words(request, RegisterType::HoldingRegs).await
            }
            Ok(FunctionCode::ReadInputRegisters) => {
                self.handle_read_words(request, RegisterType::InputRegs).await
            }
            Ok(FunctionCode::WriteSingleCoil) => self.handle_write_single_coil(request).await,
            Ok(FunctionCode::WriteSingleRegister) => {
                self.handle_write_single_register(request).await
            }
            Ok(FunctionCode::WriteMultipleCoils) => self.handle_write_multiple_coils(request).await,
            Ok(FunctionCode::WriteMultipleRegisters) => {
                self.handle_write_multiple_registers(request).await
            }
            Ok(FunctionCode::MaskWriteRegister) => self.handle_mask_write_register(request).await,
            Ok(FunctionCode::ReadWriteMultipleRegisters) => {
                self.handle_read_write_registers(request).await
            }
            // FIFO queue is recognized on the client path but not served.
            Ok(FunctionCode::ReadFifoQueue) | Err(_) => {
                Some(exception(fc, ModbusException::IllegalFunction))
            }
        }
    }

    async fn handle_read_bits(
        &self,
        request: &ModbusPdu,
        reg_type: RegisterType,
    ) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 4 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity < 1 || quantity > MAX_READ_COILS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let bits = match reg_type {
            RegisterType::Coils => self.datastore.read_coils(address, quantity),
            _ => self.datastore.read_discrete_inputs(address, quantity),
        };
        let bits = match bits {
            Ok(bits) => bits,
            Err(_) => return Some(exception(fc, ModbusException::IllegalDataAddress)),
        };

        if !self.datastore.apply_delay(reg_type, address, self.allow_timeouts).await {
            return None;
        }

        let packed = pack_bits(&bits);
        let mut response = ModbusPdu::new();
        response.push(fc).ok()?;
        response.push(packed.len() as u8).ok()?;
        response.extend(&packed).ok()?;
        Some(response)
    }

    async fn handle_read_words(
        &self,
        request: &ModbusPdu,
        reg_type: RegisterType,
    ) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 4 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity < 1 || quantity > MAX_READ_REGISTERS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let words = match reg_type {
            RegisterType::HoldingRegs => self.datastore.read_holding_registers(address, quantity),
            _ => self.datastore.read_input_registers(address, quantity),
        };
        let words = match words {
            Ok(words) => words,
            Err(_) => return Some(exception(fc, ModbusException::IllegalDataAddress)),
        };

        if !self.datastore.apply_delay(reg_type, address, self.allow_timeouts).await {
            return None;
        }

        let bytes = registers_to_bytes(&words);
        let mut response = ModbusPdu::new();
        response.push(fc).ok()?;
        response.push(bytes.len() as u8).ok()?;
        response.extend(&bytes).ok()?;
        Some(response)
    }

    async fn handle_write_single_coil(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 4 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        if value != 0x0000 && value != 0xFF00 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        self.datastore.write_single_coil(address, value == 0xFF00);

        if !self
            .datastore
            .apply_delay(RegisterType::Coils, address, self.allow_timeouts)
            .await
        {
            return None;
        }

        // Echo back the request.
        ModbusPdu::from_parts(fc, data).ok()
    }

    async fn handle_write_single_register(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 4 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        self.datastore.write_single_register(address, value);

        if !self
            .datastore
            .apply_delay(RegisterType::HoldingRegs, address, self.allow_timeouts)
            .await
        {
            return None;
        }

        ModbusPdu::from_parts(fc, data).ok()
    }

    async fn handle_write_multiple_coils(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 5 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;

        if quantity < 1 || quantity > MAX_WRITE_COILS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }
        let expected_byte_count = (quantity as usize).div_ceil(8);
        if byte_count != expected_byte_count || data.len() < 5 + byte_count {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let coils = unpack_bits(&data[5..5 + byte_count], quantity as usize);
        if self.datastore.write_multiple_coils(address, &coils).is_err() {
            return Some(exception(fc, ModbusException::IllegalDataAddress));
        }

        if !self
            .datastore
            .apply_delay(RegisterType::Coils, address, self.allow_timeouts)
            .await
        {
            return None;
        }

        echo_range(fc, address, quantity)
    }

    async fn handle_write_multiple_registers(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 5 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;

        if quantity < 1 || quantity > MAX_WRITE_REGISTERS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }
        if byte_count != quantity as usize * 2 || data.len() < 5 + byte_count {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let registers = crate::protocol::bytes_to_registers(&data[5..5 + byte_count]);
        if self
            .datastore
            .write_multiple_registers(address, &registers)
            .is_err()
        {
            return Some(exception(fc, ModbusException::IllegalDataAddress));
        }

        if !self
            .datastore
            .apply_delay(RegisterType::HoldingRegs, address, self.allow_timeouts)
            .await
        {
            return None;
        }

        echo_range(fc, address, quantity)
    }

    async fn handle_mask_write_register(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 6 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let address = u16::from_be_bytes([data[0], data[1]]);
        let and_mask = u16::from_be_bytes([data[2], data[3]]);
        let or_mask = u16::from_be_bytes([data[4], data[5]]);

        self.datastore.mask_write_register(address, and_mask, or_mask);

        if !self
            .datastore
            .apply_delay(RegisterType::HoldingRegs, address, self.allow_timeouts)
            .await
        {
            return None;
        }

        ModbusPdu::from_parts(fc, data).ok()
    }

    async fn handle_read_write_registers(&self, request: &ModbusPdu) -> Option<ModbusPdu> {
        let fc = request.function_code().unwrap_or(0);
        let data = request.payload();
        if data.len() < 9 {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        let read_address = u16::from_be_bytes([data[0], data[1]]);
        let read_quantity = u16::from_be_bytes([data[2], data[3]]);
        let write_address = u16::from_be_bytes([data[4], data[5]]);
        let write_quantity = u16::from_be_bytes([data[6], data[7]]);
        let write_byte_count = data[8] as usize;

        if read_quantity < 1 || read_quantity > MAX_READ_REGISTERS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }
        if write_quantity < 1 || write_quantity > MAX_READ_WRITE_REGISTERS {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }
        if write_byte_count != write_quantity as usize * 2 || data.len() < 9 + write_byte_count {
            return Some(exception(fc, ModbusException::IllegalDataValue));
        }

        // Write first, then read.
        let registers = crate::protocol::bytes_to_registers(&data[9..9 + write_byte_count]);
        if self
            .datastore
            .write_multiple_registers(write_address, &registers)
            .is_err()
        {
            return Some(exception(fc, ModbusException::IllegalDataAddress));
        }

        let words = match self
            .datastore
            .read_holding_registers(read_address, read_quantity)
        {
            Ok(words) => words,
            Err(_) => return Some(exception(fc, ModbusException::IllegalDataAddress)),
        };

        if !self
            .datastore
            .apply_delay(RegisterType::HoldingRegs, read_address, self.allow_timeouts)
            .await
        {
            return None;
        }

        let bytes = registers_to_bytes(&words);
        let mut response = ModbusPdu::new();
        response.push(fc).ok()?;
        response.push(bytes.len() as u8).ok()?;
        response.extend(&bytes).ok()?;
        Some(response)
    }
}

fn exception(function_code: u8, code: ModbusException) -> ModbusPdu {
    ModbusPdu::exception(function_code, code.to_u8())
}

fn echo_range(fc: u8, address: u16, quantity: u16) -> Option<ModbusPdu> {
    let mut response = ModbusPdu::new();
    response.push(fc).ok()?;
    response.push_u16(address).ok()?;
    response.push_u16(quantity).ok()?;
    Some(response)
}
