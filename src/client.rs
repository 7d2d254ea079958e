//! Modbus client façade.
//!
//! The client implements the application layer once and reuses it for every
//! transport: each operation validates its arguments locally (before any
//! byte is written), builds the request PDU, runs the encode → send →
//! verify → decode cycle, maps exception responses to typed errors, and
//! validates the response shape against the request. Results are the raw
//! response payload bytes; the packing helpers in [`crate::protocol`] turn
//! them into bits or registers when needed.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use simbus::{TcpClient, ModbusResult};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = TcpClient::new("127.0.0.1:502".parse().unwrap());
//!     let cancel = CancellationToken::new();
//!
//!     // Read 10 holding registers starting at address 0.
//!     let bytes = client.read_holding_registers(&cancel, 0, 10).await?;
//!     println!("registers: {:?}", simbus::protocol::bytes_to_registers(&bytes));
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::{
    COIL_OFF, COIL_ON, MAX_FIFO_COUNT, MAX_READ_COILS, MAX_READ_REGISTERS,
    MAX_READ_WRITE_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS, TCP_IDLE_TIMEOUT, TCP_TIMEOUT,
};
use crate::error::{ModbusError, ModbusResult};
use crate::framer::{AsciiFramer, Framer, MbapFramer, RtuFramer};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::protocol::{FunctionCode, SlaveId};
use crate::transport::{
    AsciiTransport, RtuTransport, SerialConfig, SerialLink, TcpTransport, Transport,
    TransportStats,
};

/// Generic Modbus client over a framer and a transport.
///
/// The transport serializes concurrent sends, so the client itself is usable
/// behind a shared reference from multiple tasks.
pub struct Client<F, T> {
    framer: F,
    transport: T,
}

/// Modbus TCP client (MBAP framing).
pub type TcpClient = Client<MbapFramer, TcpTransport>;

/// Modbus RTU client (CRC-16 framing over a serial line).
pub type RtuClient = Client<RtuFramer, RtuTransport>;

/// Modbus ASCII client (LRC framing with hex-character envelope).
pub type AsciiClient = Client<AsciiFramer, AsciiTransport>;

impl TcpClient {
    /// Client for `addr` with unit id 1 and default timeouts.
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_options(addr, 1, TCP_TIMEOUT, TCP_IDLE_TIMEOUT)
    }

    /// Client with explicit unit id, per-I/O timeout and idle-close timeout.
    pub fn with_options(
        addr: SocketAddr,
        unit_id: SlaveId,
        timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            framer: MbapFramer::new(unit_id),
            transport: TcpTransport::new(addr, timeout, idle_timeout),
        }
    }
}

impl RtuClient {
    /// Client that lazily opens the serial device at `path`.
    pub fn new(path: &str, slave_id: SlaveId, config: SerialConfig) -> Self {
        Self {
            framer: RtuFramer::new(slave_id),
            transport: RtuTransport::new(path, config),
        }
    }

    /// Client over an already-open byte stream (pseudo-terminal path, test
    /// duplex).
    pub fn with_port(port: impl SerialLink + 'static, slave_id: SlaveId, config: SerialConfig) -> Self {
        Self {
            framer: RtuFramer::new(slave_id),
            transport: RtuTransport::with_port(port, config),
        }
    }
}

impl AsciiClient {
    /// Client that lazily opens the serial device at `path`.
    pub fn new(path: &str, slave_id: SlaveId, config: SerialConfig) -> Self {
        Self {
            framer: AsciiFramer::new(slave_id),
            transport: AsciiTransport::new(path, config),
        }
    }

    /// Client over an already-open byte stream.
    pub fn with_port(port: impl SerialLink + 'static, slave_id: SlaveId, config: SerialConfig) -> Self {
        Self {
            framer: AsciiFramer::new(slave_id),
            transport: AsciiTransport::with_port(port, config),
        }
    }
}

impl<F: Framer, T: Transport> Client<F, T> {
    /// Client from explicit framer and transport.
    pub fn from_parts(framer: F, transport: T) -> Self {
        Self { framer, transport }
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> ModbusResult<()> {
        self.transport.close().await
    }

    /// Transport statistics snapshot.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Full request/response cycle for one PDU, with exception mapping.
    async fn send_request(
        &self,
        cancel: &CancellationToken,
        request: &ModbusPdu,
    ) -> ModbusResult<ModbusPdu> {
        let adu_request = self.framer.encode(request)?;
        let adu_response = self.transport.send(cancel, &adu_request).await?;
        self.framer.verify(&adu_request, &adu_response)?;
        let response = self.framer.decode(&adu_response)?;

        let request_fc = request.function_code().unwrap_or(0);
        match response.function_code() {
            Some(fc) if fc == request_fc => {}
            Some(fc) if fc == request_fc | 0x80 => {
                return Err(ModbusError::exception(
                    fc,
                    response.exception_code().unwrap_or(0),
                ));
            }
            Some(fc) => {
                return Err(ModbusError::invalid_response(format!(
                    "response function code 0x{fc:02X} does not match request 0x{request_fc:02X}"
                )));
            }
            None => return Err(ModbusError::invalid_response("empty response PDU")),
        }
        if response.payload().is_empty() {
            return Err(ModbusError::invalid_response("response data is empty"));
        }
        Ok(response)
    }

    /// Validate and strip a `byte_count || bytes` response payload.
    fn take_counted_payload(response: &ModbusPdu) -> ModbusResult<Vec<u8>> {
        let payload = response.payload();
        let count = payload[0] as usize;
        if count != payload.len() - 1 {
            return Err(ModbusError::invalid_response(format!(
                "response data size {} does not match count {count}",
                payload.len() - 1
            )));
        }
        Ok(payload[1..].to_vec())
    }

    /// Validate a 4-byte `addr || word` echo and return the trailing word
    /// bytes.
    fn take_echo(
        response: &ModbusPdu,
        address: u16,
        word: u16,
        word_name: &str,
    ) -> ModbusResult<Vec<u8>> {
        let payload = response.payload();
        if payload.len() != 4 {
            return Err(ModbusError::invalid_response(format!(
                "response data size {} does not match expected 4",
                payload.len()
            )));
        }
        let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
        if echoed_address != address {
            return Err(ModbusError::invalid_response(format!(
                "response address {echoed_address} does not match request {address}"
            )));
        }
        let echoed_word = u16::from_be_bytes([payload[2], payload[3]]);
        if echoed_word != word {
            return Err(ModbusError::invalid_response(format!(
                "response {word_name} {echoed_word} does not match request {word}"
            )));
        }
        Ok(payload[2..].to_vec())
    }

    /// Read coils (function code 0x01).
    ///
    /// Returns `byte_count = ceil(quantity / 8)` packed bytes, LSB first.
    pub async fn read_coils(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_READ_COILS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_READ_COILS}"
            )));
        }
        let request =
            PduBuilder::build_read_request(FunctionCode::ReadCoils.to_u8(), address, quantity)?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading coils"))?;
        Self::take_counted_payload(&response)
    }

    /// Read discrete inputs (function code 0x02).
    pub async fn read_discrete_inputs(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_READ_COILS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_READ_COILS}"
            )));
        }
        let request = PduBuilder::build_read_request(
            FunctionCode::ReadDiscreteInputs.to_u8(),
            address,
            quantity,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading discrete inputs"))?;
        Self::take_counted_payload(&response)
    }

    /// Read holding registers (function code 0x03).
    ///
    /// Returns `2 * quantity` big-endian register bytes.
    pub async fn read_holding_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_READ_REGISTERS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_READ_REGISTERS}"
            )));
        }
        let request = PduBuilder::build_read_request(
            FunctionCode::ReadHoldingRegisters.to_u8(),
            address,
            quantity,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading holding registers"))?;
        Self::take_counted_payload(&response)
    }

    /// Read input registers (function code 0x04).
    pub async fn read_input_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_READ_REGISTERS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_READ_REGISTERS}"
            )));
        }
        let request = PduBuilder::build_read_request(
            FunctionCode::ReadInputRegisters.to_u8(),
            address,
            quantity,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading input registers"))?;
        Self::take_counted_payload(&response)
    }

    /// Write single coil (function code 0x05).
    ///
    /// `value` must be 0xFF00 (ON) or 0x0000 (OFF); the response echoes
    /// address and value.
    pub async fn write_single_coil(
        &self,
        cancel: &CancellationToken,
        address: u16,
        value: u16,
    ) -> ModbusResult<Vec<u8>> {
        if value != COIL_ON && value != COIL_OFF {
            return Err(ModbusError::invalid_data(format!(
                "state 0x{value:04X} must be either 0xFF00 (ON) or 0x0000 (OFF)"
            )));
        }
        let request =
            PduBuilder::build_write_single(FunctionCode::WriteSingleCoil.to_u8(), address, value)?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("writing single coil"))?;
        Self::take_echo(&response, address, value, "value")
    }

    /// Write single register (function code 0x06).
    pub async fn write_single_register(
        &self,
        cancel: &CancellationToken,
        address: u16,
        value: u16,
    ) -> ModbusResult<Vec<u8>> {
        let request = PduBuilder::build_write_single(
            FunctionCode::WriteSingleRegister.to_u8(),
            address,
            value,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("writing single register"))?;
        Self::take_echo(&response, address, value, "value")
    }

    /// Write multiple coils (function code 0x0F).
    ///
    /// `values` carries the LSB-first packed coil bytes for `quantity`
    /// coils; the response echoes address and quantity.
    pub async fn write_multiple_coils(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
        values: &[u8],
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_WRITE_COILS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_WRITE_COILS}"
            )));
        }
        let request = PduBuilder::build_write_multiple(
            FunctionCode::WriteMultipleCoils.to_u8(),
            address,
            quantity,
            values,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("writing multiple coils"))?;
        Self::take_echo(&response, address, quantity, "quantity")
    }

    /// Write multiple registers (function code 0x10).
    ///
    /// `values` carries `2 * quantity` big-endian register bytes.
    pub async fn write_multiple_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
        values: &[u8],
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_WRITE_REGISTERS).contains(&quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "quantity {quantity} must be between 1 and {MAX_WRITE_REGISTERS}"
            )));
        }
        let request = PduBuilder::build_write_multiple(
            FunctionCode::WriteMultipleRegisters.to_u8(),
            address,
            quantity,
            values,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("writing multiple registers"))?;
        Self::take_echo(&response, address, quantity, "quantity")
    }

    /// Mask write register (function code 0x16).
    ///
    /// Result register = `(current AND and_mask) OR (or_mask AND NOT
    /// and_mask)`; the response echoes address and both masks.
    pub async fn mask_write_register(
        &self,
        cancel: &CancellationToken,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<Vec<u8>> {
        let request = PduBuilder::build_mask_write_register(address, and_mask, or_mask)?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("mask writing register"))?;

        let payload = response.payload();
        if payload.len() != 6 {
            return Err(ModbusError::invalid_response(format!(
                "response data size {} does not match expected 6",
                payload.len()
            )));
        }
        let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
        if echoed_address != address {
            return Err(ModbusError::invalid_response(format!(
                "response address {echoed_address} does not match request {address}"
            )));
        }
        let echoed_and = u16::from_be_bytes([payload[2], payload[3]]);
        if echoed_and != and_mask {
            return Err(ModbusError::invalid_response(format!(
                "response AND-mask {echoed_and} does not match request {and_mask}"
            )));
        }
        let echoed_or = u16::from_be_bytes([payload[4], payload[5]]);
        if echoed_or != or_mask {
            return Err(ModbusError::invalid_response(format!(
                "response OR-mask {echoed_or} does not match request {or_mask}"
            )));
        }
        Ok(payload[2..].to_vec())
    }

    /// Read/write multiple registers (function code 0x17).
    ///
    /// The write is performed before the read; the response carries the read
    /// register bytes.
    pub async fn read_write_multiple_registers(
        &self,
        cancel: &CancellationToken,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_quantity: u16,
        values: &[u8],
    ) -> ModbusResult<Vec<u8>> {
        if !(1..=MAX_READ_REGISTERS).contains(&read_quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "read quantity {read_quantity} must be between 1 and {MAX_READ_REGISTERS}"
            )));
        }
        if !(1..=MAX_READ_WRITE_REGISTERS).contains(&write_quantity) {
            return Err(ModbusError::invalid_quantity(format!(
                "write quantity {write_quantity} must be between 1 and {MAX_READ_WRITE_REGISTERS}"
            )));
        }
        let request = PduBuilder::build_read_write_registers(
            read_address,
            read_quantity,
            write_address,
            write_quantity,
            values,
        )?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading/writing multiple registers"))?;
        Self::take_counted_payload(&response)
    }

    /// Read FIFO queue (function code 0x18).
    ///
    /// Returns the FIFO register bytes after validating the declared byte
    /// count and the 31-entry ceiling.
    pub async fn read_fifo_queue(
        &self,
        cancel: &CancellationToken,
        address: u16,
    ) -> ModbusResult<Vec<u8>> {
        let request = PduBuilder::build_read_fifo_queue(address)?;
        let response = self
            .send_request(cancel, &request)
            .await
            .map_err(|e| e.context("reading FIFO queue"))?;

        let payload = response.payload();
        if payload.len() < 4 {
            return Err(ModbusError::invalid_response(format!(
                "response data size {} is less than expected 4",
                payload.len()
            )));
        }
        let byte_count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if byte_count != payload.len() - 1 {
            return Err(ModbusError::invalid_response(format!(
                "response data size {} does not match count {byte_count}",
                payload.len() - 1
            )));
        }
        let fifo_count = u16::from_be_bytes([payload[2], payload[3]]);
        if fifo_count > MAX_FIFO_COUNT {
            return Err(ModbusError::invalid_response(format!(
                "fifo count {fifo_count} is greater than expected {MAX_FIFO_COUNT}"
            )));
        }
        Ok(payload[4..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Framer that passes PDU bytes through unchanged; lets tests feed the
    /// client raw response PDUs.
    struct PassthroughFramer;

    impl Framer for PassthroughFramer {
        fn encode(&self, pdu: &ModbusPdu) -> ModbusResult<Vec<u8>> {
            Ok(pdu.as_slice().to_vec())
        }

        fn verify(&self, _request: &[u8], _response: &[u8]) -> ModbusResult<()> {
            Ok(())
        }

        fn decode(&self, adu: &[u8]) -> ModbusResult<ModbusPdu> {
            ModbusPdu::from_slice(adu)
        }
    }

    /// Transport that records requests and replays canned responses.
    struct MockTransport {
        requests: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<VecDeque<Vec<u8>>>,
    }

    impl MockTransport {
        fn with_responses(responses: Vec<Vec<u8>>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        async fn send(
            &self,
            _cancel: &CancellationToken,
            request: &[u8],
        ) -> ModbusResult<Vec<u8>> {
            self.requests.lock().unwrap().push(request.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ModbusError::transport("no response prepared in mock"))
        }

        async fn close(&self) -> ModbusResult<()> {
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn mock_client(responses: Vec<Vec<u8>>) -> Client<PassthroughFramer, MockTransport> {
        Client::from_parts(PassthroughFramer, MockTransport::with_responses(responses))
    }

    #[tokio::test]
    async fn test_quantity_guards_fire_before_any_send() {
        let client = mock_client(vec![]);
        let cancel = CancellationToken::new();

        assert!(matches!(
            client.read_coils(&cancel, 0, 0).await.unwrap_err(),
            ModbusError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            client.read_coils(&cancel, 0, 2001).await.unwrap_err(),
            ModbusError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            client
                .read_holding_registers(&cancel, 0, 126)
                .await
                .unwrap_err(),
            ModbusError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            client
                .write_multiple_registers(&cancel, 0, 124, &[])
                .await
                .unwrap_err(),
            ModbusError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            client
                .read_write_multiple_registers(&cancel, 0, 1, 0, 122, &[])
                .await
                .unwrap_err(),
            ModbusError::InvalidQuantity { .. }
        ));

        // Nothing reached the transport.
        assert!(client.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_write_single_coil_rejects_bad_value() {
        let client = mock_client(vec![]);
        let cancel = CancellationToken::new();

        let err = client
            .write_single_coil(&cancel, 0, 0x1234)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
        assert!(client.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_read_holding_registers_payload() {
        let client = mock_client(vec![vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]]);
        let cancel = CancellationToken::new();

        let bytes = client
            .read_holding_registers(&cancel, 0, 2)
            .await
            .unwrap();
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);

        let sent = client.transport.sent();
        assert_eq!(sent[0], vec![0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_byte_count_mismatch_is_invalid_response() {
        // Declared count 4, only 2 bytes present.
        let client = mock_client(vec![vec![0x03, 0x04, 0x12, 0x34]]);
        let cancel = CancellationToken::new();

        let err = client
            .read_holding_registers(&cancel, 0, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            ModbusError::InvalidResponse { .. }
        ));
    }

    #[tokio::test]
    async fn test_exception_response_is_typed() {
        let client = mock_client(vec![vec![0x83, 0x02]]);
        let cancel = CancellationToken::new();

        let err = client
            .read_holding_registers(&cancel, 9999, 1)
            .await
            .unwrap_err();
        assert_eq!(err.as_exception(), Some((0x83, 0x02)));
    }

    #[tokio::test]
    async fn test_write_single_register_echo_checked() {
        // Echo disagrees on the value.
        let client = mock_client(vec![vec![0x06, 0x00, 0x01, 0xAB, 0xCD]]);
        let cancel = CancellationToken::new();

        let err = client
            .write_single_register(&cancel, 1, 0x1234)
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            ModbusError::InvalidResponse { .. }
        ));
    }

    #[tokio::test]
    async fn test_write_multiple_registers_echo() {
        let client = mock_client(vec![vec![0x10, 0x00, 0x64, 0x00, 0x02]]);
        let cancel = CancellationToken::new();

        let echoed = client
            .write_multiple_registers(&cancel, 100, 2, &[0x00, 0x01, 0x00, 0x02])
            .await
            .unwrap();
        assert_eq!(echoed, vec![0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_mask_write_register_echo() {
        let client = mock_client(vec![vec![0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]]);
        let cancel = CancellationToken::new();

        let echoed = client
            .mask_write_register(&cancel, 4, 0x00F2, 0x0025)
            .await
            .unwrap();
        assert_eq!(echoed, vec![0x00, 0xF2, 0x00, 0x25]);
    }

    #[tokio::test]
    async fn test_read_fifo_queue_validation() {
        // byte_count 7 = len(data)-1, fifo_count 3, three registers
        let client = mock_client(vec![vec![
            0x18, 0x00, 0x07, 0x00, 0x03, 0x01, 0x10, 0x01, 0x20, 0x01, 0x30,
        ]]);
        let cancel = CancellationToken::new();

        let bytes = client.read_fifo_queue(&cancel, 100).await.unwrap();
        assert_eq!(bytes, vec![0x01, 0x10, 0x01, 0x20, 0x01, 0x30]);

        // fifo count above 31 is rejected
        let client = mock_client(vec![vec![0x18, 0x00, 0x03, 0x00, 0x20, 0x00, 0x00]]);
        let err = client.read_fifo_queue(&cancel, 100).await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            ModbusError::InvalidResponse { .. }
        ));
    }

    #[tokio::test]
    async fn test_error_carries_operation_context() {
        let client = mock_client(vec![vec![0x83, 0x04]]);
        let cancel = CancellationToken::new();

        let err = client
            .read_holding_registers(&cancel, 0, 1)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("reading holding registers:"));
    }
}
