//! Modbus server (simulator) transports.
//!
//! The TCP server accepts connections and handles each on its own task; the
//! serial servers own one bidirectional byte stream (a pseudo-terminal
//! master in production, a duplex pipe in tests) and serve frames
//! sequentially. All of them decode requests, filter by slave/unit
//! addressing, dispatch to [`RequestHandler`] and write back the encoded
//! response — unless the dispatcher suppressed it (timeout injection), in
//! which case nothing is written and the connection stays open.
//!
//! Stop is cooperative: a cancellation token unblocks every reader. The
//! serial stop additionally bounds the join at one second; a reader stuck in
//! an OS call is abandoned with a warning, matching the behavior of a
//! blocked pseudo-terminal read that only resolves when the process exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    ASCII_MAX_SIZE, ASCII_START, DEFAULT_BAUD_RATE, RTU_MAX_SIZE, RTU_MIN_SIZE, TCP_HEADER_SIZE,
    TCP_MAX_LENGTH, TCP_PROTOCOL_IDENTIFIER,
};
use crate::datastore::DataStore;
use crate::error::{ModbusError, ModbusResult};
use crate::framer::{read_hex, AsciiFramer, Framer, RtuFramer};
use crate::handler::RequestHandler;
use crate::pdu::ModbusPdu;
use crate::protocol::{format_hex, FunctionCode, SlaveId};
use crate::transport::{turnaround_delay, SerialLink};

/// How long `stop` waits for a serial serve task before abandoning it.
const SERIAL_STOP_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// TCP server
// ============================================================================

/// Modbus TCP server.
pub struct TcpServer {
    handler: Arc<RequestHandler>,
    address: SocketAddr,
    local_addr: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    serve_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Server bound to `address` on `start`, serving `datastore`.
    pub fn new(datastore: Arc<DataStore>, address: SocketAddr) -> Self {
        Self {
            handler: Arc::new(RequestHandler::new(datastore)),
            address,
            local_addr: None,
            cancel: None,
            serve_task: None,
        }
    }

    /// Actual listening address; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start accepting connections.
    pub async fn start(&mut self) -> ModbusResult<()> {
        if self.serve_task.is_some() {
            return Err(ModbusError::configuration("server is already running"));
        }

        let listener = TcpListener::bind(self.address)
            .await
            .map_err(|e| ModbusError::io(format!("binding {}", self.address), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ModbusError::io("reading local address", e))?;
        info!("tcp server listening on {local_addr}");
        self.local_addr = Some(local_addr);

        let cancel = CancellationToken::new();
        let handler = self.handler.clone();
        let loop_cancel = cancel.clone();
        self.cancel = Some(cancel);
        self.serve_task = Some(tokio::spawn(async move {
            accept_loop(listener, handler, loop_cancel).await;
        }));
        Ok(())
    }

    /// Stop accepting, close all connections and wait for them to finish.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
        info!("tcp server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        handle_connection(stream, peer, handler, cancel).await;
                    });
                }
                Err(e) => {
                    error!("error accepting connection: {e}");
                }
            },
        }
    }

    // Connection tasks observe the same token; wait for all of them.
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    cancel: CancellationToken,
) {
    let mut header = [0u8; TCP_HEADER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("closing connection from {peer} (server stopping)");
                return;
            }
            result = stream.read_exact(&mut header) => {
                if let Err(e) = result {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("connection closed by {peer}");
                    } else {
                        warn!("error reading header from {peer}: {e}");
                    }
                    return;
                }
            }
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];

        if protocol_id != TCP_PROTOCOL_IDENTIFIER {
            warn!("invalid protocol id {protocol_id} from {peer}");
            continue;
        }
        if length < 2 || length > TCP_MAX_LENGTH {
            warn!("invalid length {length} from {peer}");
            continue;
        }

        // The length field counts the unit id already consumed in the header.
        let mut pdu_data = vec![0u8; length - 1];
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = stream.read_exact(&mut pdu_data) => {
                if let Err(e) = result {
                    warn!("error reading PDU from {peer}: {e}");
                    return;
                }
            }
        }

        debug!(
            "received from {peer}: {} {}",
            format_hex(&header),
            format_hex(&pdu_data)
        );

        let Ok(request) = ModbusPdu::from_slice(&pdu_data) else {
            warn!("oversized PDU from {peer}");
            continue;
        };

        let Some(response) = handler.handle_request(&request).await else {
            // Timeout injection: no response, connection stays open.
            debug!("suppressing response to {peer} (timeout injection)");
            continue;
        };

        let response_length = (1 + response.len()) as u16;
        let mut out = Vec::with_capacity(TCP_HEADER_SIZE + response.len());
        out.extend_from_slice(&transaction_id.to_be_bytes());
        out.extend_from_slice(&TCP_PROTOCOL_IDENTIFIER.to_be_bytes());
        out.extend_from_slice(&response_length.to_be_bytes());
        out.push(unit_id);
        out.extend_from_slice(response.as_slice());

        debug!("sending to {peer}: {}", format_hex(&out));
        if let Err(e) = stream.write_all(&out).await {
            error!("error writing response to {peer}: {e}");
            return;
        }
    }
}

// ============================================================================
// RTU server
// ============================================================================

/// RTU server configuration.
#[derive(Debug, Clone)]
pub struct RtuServerConfig {
    pub slave_id: SlaveId,
    pub baud_rate: u32,
}

impl Default for RtuServerConfig {
    fn default() -> Self {
        Self {
            slave_id: 1,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Modbus RTU server over an injected byte stream.
///
/// Broadcast requests (slave id 0) are accepted and answered as if
/// addressed; the response carries the configured slave id.
pub struct RtuServer<S> {
    stream: Option<S>,
    handler: Arc<RequestHandler>,
    config: RtuServerConfig,
    cancel: Option<CancellationToken>,
    serve_task: Option<JoinHandle<()>>,
}

impl<S: SerialLink + 'static> RtuServer<S> {
    pub fn new(stream: S, datastore: Arc<DataStore>, config: RtuServerConfig) -> Self {
        Self {
            stream: Some(stream),
            // Pseudo-terminals cannot drop bytes, so timeout injection is off.
            handler: Arc::new(RequestHandler::with_suppressed_timeouts(datastore)),
            config,
            cancel: None,
            serve_task: None,
        }
    }

    /// Start serving frames from the stream.
    pub fn start(&mut self) -> ModbusResult<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ModbusError::configuration("server is already running"))?;

        let cancel = CancellationToken::new();
        let handler = self.handler.clone();
        let config = self.config.clone();
        let task_cancel = cancel.clone();
        self.cancel = Some(cancel);
        self.serve_task = Some(tokio::spawn(async move {
            rtu_serve(stream, handler, config, task_cancel).await;
        }));
        Ok(())
    }

    /// Stop serving; waits at most one second for the serve task.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.serve_task.take() {
            if timeout(SERIAL_STOP_TIMEOUT, task).await.is_err() {
                warn!("rtu server stop timed out (task may still be reading)");
            }
        }
        Ok(())
    }
}

async fn rtu_serve<S: SerialLink>(
    mut stream: S,
    handler: Arc<RequestHandler>,
    config: RtuServerConfig,
    cancel: CancellationToken,
) {
    let framer = RtuFramer::new(config.slave_id);
    info!("rtu server listening (slave id {})", config.slave_id);

    loop {
        let mut buf = [0u8; RTU_MAX_SIZE];
        let frame_len = tokio::select! {
            _ = cancel.cancelled() => {
                info!("rtu server stopping");
                return;
            }
            result = read_rtu_request(&mut stream, &mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        info!("rtu server stopping (stream closed)");
                        return;
                    }
                    warn!("error reading frame: {e}");
                    continue;
                }
            },
        };
        let adu = &buf[..frame_len];
        debug!("rtu server received: {}", format_hex(adu));

        let request = match framer.decode(adu) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("failed to decode frame: {e}");
                continue;
            }
        };

        // Slave id 0 is broadcast; anything else must match.
        if adu[0] != config.slave_id && adu[0] != 0 {
            continue;
        }

        let Some(response) = handler.handle_request(&request).await else {
            continue;
        };

        let response_adu = match framer.encode(&response) {
            Ok(adu) => adu,
            Err(e) => {
                warn!("failed to encode response: {e}");
                continue;
            }
        };

        // 3.5-character silence before the response goes out.
        sleep(turnaround_delay(config.baud_rate, adu.len())).await;

        debug!("rtu server sending: {}", format_hex(&response_adu));
        if let Err(e) = stream.write_all(&response_adu).await {
            error!("failed to write response: {e}");
            return;
        }
        let _ = stream.flush().await;
    }
}

/// Read one complete RTU request frame.
///
/// Accumulates the 4-byte minimum, then extends the target as the
/// byte-count fields of the variable-size write requests become visible.
async fn read_rtu_request<S: SerialLink>(
    stream: &mut S,
    buf: &mut [u8; RTU_MAX_SIZE],
) -> std::io::Result<usize> {
    let mut n = 0;
    loop {
        let expected = expected_request_length(&buf[..n]).min(RTU_MAX_SIZE);
        if n >= expected {
            return Ok(n);
        }
        let nn = stream.read(&mut buf[n..expected]).await?;
        if nn == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        n += nn;
    }
}

/// Expected total request size (including CRC) given the bytes read so far.
fn expected_request_length(data: &[u8]) -> usize {
    if data.len() < 2 {
        return RTU_MIN_SIZE;
    }

    match FunctionCode::from_u8(data[1]) {
        Ok(FunctionCode::WriteMultipleCoils) | Ok(FunctionCode::WriteMultipleRegisters) => {
            // Byte count sits at offset 6; until it arrives, read up to there.
            if data.len() >= 7 {
                7 + data[6] as usize + 2
            } else {
                7
            }
        }
        Ok(FunctionCode::ReadWriteMultipleRegisters) => {
            if data.len() >= 11 {
                11 + data[10] as usize + 2
            } else {
                11
            }
        }
        Ok(FunctionCode::ReadCoils)
        | Ok(FunctionCode::ReadDiscreteInputs)
        | Ok(FunctionCode::ReadHoldingRegisters)
        | Ok(FunctionCode::ReadInputRegisters)
        | Ok(FunctionCode::WriteSingleCoil)
        | Ok(FunctionCode::WriteSingleRegister) => 8,
        Ok(FunctionCode::MaskWriteRegister) => 10,
        Ok(FunctionCode::ReadFifoQueue) => 6,
        Err(_) => RTU_MAX_SIZE,
    }
}

// ============================================================================
// ASCII server
// ============================================================================

/// ASCII server configuration.
#[derive(Debug, Clone)]
pub struct AsciiServerConfig {
    pub slave_id: SlaveId,
}

impl Default for AsciiServerConfig {
    fn default() -> Self {
        Self { slave_id: 1 }
    }
}

/// Modbus ASCII server over an injected byte stream.
///
/// Broadcast requests (slave id 0) are accepted and answered as if
/// addressed, like the RTU server.
pub struct AsciiServer<S> {
    stream: Option<S>,
    handler: Arc<RequestHandler>,
    config: AsciiServerConfig,
    cancel: Option<CancellationToken>,
    serve_task: Option<JoinHandle<()>>,
}

impl<S: SerialLink + 'static> AsciiServer<S> {
    pub fn new(stream: S, datastore: Arc<DataStore>, config: AsciiServerConfig) -> Self {
        Self {
            stream: Some(stream),
            handler: Arc::new(RequestHandler::with_suppressed_timeouts(datastore)),
            config,
            cancel: None,
            serve_task: None,
        }
    }

    /// Start serving frames from the stream.
    pub fn start(&mut self) -> ModbusResult<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ModbusError::configuration("server is already running"))?;

        let cancel = CancellationToken::new();
        let handler = self.handler.clone();
        let config = self.config.clone();
        let task_cancel = cancel.clone();
        self.cancel = Some(cancel);
        self.serve_task = Some(tokio::spawn(async move {
            ascii_serve(stream, handler, config, task_cancel).await;
        }));
        Ok(())
    }

    /// Stop serving; waits at most one second for the serve task.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.serve_task.take() {
            if timeout(SERIAL_STOP_TIMEOUT, task).await.is_err() {
                warn!("ascii server stop timed out (task may still be reading)");
            }
        }
        Ok(())
    }
}

async fn ascii_serve<S: SerialLink>(
    mut stream: S,
    handler: Arc<RequestHandler>,
    config: AsciiServerConfig,
    cancel: CancellationToken,
) {
    let framer = AsciiFramer::new(config.slave_id);
    info!("ascii server listening (slave id {})", config.slave_id);

    loop {
        let adu = tokio::select! {
            _ = cancel.cancelled() => {
                info!("ascii server stopping");
                return;
            }
            result = read_ascii_request(&mut stream) => match result {
                Ok(adu) => adu,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        info!("ascii server stopping (stream closed)");
                        return;
                    }
                    warn!("error reading frame: {e}");
                    continue;
                }
            },
        };
        debug!(
            "ascii server received: {:?}",
            String::from_utf8_lossy(&adu).trim_end()
        );

        let request = match framer.decode(&adu) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("failed to decode frame: {e}");
                continue;
            }
        };

        let Ok(request_slave) = read_hex(&adu[1..]) else {
            continue;
        };
        if request_slave != config.slave_id && request_slave != 0 {
            continue;
        }

        let Some(response) = handler.handle_request(&request).await else {
            continue;
        };

        let response_adu = match framer.encode(&response) {
            Ok(adu) => adu,
            Err(e) => {
                warn!("failed to encode response: {e}");
                continue;
            }
        };

        debug!(
            "ascii server sending: {:?}",
            String::from_utf8_lossy(&response_adu).trim_end()
        );
        if let Err(e) = stream.write_all(&response_adu).await {
            error!("failed to write response: {e}");
            return;
        }
        let _ = stream.flush().await;
    }
}

/// Read one ASCII frame: skip noise until ':', then accumulate to CRLF.
async fn read_ascii_request<S: SerialLink>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == ASCII_START {
            break;
        }
    }

    let mut frame = vec![ASCII_START];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        frame.push(byte[0]);
        if frame.len() >= 2 && frame[frame.len() - 2] == b'\r' && frame[frame.len() - 1] == b'\n' {
            return Ok(frame);
        }
        if frame.len() > ASCII_MAX_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes", frame.len()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_request_length_fixed_sizes() {
        // Read and write-single requests are 8 bytes on the wire.
        assert_eq!(expected_request_length(&[0x01, 0x03, 0x00, 0x00]), 8);
        assert_eq!(expected_request_length(&[0x01, 0x05, 0x00, 0x64]), 8);
        assert_eq!(expected_request_length(&[0x01, 0x16, 0x00, 0x04]), 10);
        assert_eq!(expected_request_length(&[0x01, 0x18, 0x00, 0x00]), 6);
    }

    #[test]
    fn test_expected_request_length_variable_sizes() {
        // Write multiple registers: byte count not visible yet.
        assert_eq!(expected_request_length(&[0x01, 0x10, 0x00, 0x00]), 7);
        // Byte count 4 -> 7 header bytes + 4 data + 2 CRC.
        assert_eq!(
            expected_request_length(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04]),
            13
        );
        // Read/write multiple registers with byte count 2.
        assert_eq!(
            expected_request_length(&[
                0x01, 0x17, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x02
            ]),
            15
        );
    }

    #[test]
    fn test_expected_request_length_unknown_function() {
        assert_eq!(expected_request_length(&[0x01, 0x2B]), RTU_MAX_SIZE);
        assert_eq!(expected_request_length(&[0x01]), RTU_MIN_SIZE);
    }

    #[tokio::test]
    async fn test_tcp_server_raw_exchange() {
        let datastore = Arc::new(DataStore::new(None));
        datastore.write_single_register(0, 0x1234);

        let mut server = TcpServer::new(datastore, "127.0.0.1:0".parse().unwrap());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // ReadHoldingRegisters(0, 1), tid 0x0001, unit 1
        stream
            .write_all(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
            ])
            .await
            .unwrap();

        let mut response = [0u8; 11];
        stream.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34]
        );

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_server_rejects_double_start() {
        let datastore = Arc::new(DataStore::new(None));
        let mut server = TcpServer::new(datastore, "127.0.0.1:0".parse().unwrap());
        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rtu_server_ignores_other_slaves() {
        let (server_end, mut client_end) = tokio::io::duplex(1024);
        let datastore = Arc::new(DataStore::new(None));
        let mut server = RtuServer::new(server_end, datastore, RtuServerConfig::default());
        server.start().unwrap();

        // Request addressed to slave 9; server is slave 1 and must not answer.
        let framer = RtuFramer::new(9);
        let request = framer
            .encode(&crate::pdu::PduBuilder::build_read_request(0x03, 0, 1).unwrap())
            .unwrap();
        client_end.write_all(&request).await.unwrap();

        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_millis(200), client_end.read(&mut buf)).await;
        assert!(read.is_err(), "server must stay silent for other slaves");

        server.stop().await.unwrap();
    }
}
