//! Network transport layer for TCP and serial communication.
//!
//! A transport moves opaque ADU bytes: framing belongs to [`crate::framer`].
//! All transports share the same lifecycle contract:
//!
//! - **Exclusivity**: `send` is serialized per transport instance by an
//!   internal mutex; concurrent callers queue.
//! - **Lazy connect**: the first `send` on a disconnected transport dials;
//!   later sends reuse the connection. A failed dial surfaces the error and
//!   does not start the activity timer.
//! - **Idle close**: after a send the idle timer is re-armed (single-shot,
//!   never duplicated); when it fires it takes the mutex, re-checks
//!   `last_activity`, and closes the connection only if it is still stale.
//!   The timer holds a weak back-reference and never keeps the transport
//!   alive on its own.
//! - **Cancellation**: the token is observed before connect, after connect,
//!   after write, and during every read, so a stalling device cannot hang a
//!   caller.
//! - **Deadlines**: the configured timeout bounds each individual read and
//!   write; callers wanting a ceiling on the whole call wrap `send` in
//!   `tokio::time::timeout` or cancel the token.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::{
    ASCII_END, ASCII_MAX_SIZE, ASCII_MIN_SIZE, DEFAULT_BAUD_RATE, RTU_EXCEPTION_SIZE, RTU_MAX_SIZE,
    RTU_MIN_SIZE, SERIAL_IDLE_TIMEOUT, SERIAL_TIMEOUT, TCP_HEADER_SIZE, TCP_MAX_LENGTH,
};
use crate::error::{ModbusError, ModbusResult};
use crate::framer::calculate_response_length;
use crate::protocol::format_hex;

/// Transport layer abstraction: one deadline-bounded, cancellable
/// request/response exchange of raw ADU bytes.
pub trait Transport: Send + Sync {
    /// Send a request ADU and return the response ADU.
    fn send(
        &self,
        cancel: &CancellationToken,
        request: &[u8],
    ) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send;

    /// Close the underlying connection, if any.
    fn close(&self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Snapshot of communication statistics.
    fn stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatsCell(std::sync::Mutex<TransportStats>);

impl StatsCell {
    fn record_request(&self, bytes: usize) {
        let mut stats = self.0.lock().unwrap();
        stats.requests_sent += 1;
        stats.bytes_sent += bytes as u64;
    }

    fn record_response(&self, bytes: usize) {
        let mut stats = self.0.lock().unwrap();
        stats.responses_received += 1;
        stats.bytes_received += bytes as u64;
    }

    fn record_error(&self, error: &ModbusError) {
        let mut stats = self.0.lock().unwrap();
        stats.errors += 1;
        if error.is_timeout() {
            stats.timeouts += 1;
        }
    }

    fn snapshot(&self) -> TransportStats {
        self.0.lock().unwrap().clone()
    }
}

// ============================================================================
// Idle-close timer
// ============================================================================

/// Connection state that can be closed by the idle timer.
trait IdleClose: Send + 'static {
    fn last_activity(&self) -> Instant;
    fn close_connection(&mut self);
    fn idle_task_slot(&mut self) -> &mut Option<JoinHandle<()>>;
}

/// Arm (or re-arm) the single-shot idle timer for `inner`.
///
/// The spawned task holds only a weak reference; when it fires it takes the
/// mutex and re-checks the idle invariant before closing, so a send that
/// raced the alarm keeps its connection.
fn arm_idle_timer<I: IdleClose>(inner: &mut I, weak: Weak<Mutex<I>>, idle_timeout: Duration) {
    if idle_timeout.is_zero() {
        return;
    }
    if let Some(task) = inner.idle_task_slot().take() {
        task.abort();
    }
    let handle = tokio::spawn(async move {
        sleep(idle_timeout).await;
        let Some(strong) = weak.upgrade() else {
            return;
        };
        let mut guard = strong.lock().await;
        if guard.last_activity().elapsed() >= idle_timeout {
            debug!("closing connection due to idle timeout");
            guard.close_connection();
        }
    });
    *inner.idle_task_slot() = Some(handle);
}

/// One cancellable, deadline-bounded I/O step.
async fn io_step<T>(
    cancel: &CancellationToken,
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> ModbusResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ModbusError::Cancelled),
        result = timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ModbusError::io(operation, e)),
            Err(_) => Err(ModbusError::Timeout(limit)),
        },
    }
}

// ============================================================================
// TCP transport
// ============================================================================

struct TcpInner {
    stream: Option<TcpStream>,
    last_activity: Instant,
    idle_task: Option<JoinHandle<()>>,
}

impl IdleClose for TcpInner {
    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn close_connection(&mut self) {
        self.stream = None;
    }

    fn idle_task_slot(&mut self) -> &mut Option<JoinHandle<()>> {
        &mut self.idle_task
    }
}

/// Modbus TCP transport.
///
/// Read strategy: read exactly the 7-byte MBAP header, validate the length
/// field, then read `length - 1` body bytes. A length outside
/// `1 < length <= 254` flushes whatever stale bytes are pending and fails
/// with a protocol error so the connection can recover on the next call.
pub struct TcpTransport {
    addr: SocketAddr,
    timeout: Duration,
    idle_timeout: Duration,
    inner: Arc<Mutex<TcpInner>>,
    stats: StatsCell,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr, timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            idle_timeout,
            inner: Arc::new(Mutex::new(TcpInner {
                stream: None,
                last_activity: Instant::now(),
                idle_task: None,
            })),
            stats: StatsCell::default(),
        }
    }

    /// Remote address this transport dials.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    async fn exchange(
        &self,
        inner: &mut TcpInner,
        cancel: &CancellationToken,
        request: &[u8],
    ) -> ModbusResult<Vec<u8>> {
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::transport("connection closed"))?;

        // Leftovers from a cancelled or failed earlier exchange are drained
        // lazily here, before the next request goes out.
        flush_stale(stream);

        debug!("tcp send: {}", format_hex(request));
        self.stats.record_request(request.len());
        io_step(cancel, self.timeout, "writing request", stream.write_all(request)).await?;

        let mut data = vec![0u8; TCP_MAX_LENGTH];
        io_step(
            cancel,
            self.timeout,
            "reading response header",
            stream.read_exact(&mut data[..TCP_HEADER_SIZE]),
        )
        .await?;

        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length <= 1 {
            flush_stale(stream);
            return Err(ModbusError::protocol(format!(
                "length in response header '{length}' must not be zero"
            )));
        }
        if length > TCP_MAX_LENGTH - TCP_HEADER_SIZE + 1 {
            flush_stale(stream);
            return Err(ModbusError::protocol(format!(
                "length in response header '{length}' must not be greater than '{}'",
                TCP_MAX_LENGTH - TCP_HEADER_SIZE + 1
            )));
        }

        // The length field counts the unit id, which sits inside the header.
        let total = TCP_HEADER_SIZE + length - 1;
        io_step(
            cancel,
            self.timeout,
            "reading response body",
            stream.read_exact(&mut data[TCP_HEADER_SIZE..total]),
        )
        .await?;

        data.truncate(total);
        debug!("tcp received: {}", format_hex(&data));
        self.stats.record_response(data.len());
        Ok(data)
    }
}

/// Drain bytes that are immediately available without blocking.
fn flush_stale(stream: &mut TcpStream) {
    let mut discard = [0u8; 512];
    loop {
        match stream.try_read(&mut discard) {
            Ok(0) => break,
            Ok(n) => debug!("flushed {n} stale bytes"),
            Err(_) => break,
        }
    }
}

impl Transport for TcpTransport {
    async fn send(&self, cancel: &CancellationToken, request: &[u8]) -> ModbusResult<Vec<u8>> {
        let mut inner = self.inner.lock().await;

        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }

        if inner.stream.is_none() {
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
                result = timeout(self.timeout, TcpStream::connect(self.addr)) => match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        let err = ModbusError::io(format!("dialing {}", self.addr), e);
                        self.stats.record_error(&err);
                        return Err(err);
                    }
                    Err(_) => {
                        let err = ModbusError::Timeout(self.timeout);
                        self.stats.record_error(&err);
                        return Err(err);
                    }
                },
            };
            inner.stream = Some(stream);
        }

        inner.last_activity = Instant::now();
        arm_idle_timer(&mut *inner, Arc::downgrade(&self.inner), self.idle_timeout);

        let result = self.exchange(&mut inner, cancel, request).await;

        inner.last_activity = Instant::now();
        arm_idle_timer(&mut *inner, Arc::downgrade(&self.inner), self.idle_timeout);

        if let Err(err) = &result {
            self.stats.record_error(err);
        }
        result
    }

    async fn close(&self) -> ModbusResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        if let Some(mut stream) = inner.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

// ============================================================================
// Serial transports
// ============================================================================

/// Bidirectional byte stream usable as a serial line.
///
/// Real ports come from `tokio_serial`; tests and pseudo-terminal setups
/// inject any other duplex stream.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialLink for T {}

/// Serial line parameters shared by the RTU and ASCII transports.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::Even,
            timeout: SERIAL_TIMEOUT,
            idle_timeout: SERIAL_IDLE_TIMEOUT,
        }
    }
}

struct SerialInner {
    port: Option<Box<dyn SerialLink>>,
    last_activity: Instant,
    idle_task: Option<JoinHandle<()>>,
}

impl IdleClose for SerialInner {
    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn close_connection(&mut self) {
        self.port = None;
    }

    fn idle_task_slot(&mut self) -> &mut Option<JoinHandle<()>> {
        &mut self.idle_task
    }
}

/// Shared state and connect/teardown logic for the serial transports.
struct SerialPort {
    path: Option<String>,
    config: SerialConfig,
    inner: Arc<Mutex<SerialInner>>,
    stats: StatsCell,
}

impl SerialPort {
    fn new(path: Option<String>, port: Option<Box<dyn SerialLink>>, config: SerialConfig) -> Self {
        Self {
            path,
            config,
            inner: Arc::new(Mutex::new(SerialInner {
                port,
                last_activity: Instant::now(),
                idle_task: None,
            })),
            stats: StatsCell::default(),
        }
    }

    /// Open the port if not connected. Stream-injected transports cannot
    /// reconnect once closed.
    fn connect(&self, inner: &mut SerialInner) -> ModbusResult<()> {
        if inner.port.is_some() {
            return Ok(());
        }
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ModbusError::transport("serial port closed"))?;
        let builder = tokio_serial::new(path, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .timeout(self.config.timeout);
        let port = SerialStream::open(&builder).map_err(|e| {
            ModbusError::transport(format!("opening serial port {path}: {e}"))
        })?;
        inner.port = Some(Box::new(port));
        Ok(())
    }

    async fn close(&self) -> ModbusResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        inner.port = None;
        Ok(())
    }
}

/// Delay covering `chars` character times plus the 3.5-character inter-frame
/// silence, clamped to 750/1750 µs when the baud rate is zero or above
/// 19 200 (per the Modbus over Serial Line guide).
pub(crate) fn turnaround_delay(baud_rate: u32, chars: usize) -> Duration {
    let (character_delay, frame_delay) = if baud_rate == 0 || baud_rate > 19_200 {
        (750u64, 1750u64)
    } else {
        (
            15_000_000 / u64::from(baud_rate),
            35_000_000 / u64::from(baud_rate),
        )
    };
    Duration::from_micros(character_delay * chars as u64 + frame_delay)
}

/// Modbus RTU transport.
///
/// Read strategy: the expected response size is computed from the request
/// before the exchange. The read loop first collects the 4-byte minimum,
/// then inspects the echoed function code: a match reads up to the computed
/// total, the exception variant reads the 5-byte exception frame, anything
/// else keeps what arrived. The cancellation token is consulted on every
/// iteration, which is what keeps a partial response from hanging the call.
pub struct RtuTransport {
    port: SerialPort,
}

impl RtuTransport {
    /// Transport that lazily opens the serial device at `path`.
    pub fn new(path: &str, config: SerialConfig) -> Self {
        Self {
            port: SerialPort::new(Some(path.to_string()), None, config),
        }
    }

    /// Transport over an already-open byte stream (pseudo-terminal, test
    /// duplex). Reconnection is not available once the stream closes.
    pub fn with_port(port: impl SerialLink + 'static, config: SerialConfig) -> Self {
        Self {
            port: SerialPort::new(None, Some(Box::new(port)), config),
        }
    }
}

impl Transport for RtuTransport {
    async fn send(&self, cancel: &CancellationToken, request: &[u8]) -> ModbusResult<Vec<u8>> {
        let config = self.port.config.clone();
        let mut inner = self.port.inner.lock().await;

        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }
        if let Err(err) = self.port.connect(&mut inner) {
            self.port.stats.record_error(&err);
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }

        inner.last_activity = Instant::now();
        arm_idle_timer(
            &mut *inner,
            Arc::downgrade(&self.port.inner),
            config.idle_timeout,
        );

        let result = rtu_exchange(&mut inner, cancel, request, &config, &self.port.stats).await;

        inner.last_activity = Instant::now();
        arm_idle_timer(
            &mut *inner,
            Arc::downgrade(&self.port.inner),
            config.idle_timeout,
        );

        if let Err(err) = &result {
            self.port.stats.record_error(err);
        }
        result
    }

    async fn close(&self) -> ModbusResult<()> {
        self.port.close().await
    }

    fn stats(&self) -> TransportStats {
        self.port.stats.snapshot()
    }
}

async fn rtu_exchange(
    inner: &mut SerialInner,
    cancel: &CancellationToken,
    request: &[u8],
    config: &SerialConfig,
    stats: &StatsCell,
) -> ModbusResult<Vec<u8>> {
    if request.len() < 2 {
        return Err(ModbusError::invalid_data("request frame too short"));
    }
    let port = inner
        .port
        .as_mut()
        .ok_or_else(|| ModbusError::transport("serial port closed"))?;

    debug!("rtu send: {}", format_hex(request));
    stats.record_request(request.len());
    io_step(cancel, config.timeout, "writing request", port.write_all(request)).await?;
    io_step(cancel, config.timeout, "flushing request", port.flush()).await?;

    if cancel.is_cancelled() {
        return Err(ModbusError::Cancelled);
    }

    let function = request[1];
    let function_fail = request[1] | 0x80;
    let bytes_to_read = calculate_response_length(request);

    // Honor the 3.5-character silence before the device may answer.
    let delay = turnaround_delay(config.baud_rate, request.len() + bytes_to_read);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
        _ = sleep(delay) => {}
    }

    let mut data = vec![0u8; RTU_MAX_SIZE];
    let mut n = 0;

    while n < RTU_MIN_SIZE {
        let nn = io_step(cancel, config.timeout, "reading response", port.read(&mut data[n..]))
            .await?;
        if nn == 0 {
            return Err(ModbusError::transport(format!(
                "unexpected eof, got {n} bytes, expected at least {RTU_MIN_SIZE}"
            )));
        }
        n += nn;
    }

    let target = if data[1] == function {
        bytes_to_read
    } else if data[1] == function_fail {
        RTU_EXCEPTION_SIZE
    } else {
        // Unknown function echo; keep what we have and let decode complain.
        n
    };

    if target > RTU_MIN_SIZE && target <= RTU_MAX_SIZE {
        while n < target {
            let nn = io_step(
                cancel,
                config.timeout,
                "reading response body",
                port.read(&mut data[n..target]),
            )
            .await?;
            if nn == 0 {
                return Err(ModbusError::transport(format!(
                    "unexpected eof, got {n} bytes, expected {target}"
                )));
            }
            n += nn;
        }
    }

    data.truncate(n);
    debug!("rtu received: {}", format_hex(&data));
    stats.record_response(data.len());
    Ok(data)
}

/// Modbus ASCII transport.
///
/// Read strategy: accumulate until the buffer ends with CRLF or the
/// 513-character maximum is reached, checking the cancellation token between
/// iterations.
pub struct AsciiTransport {
    port: SerialPort,
}

impl AsciiTransport {
    /// Transport that lazily opens the serial device at `path`.
    pub fn new(path: &str, config: SerialConfig) -> Self {
        Self {
            port: SerialPort::new(Some(path.to_string()), None, config),
        }
    }

    /// Transport over an already-open byte stream.
    pub fn with_port(port: impl SerialLink + 'static, config: SerialConfig) -> Self {
        Self {
            port: SerialPort::new(None, Some(Box::new(port)), config),
        }
    }
}

impl Transport for AsciiTransport {
    async fn send(&self, cancel: &CancellationToken, request: &[u8]) -> ModbusResult<Vec<u8>> {
        let config = self.port.config.clone();
        let mut inner = self.port.inner.lock().await;

        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }
        if let Err(err) = self.port.connect(&mut inner) {
            self.port.stats.record_error(&err);
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }

        inner.last_activity = Instant::now();
        arm_idle_timer(
            &mut *inner,
            Arc::downgrade(&self.port.inner),
            config.idle_timeout,
        );

        let result = ascii_exchange(&mut inner, cancel, request, &config, &self.port.stats).await;

        inner.last_activity = Instant::now();
        arm_idle_timer(
            &mut *inner,
            Arc::downgrade(&self.port.inner),
            config.idle_timeout,
        );

        if let Err(err) = &result {
            self.port.stats.record_error(err);
        }
        result
    }

    async fn close(&self) -> ModbusResult<()> {
        self.port.close().await
    }

    fn stats(&self) -> TransportStats {
        self.port.stats.snapshot()
    }
}

async fn ascii_exchange(
    inner: &mut SerialInner,
    cancel: &CancellationToken,
    request: &[u8],
    config: &SerialConfig,
    stats: &StatsCell,
) -> ModbusResult<Vec<u8>> {
    let port = inner
        .port
        .as_mut()
        .ok_or_else(|| ModbusError::transport("serial port closed"))?;

    debug!("ascii send: {:?}", String::from_utf8_lossy(request));
    stats.record_request(request.len());
    io_step(cancel, config.timeout, "writing request", port.write_all(request)).await?;
    io_step(cancel, config.timeout, "flushing request", port.flush()).await?;

    if cancel.is_cancelled() {
        return Err(ModbusError::Cancelled);
    }

    let mut data = vec![0u8; ASCII_MAX_SIZE];
    let mut length = 0;
    loop {
        let n = io_step(
            cancel,
            config.timeout,
            "reading response",
            port.read(&mut data[length..]),
        )
        .await?;
        length += n;
        if length >= ASCII_MAX_SIZE || n == 0 {
            break;
        }
        // Expect end of frame in the data received.
        if length > ASCII_MIN_SIZE && &data[length - ASCII_END.len()..length] == ASCII_END {
            break;
        }
    }

    data.truncate(length);
    debug!("ascii received: {:?}", String::from_utf8_lossy(&data));
    stats.record_response(data.len());
    Ok(data)
}
