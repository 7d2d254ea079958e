//! Core error types and result handling.
//!
//! The error taxonomy distinguishes local argument problems (caught before
//! any byte hits the wire), framing violations, well-formed exception
//! responses from the peer, and transport failures. Exception responses are
//! deliberately *not* transport errors: a device saying "no" is a valid
//! protocol outcome and callers need to tell it apart from a broken pipe.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// All error conditions surfaced by the client, framers, transports and
/// server components.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Caller-supplied quantity outside the range allowed for the function
    /// code. Raised before any network activity.
    #[error("invalid quantity: {message}")]
    InvalidQuantity { message: String },

    /// Caller-supplied argument malformed (e.g. a WriteSingleCoil value
    /// that is neither 0x0000 nor 0xFF00). Raised before any network
    /// activity.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Response frame too small to be well-formed.
    #[error("short frame: {message}")]
    ShortFrame { message: String },

    /// Framer invariant violated: CRC/LRC mismatch, transaction or unit id
    /// mismatch, bad length field, missing start/end markers.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Frame parsed but echo fields or byte counts disagree with the
    /// request.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Well-formed exception response from the peer. Carries the peer's
    /// exception code unchanged.
    #[error("modbus exception 0x{exception_code:02X} ({}), function 0x{function_code:02X}", exception_text(.exception_code))]
    Exception {
        function_code: u8,
        exception_code: u8,
    },

    /// I/O failure on the underlying connection: dial, write, read or
    /// close, with the cause chained.
    #[error("transport: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A read or write exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The cancellation signal was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value (bad address string, out-of-range
    /// parameter).
    #[error("configuration: {message}")]
    Configuration { message: String },

    /// Wrapper adding the client operation name, e.g.
    /// "reading holding registers: protocol error: ...".
    #[error("{operation}: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<ModbusError>,
    },
}

fn exception_text(code: &u8) -> &'static str {
    match ModbusException::from_u8(*code) {
        Some(exc) => exc.name(),
        None => "unknown exception",
    }
}

impl ModbusError {
    pub fn invalid_quantity(message: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn short_frame(message: impl Into<String>) -> Self {
        Self::ShortFrame {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    pub fn exception(function_code: u8, exception_code: u8) -> Self {
        Self::Exception {
            function_code,
            exception_code,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap this error with the name of the client operation it occurred in.
    pub fn context(self, operation: &'static str) -> Self {
        Self::Operation {
            operation,
            source: Box::new(self),
        }
    }

    /// Strip any operation-context wrappers.
    pub fn root_cause(&self) -> &ModbusError {
        match self {
            Self::Operation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the `(function_code, exception_code)` pair if the root cause
    /// is an exception response from the peer.
    pub fn as_exception(&self) -> Option<(u8, u8)> {
        match self.root_cause() {
            Self::Exception {
                function_code,
                exception_code,
            } => Some((*function_code, *exception_code)),
            _ => None,
        }
    }

    /// True if the root cause is an observed cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }

    /// True if the root cause is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout(_))
    }
}
