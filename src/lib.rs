//! # Simbus - Multi-Transport Modbus Client/Server Library
//!
//! A Modbus implementation covering both sides of the wire: a client that
//! issues function-code requests and validates responses, and a server
//! (simulator) that services them from an in-memory datastore, across three
//! transport encodings:
//!
//! - **TCP** with MBAP headers and transaction-id correlation
//! - **RTU** over serial with CRC-16 framing and 3.5-character timing
//! - **ASCII** over serial with LRC framing and hex-character envelopes
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x16 | Mask Write Register | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//! | 0x18 | Read FIFO Queue | ✅ | exception |
//!
//! ## Quick Start
//!
//! ### Client
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
//!     let bytes = client.read_holding_registers(&cancel, 0, 10).await?;
//!     println!("register bytes: {bytes:02X?}");
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use simbus::{DataStore, TcpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let datastore = Arc::new(DataStore::new(None));
//!     let mut server = TcpServer::new(datastore, "127.0.0.1:502".parse()?);
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! The server supports per-address fault injection (fixed delay, jitter,
//! and — on TCP only — a probability of dropping the response entirely),
//! configured through the JSON document modeled in [`config`].

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Function codes, exception codes and packing helpers
pub mod protocol;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// CRC-16/Modbus and LRC-8 checksums
pub mod checksum;

/// MBAP, RTU and ASCII frame codecs
pub mod framer;

/// Network transport layer for TCP and serial communication
pub mod transport;

/// Modbus client implementations
pub mod client;

/// Server configuration document
pub mod config;

/// In-memory datastore with four register banks
pub mod datastore;

/// Server-side request dispatcher
pub mod handler;

/// Modbus server implementations
pub mod server;

// Re-export main types for convenience
pub use checksum::{crc16, lrc8};
pub use client::{AsciiClient, Client, RtuClient, TcpClient};
pub use config::{DataStoreConfig, DelayConfig, DelayConfigSet, RegisterType};
pub use datastore::DataStore;
pub use error::{ModbusError, ModbusResult};
pub use framer::{AsciiFramer, Framer, MbapFramer, RtuFramer};
pub use handler::RequestHandler;
pub use pdu::{ModbusPdu, PduBuilder};
pub use protocol::{FunctionCode, ModbusException, SlaveId};
pub use server::{AsciiServer, AsciiServerConfig, RtuServer, RtuServerConfig, TcpServer};
pub use transport::{
    AsciiTransport, RtuTransport, SerialConfig, SerialLink, TcpTransport, Transport,
    TransportStats,
};

// Re-export the async runtime used throughout the public API.
pub use tokio;
pub use tokio_util;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
