//! Build Wireshark-readable pcap captures of proxied WebSocket traffic.
//!
//! A proxy sees application messages, not packets. This crate fabricates the
//! Ethernet, IPv4 and TCP headers, a TCP handshake with an HTTP upgrade, and
//! RFC 6455 frames around each message so ordinary capture tools can open the
//! session as if it had been sniffed off the wire.
//!
//! ```rust,no_run
//! use wscapture::CaptureConfig;
//! use wscapture::PcapFileWriter;
//! use wscapture::config;
//!
//! let session_id = config::new_session_id();
//! let path = config::session_file_name("logs", &session_id, 1);
//! let writer = PcapFileWriter::create(path, CaptureConfig::new("example.com", 5000, 80)).unwrap();
//! writer.write_client_to_server(br#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
//! writer.write_server_to_client(br#"{"jsonrpc":"2.0","result":"pong","id":1}"#).unwrap();
//! writer.close().unwrap();
//! ```
use std::result;

pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod pcap;
pub mod writer;

pub use config::CaptureConfig;
pub use error::WscaptureError;
pub use packet::CaptureSession;
pub use packet::Direction;
pub use pcap::PcapByteOrder;
pub use writer::PcapFileWriter;

static DEFAULT_SNAPLEN: u32 = 65535;

pub type Result<T, E = error::WscaptureError> = result::Result<T, E>;
