use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WscaptureError {
    #[error("unable to open capture sink {path:?}: {source}")]
    OpenSinkError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write capture sink error")]
    IOError(#[from] std::io::Error),
    #[error("capture sink failed earlier in this session, no further records can be written")]
    SinkPoisoned,
    #[error("capture writer is already closed")]
    WriterClosed,
    #[error("unable to lock the capture session: {e}")]
    UnlockMutexError { e: String },
    #[error("get system time error")]
    SystemTimeError(#[from] std::time::SystemTimeError),
    #[error("unknown link type: {linktype}")]
    UnknownLinkType { linktype: u32 },
    #[error("invalid pcap magic number: {magic:#010x}")]
    InvalidMagicNumber { magic: u32 },
    #[error("record claims {caplen} captured bytes, limit is {limit}")]
    RecordTooLong { caplen: u32, limit: u32 },
    #[error("malformed websocket frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("segment payload of {len} bytes does not fit in an ipv4 packet")]
    PacketTooLarge { len: usize },
}
