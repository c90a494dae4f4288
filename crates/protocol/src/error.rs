//! Codec error types

use std::io;
use thiserror::Error;

/// Wire-level errors shared by the usbforward and USB/IP codecs
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A header or payload ended before its declared size
    #[error("Truncated frame")]
    TruncatedFrame,

    /// Command or opcode not defined by the protocol
    #[error("Unknown command: {0:#010x}")]
    UnknownCommand(u32),

    /// USB/IP version outside the supported range
    #[error("Unsupported USB/IP version: {0:#06x}")]
    UnsupportedVersion(u16),

    /// Bus-id string that does not parse as `B-D`
    #[error("Invalid bus id: {0:?}")]
    InvalidBusId(String),

    /// USB/IP direction field other than OUT (0) or IN (1)
    #[error("Invalid direction: {0}")]
    InvalidDirection(u32),

    /// Declared transfer length exceeds the configured cap
    #[error("Transfer too large: {size} bytes (max: {max})")]
    TransferTooLarge { size: usize, max: usize },

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::TruncatedFrame
        } else {
            ProtocolError::Io(err)
        }
    }
}

impl ProtocolError {
    /// Whether the peer went away (EOF or a broken connection) rather than
    /// sending malformed data
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::TruncatedFrame => true,
            ProtocolError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
