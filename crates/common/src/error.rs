//! Common error types

use nix::errno::Errno;
use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The usbforward transport failed or reached EOF
    #[error("Transport lost")]
    TransportLost,

    #[error("Truncated frame")]
    TruncatedFrame,

    #[error("Unsupported USB/IP version: {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("Unknown bus id: {0}")]
    UnknownBusId(String),

    #[error("No free VHCI port")]
    NoFreeVhciPort,

    /// A sysfs write was refused by the kernel
    #[error("Kernel rejected {path}: {source}")]
    KernelRejected {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Cancelled")]
    Cancelled,

    /// The stub answered with a non-zero status
    #[error("Request failed with status {0}")]
    RequestFailed(u32),

    #[error("Duplicate device {bus}-{dev}")]
    DuplicateDevice { bus: u16, dev: u16 },

    #[error("VHCI unavailable: {0}")]
    VhciUnavailable(String),

    #[error("Transfer too large: {size} bytes (max: {max})")]
    TransferTooLarge { size: usize, max: usize },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::TruncatedFrame => Error::TruncatedFrame,
            ProtocolError::UnsupportedVersion(v) => Error::UnsupportedVersion(v),
            ProtocolError::TransferTooLarge { size, max } => Error::TransferTooLarge { size, max },
            ProtocolError::Io(e) => Error::Io(e),
            other => Error::Protocol(other),
        }
    }
}

impl Error {
    /// Negative errno reported to the kernel in `RET_SUBMIT.status`
    pub fn usbip_status(&self) -> i32 {
        let errno = match self {
            Error::TransportLost => Errno::ENODEV,
            Error::RequestFailed(_) => Errno::EPIPE,
            Error::Cancelled => Errno::ECONNRESET,
            Error::TransferTooLarge { .. } => Errno::EOVERFLOW,
            _ => Errno::EIO,
        };
        -(errno as i32)
    }

    /// Errors that end the process rather than one client or one cycle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoFreeVhciPort | Error::VhciUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usbip_status_mapping() {
        assert_eq!(Error::TransportLost.usbip_status(), -19);
        assert_eq!(Error::RequestFailed(1).usbip_status(), -32);
        assert_eq!(Error::Cancelled.usbip_status(), -104);
        assert_eq!(
            Error::TransferTooLarge { size: 2, max: 1 }.usbip_status(),
            -75
        );
        assert_eq!(Error::TruncatedFrame.usbip_status(), -5);
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = ProtocolError::TruncatedFrame.into();
        assert!(matches!(err, Error::TruncatedFrame));

        let err: Error = ProtocolError::UnsupportedVersion(0x0200).into();
        assert!(matches!(err, Error::UnsupportedVersion(0x0200)));

        let err: Error = ProtocolError::UnknownCommand(9).into();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownCommand(9))));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(Error::NoFreeVhciPort.is_fatal());
        assert!(Error::VhciUnavailable("missing".into()).is_fatal());
        assert!(!Error::TransportLost.is_fatal());
    }
}
