//! Wire codecs for vusb-bridge
//!
//! This crate defines the two protocols the bridge translates between:
//!
//! - [`usbforward`]: the little-endian request/response protocol spoken with
//!   the guest-resident USB stub
//! - [`usbip`]: the big-endian USB/IP protocol spoken with the kernel's
//!   `vhci_hcd` driver
//!
//! The two modules share only the [`WireFormat`] trait and [`ProtocolError`];
//! each owns its byte order.
//!
//! # Example
//!
//! ```
//! use protocol::WireFormat;
//! use protocol::usbip::{OpCode, OpHeader, USBIP_VERSION};
//!
//! let header = OpHeader::new(USBIP_VERSION, OpCode::ReqDevList, 0);
//! let bytes = header.to_bytes().unwrap();
//!
//! let decoded = OpHeader::from_bytes(&bytes).unwrap();
//! assert!(decoded.validate_version().is_ok());
//! ```

pub mod codec;
pub mod error;
pub mod usbforward;
pub mod usbip;

pub use codec::WireFormat;
pub use error::{ProtocolError, Result};

#[cfg(feature = "async")]
pub use codec::{read_frame, read_payload, write_frame};
