//! Fixed-size frame plumbing shared by both wire protocols
//!
//! Every usbforward and USB/IP structure has a fixed on-wire size and is
//! encoded field by field with explicit endianness. The endianness itself is
//! owned by each protocol module; this module only knows about sizes.
//!
//! # Example
//!
//! ```
//! use protocol::WireFormat;
//! use protocol::usbforward::{Command, RequestHeader};
//!
//! let header = RequestHeader { command: Command::Heartbeat, tag: 7 };
//! let bytes = header.to_bytes().unwrap();
//! assert_eq!(bytes.len(), RequestHeader::SIZE);
//!
//! let decoded = RequestHeader::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, header);
//! ```

use crate::error::{ProtocolError, Result};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use bytes::Bytes;
#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A structure with a fixed-size binary layout
pub trait WireFormat: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from a reader, consuming exactly `SIZE` bytes
    fn read_from<R: Read>(reader: &mut R) -> Result<Self>;

    /// Encode to a writer, producing exactly `SIZE` bytes
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;

    /// Encode into a freshly allocated buffer
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode from the front of a byte slice
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::TruncatedFrame);
        }
        let mut cursor = &bytes[..Self::SIZE];
        Self::read_from(&mut cursor)
    }
}

/// Async: read one fixed-size structure
///
/// `read_exact` keeps retrying short reads until the whole structure has
/// arrived; EOF in the middle surfaces as [`ProtocolError::TruncatedFrame`].
#[cfg(feature = "async")]
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: WireFormat,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; T::SIZE];
    reader.read_exact(&mut buf).await?;
    T::from_bytes(&buf)
}

/// Async: read a variable-length payload, refusing anything above `max`
///
/// The length check happens before any allocation.
#[cfg(feature = "async")]
pub async fn read_payload<R>(reader: &mut R, len: usize, max: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len > max {
        return Err(ProtocolError::TransferTooLarge { size: len, max });
    }
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Async: write one fixed-size structure
#[cfg(feature = "async")]
pub async fn write_frame<T, W>(writer: &mut W, frame: &T) -> Result<()>
where
    T: WireFormat,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.to_bytes()?).await?;
    Ok(())
}
