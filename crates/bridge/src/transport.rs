//! Byte-stream transport to the usbforward stub
//!
//! The stub is reached over a character device (virtio-serial), a unix
//! stream socket, or a descriptor inherited from the parent process. Every
//! source ends up as a non-blocking, close-on-exec descriptor driven by the
//! Tokio reactor and split into a reader half (owned by the proxy's response
//! loop) and a writer half (shared by request issuers).
//!
//! Either half marks the transport dead on the first I/O failure; from then
//! on every operation fails with [`Error::TransportLost`].

use crate::config::{TransportKind, TransportSettings};
use common::{Error, Result};
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use protocol::WireFormat;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Anything the transport can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

/// Where to (re)open the transport from on each connection cycle
#[derive(Debug)]
pub enum TransportSource {
    /// Character device, opened `O_RDWR | O_NOCTTY | O_CLOEXEC`
    Device(PathBuf),
    /// Unix stream socket
    Unix(PathBuf),
    /// Inherited descriptor; duplicated per cycle so the original stays ours
    Fd(OwnedFd),
}

impl TransportSource {
    pub fn from_settings(settings: &TransportSettings) -> Result<Self> {
        let missing = |what: &str| Error::Config(format!("transport.{} is not set", what));
        match settings.kind {
            TransportKind::Device => Ok(Self::Device(
                settings.path.clone().ok_or_else(|| missing("path"))?,
            )),
            TransportKind::Unix => Ok(Self::Unix(
                settings.path.clone().ok_or_else(|| missing("path"))?,
            )),
            TransportKind::Fd => {
                let raw: RawFd = settings.fd.ok_or_else(|| missing("fd"))?;
                // Refuse anything that is not an open descriptor before adopting it
                fcntl(raw, FcntlArg::F_GETFD).map_err(|e| {
                    Error::Config(format!("transport.fd {} is not open: {}", raw, e))
                })?;
                // SAFETY: the descriptor was handed to this process by its
                // parent, is open (checked above), and nothing else in the
                // process owns it.
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                set_cloexec(&fd)?;
                Ok(Self::Fd(fd))
            }
        }
    }

    /// Open a fresh connection to the stub
    pub async fn connect(&self) -> Result<Transport> {
        match self {
            Self::Device(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(OFlag::O_NOCTTY.bits() | OFlag::O_CLOEXEC.bits())
                    .open(path)?;
                let fd = OwnedFd::from(file);
                debug!("Opened transport device {}", path.display());
                Transport::from_fd(fd, path.display().to_string())
            }
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                debug!("Connected transport socket {}", path.display());
                Ok(Transport::new(stream, path.display().to_string()))
            }
            Self::Fd(fd) => {
                let dup = fd.try_clone()?;
                debug!(
                    "Adopted transport fd {} as {}",
                    fd.as_raw_fd(),
                    dup.as_raw_fd()
                );
                Transport::from_fd(dup, format!("fd {}", fd.as_raw_fd()))
            }
        }
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// A raw descriptor registered with the reactor
pub struct FdStream {
    inner: AsyncFd<File>,
}

impl FdStream {
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_cloexec(&fd)?;
        set_nonblocking(&fd)?;
        Ok(Self {
            inner: AsyncFd::new(File::from(fd))?,
        })
    }
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A connected transport, before it is split between reader and writers
pub struct Transport {
    pub reader: TransportReader,
    pub writer: TransportWriter,
    label: String,
}

impl Transport {
    /// Wrap any byte stream
    pub fn new<S: ByteStream + 'static>(stream: S, label: impl Into<String>) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let dead = Arc::new(AtomicBool::new(false));
        Self {
            reader: TransportReader {
                inner: read_half,
                dead: dead.clone(),
            },
            writer: TransportWriter {
                inner: write_half,
                dead,
            },
            label: label.into(),
        }
    }

    pub fn from_fd(fd: OwnedFd, label: impl Into<String>) -> Result<Self> {
        Ok(Self::new(FdStream::new(fd)?, label))
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Receiving half of the transport
pub struct TransportReader {
    inner: ReadHalf<BoxedStream>,
    dead: Arc<AtomicBool>,
}

impl TransportReader {
    /// Read one fixed-size structure
    pub async fn recv<T: WireFormat>(&mut self) -> Result<T> {
        self.check_alive()?;
        let result = protocol::read_frame(&mut self.inner).await;
        self.map_result(result)
    }

    /// Read exactly `len` payload bytes, refusing anything above `max`
    pub async fn recv_exact(&mut self, len: usize, max: usize) -> Result<bytes::Bytes> {
        self.check_alive()?;
        let result = protocol::read_payload(&mut self.inner, len, max).await;
        self.map_result(result)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_dead() {
            Err(Error::TransportLost)
        } else {
            Ok(())
        }
    }

    fn map_result<T>(&self, result: protocol::Result<T>) -> Result<T> {
        result.map_err(|e| {
            if e.is_disconnect() || matches!(e, protocol::ProtocolError::Io(_)) {
                self.dead.store(true, Ordering::Release);
                trace!("Transport read failed: {}", e);
                Error::TransportLost
            } else {
                e.into()
            }
        })
    }
}

/// Sending half of the transport
pub struct TransportWriter {
    inner: WriteHalf<BoxedStream>,
    dead: Arc<AtomicBool>,
}

impl TransportWriter {
    /// Write a complete request; partial writes are retried until done
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(Error::TransportLost);
        }
        let result = async {
            self.inner.write_all(bytes).await?;
            self.inner.flush().await
        }
        .await;
        result.map_err(|e| {
            self.dead.store(true, Ordering::Release);
            trace!("Transport write failed: {}", e);
            Error::TransportLost
        })
    }
}
