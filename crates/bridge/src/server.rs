//! USB/IP server
//!
//! Listens for USB/IP clients and translates their requests into calls on
//! the device pool's hooks. A client starts in the OP phase (device list,
//! import) and, once an import succeeds, switches to the CMD phase for the
//! rest of the connection. In practice the VHCI controller performs the
//! import and then hands the socket to the kernel, which speaks CMD only.
//!
//! Every accepted client gets a writer task that drains a FIFO of encoded
//! frames, so replies to one client never interleave. `CMD_SUBMIT`
//! completions run concurrently and queue their `RET_SUBMIT` whenever the
//! stub answers.

use crate::pool::{BusDev, DevicePool};
use crate::proxy::DeviceProxy;
use crate::wait_for_shutdown;
use bytes::Bytes;
use common::{Error, Result};
use protocol::usbip::{
    BusId, CmdCode, CmdHeader, CmdSubmit, CmdUnlink, Direction, OpCode, OpHeader,
    OpImportRequest, RetSubmit, SetupPacket, ST_NA, op_rep_devlist_frame, op_rep_import_frame,
    ret_submit_frame, ret_unlink_frame,
};
use protocol::{read_frame, read_payload};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Timeout handed to the stub for control transfers, in milliseconds
pub const CONTROL_TIMEOUT_MS: u32 = 1000;

/// The devices of one transport connection and the proxy serving them
pub struct Session {
    pub pool: DevicePool,
    pub proxy: Arc<DeviceProxy>,
}

/// `None` while no stub is connected
pub type SessionWatch = watch::Receiver<Option<Arc<Session>>>;

pub struct UsbIpServer {
    listener: TcpListener,
    sessions: SessionWatch,
    max_transfer_length: usize,
    /// Set while some client holds the exported device
    device_claimed: Arc<AtomicBool>,
}

impl UsbIpServer {
    /// Bind the listening socket with `SO_REUSEADDR`
    pub fn bind(addr: SocketAddr, sessions: SessionWatch, max_transfer_length: usize) -> Result<Self> {
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(16)?;

        info!("USB/IP server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            sessions,
            max_transfer_length,
            device_claimed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("USB/IP client connected from {}", peer);
                        let client = ClientConnection {
                            peer,
                            sessions: self.sessions.clone(),
                            max_transfer_length: self.max_transfer_length,
                            device_claimed: self.device_claimed.clone(),
                            version: None,
                        };
                        clients.spawn(client.run(stream));
                    }
                    Err(e) => warn!("Failed to accept USB/IP client: {}", e),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        clients.shutdown().await;
        info!("USB/IP server stopped");
        Ok(())
    }
}

/// Released when the client holding the exported device goes away
struct DeviceClaim(Arc<AtomicBool>);

impl DeviceClaim {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// CMD-phase state of a client that imported the device
struct Attached {
    session: Arc<Session>,
    _claim: DeviceClaim,
}

struct ClientConnection {
    peer: SocketAddr,
    sessions: SessionWatch,
    max_transfer_length: usize,
    device_claimed: Arc<AtomicBool>,
    /// Latched from the first OP header
    version: Option<u16>,
}

type FrameQueue = mpsc::UnboundedSender<Bytes>;

impl ClientConnection {
    async fn run(mut self, stream: TcpStream) {
        let peer = self.peer;
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx, peer));
        let mut completions = JoinSet::new();

        match self.serve(&mut reader, &tx, &mut completions).await {
            Err(Error::TruncatedFrame) | Err(Error::TransportLost) => {
                info!("USB/IP client {} disconnected", peer)
            }
            Err(Error::Io(e)) => info!("USB/IP client {} connection failed: {}", peer, e),
            Err(e) => warn!("Closing USB/IP client {}: {}", peer, e),
            Ok(()) => {}
        }

        // Nobody is left to read late completions; requests already issued
        // stay with the proxy until the stub answers them
        completions.abort_all();
        drop(tx);
        let _ = writer_task.await;
    }

    async fn serve(
        &mut self,
        reader: &mut OwnedReadHalf,
        tx: &FrameQueue,
        completions: &mut JoinSet<()>,
    ) -> Result<()> {
        let attached = loop {
            if let Some(attached) = self.handle_operation(reader, tx).await? {
                break attached;
            }
        };
        info!("USB/IP client {} attached", self.peer);

        loop {
            self.handle_command(reader, &attached, tx, completions).await?;
            while completions.try_join_next().is_some() {}
        }
    }

    /// One OP-phase exchange; returns the attached state after a
    /// successful import
    async fn handle_operation(
        &mut self,
        reader: &mut OwnedReadHalf,
        tx: &FrameQueue,
    ) -> Result<Option<Attached>> {
        let header: OpHeader = read_frame(reader).await?;
        trace!("{} -> {:?}", self.peer, header);

        if header.status != 0 {
            return Err(Error::ProtocolViolation(format!(
                "request status {} in OP header",
                header.status
            )));
        }

        let version = match self.version {
            None => {
                header.validate_version()?;
                self.version = Some(header.version);
                header.version
            }
            Some(latched) if latched != header.version => {
                return Err(Error::ProtocolViolation(format!(
                    "version changed from {:#06x} to {:#06x}",
                    latched, header.version
                )));
            }
            Some(latched) => latched,
        };

        match header.code {
            OpCode::ReqDevList => {
                self.reply_device_list(version, tx)?;
                Ok(None)
            }
            OpCode::ReqImport => {
                let request: OpImportRequest = read_frame(reader).await?;
                self.handle_import(version, &request, tx).await
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected operation {:?}",
                other
            ))),
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.sessions.borrow().clone()
    }

    fn reply_device_list(&self, version: u16, tx: &FrameQueue) -> Result<()> {
        let devices: Vec<_> = self
            .current_session()
            .map(|session| {
                session
                    .pool
                    .iter()
                    .map(|d| (d.to_usbip_device(), d.to_usbip_interfaces()))
                    .collect()
            })
            .unwrap_or_default();

        debug!("Listing {} device(s) to {}", devices.len(), self.peer);
        queue(tx, op_rep_devlist_frame(version, &devices)?)
    }

    async fn handle_import(
        &self,
        version: u16,
        request: &OpImportRequest,
        tx: &FrameQueue,
    ) -> Result<Option<Attached>> {
        info!("USB/IP client {} requests import of {}", self.peer, request.busid);

        match self.try_import(request).await {
            Ok((attached, record)) => {
                queue(tx, op_rep_import_frame(version, Some(&record))?)?;
                Ok(Some(attached))
            }
            Err(e) => {
                warn!("Import of {} failed: {}", request.busid, e);
                queue(tx, op_rep_import_frame(version, None)?)?;
                Ok(None)
            }
        }
    }

    async fn try_import(
        &self,
        request: &OpImportRequest,
    ) -> Result<(Attached, protocol::usbip::UsbDevice)> {
        let bus_id: BusId = request
            .bus_id()
            .map_err(|_| Error::UnknownBusId(request.busid.clone()))?;
        let session = self
            .current_session()
            .ok_or_else(|| Error::UnknownBusId(request.busid.clone()))?;
        let device = session
            .pool
            .lookup_bus_id(&bus_id)
            .ok_or_else(|| Error::UnknownBusId(request.busid.clone()))?;

        let claim = DeviceClaim::acquire(&self.device_claimed).ok_or_else(|| {
            Error::ProtocolViolation(format!("{} is already imported", request.busid))
        })?;
        device.hooks.on_attach().await?;

        let record = device.to_usbip_device();
        Ok((
            Attached {
                session: session.clone(),
                _claim: claim,
            },
            record,
        ))
    }

    async fn handle_command(
        &self,
        reader: &mut OwnedReadHalf,
        attached: &Attached,
        tx: &FrameQueue,
        completions: &mut JoinSet<()>,
    ) -> Result<()> {
        let header: CmdHeader = read_frame(reader).await?;
        match header.command {
            CmdCode::CmdSubmit => {
                self.handle_submit(reader, header, attached, tx, completions)
                    .await
            }
            CmdCode::CmdUnlink => {
                let unlink: CmdUnlink = read_frame(reader).await?;
                debug!(
                    "Unlink of seqnum {} requested by {}; in-flight URBs cannot be cancelled",
                    unlink.unlink_seqnum, self.peer
                );
                queue(tx, ret_unlink_frame(header.seqnum, ST_NA as i32)?)
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected command {:?}",
                other
            ))),
        }
    }

    async fn handle_submit(
        &self,
        reader: &mut OwnedReadHalf,
        header: CmdHeader,
        attached: &Attached,
        tx: &FrameQueue,
        completions: &mut JoinSet<()>,
    ) -> Result<()> {
        let submit: CmdSubmit = read_frame(reader).await?;
        let seqnum = header.seqnum;
        let host_to_device = header.direction == Direction::Out;
        let length = submit.transfer_buffer_length as usize;

        // The payload is consumed before anything else so the stream stays
        // framed whatever happens to the request
        let payload = if host_to_device {
            read_payload(reader, length, self.max_transfer_length).await?
        } else {
            Bytes::new()
        };
        trace!(
            "{} -> SUBMIT seqnum={} devid={:#x} ep={} {:?} len={}",
            self.peer, seqnum, header.devid, header.ep, header.direction, length
        );

        if !host_to_device && length > self.max_transfer_length {
            let err = Error::TransferTooLarge {
                size: length,
                max: self.max_transfer_length,
            };
            warn!("Refusing SUBMIT seqnum={}: {}", seqnum, err);
            return queue(tx, completion_frame(seqnum, host_to_device, 0, Err(err))?);
        }

        let key = BusDev::from_devid(header.devid);
        let Some(device) = attached.session.pool.lookup(key) else {
            warn!("SUBMIT seqnum={} for unknown device {}", seqnum, key);
            let err = Error::UnknownBusId(key.to_string());
            return queue(tx, completion_frame(seqnum, host_to_device, 0, Err(err))?);
        };

        let hooks = device.hooks.clone();
        let tx = tx.clone();
        let sent = payload.len();
        completions.spawn(async move {
            let result = if submit.is_control() {
                let setup = SetupPacket::parse(&submit.setup);
                hooks
                    .on_control_transfer(setup, CONTROL_TIMEOUT_MS, payload)
                    .await
            } else {
                hooks
                    .on_data_transfer(
                        header.ep as u8,
                        host_to_device,
                        submit.interval,
                        submit.transfer_buffer_length,
                        payload,
                    )
                    .await
            };
            if let Err(e) = &result {
                debug!("SUBMIT seqnum={} failed: {}", seqnum, e);
            }
            match completion_frame(seqnum, host_to_device, sent, result) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(e) => error!("Failed to encode RET_SUBMIT seqnum={}: {}", seqnum, e),
            }
        });
        Ok(())
    }
}

/// Encode the `RET_SUBMIT` for a finished request
///
/// Host-to-device successes report the bytes sent; device-to-host successes
/// carry the returned data. Failures carry a negative errno and no data.
fn completion_frame(
    seqnum: u32,
    host_to_device: bool,
    sent: usize,
    result: Result<Bytes>,
) -> Result<Bytes> {
    let frame = match result {
        Ok(_) if host_to_device => {
            ret_submit_frame(seqnum, &RetSubmit::success(sent as u32), &[])?
        }
        Ok(data) => ret_submit_frame(seqnum, &RetSubmit::success(data.len() as u32), &data)?,
        Err(e) => ret_submit_frame(seqnum, &RetSubmit::error(e.usbip_status()), &[])?,
    };
    Ok(frame)
}

fn queue(tx: &FrameQueue, frame: Bytes) -> Result<()> {
    tx.send(frame).map_err(|_| Error::TransportLost)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>, peer: SocketAddr) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Write to USB/IP client {} failed: {}", peer, e);
            break;
        }
    }
}
