//! usbforward device proxy
//!
//! Issues requests to the remote stub and correlates the responses, which
//! may arrive in any order, by tag.
//!
//! # Lifecycle
//!
//! One proxy exists per transport connection. [`DeviceProxy::start`] spawns
//! the response loop; the proxy is torn down exactly once, by the first of:
//!
//! - EOF or an I/O error on the transport
//! - a response the proxy cannot account for (unknown tag, oversized
//!   trailer)
//! - a write failure or a heartbeat timeout
//! - [`DeviceProxy::shutdown`]
//!
//! Teardown completes every request still in flight (with `Cancelled` for
//! shutdown, `TransportLost` otherwise) and resolves [`DeviceProxy::closed`].
//! A fresh connection gets a fresh proxy, so tags restart from zero.
//!
//! # Writes
//!
//! Callers never touch the transport. A request is registered and its frame
//! queued in one step with no await in between; a single writer task drains
//! the queue in order. A caller that is dropped after issuing leaves a whole
//! frame on the wire and an entry that the stub's answer resolves.

use crate::pool::{BusDev, DeviceDescriptor, DeviceHooks, DevicePool};
use crate::transport::{Transport, TransportReader, TransportWriter};
use bytes::Bytes;
use common::{Error, Result};
use protocol::WireFormat;
use protocol::usbforward::{
    AttachRequest, Command, ControlTransfer, DataTransfer, DeviceInfo, InterfaceInfo, Length,
    RequestHeader, ResponseHeader,
};
use protocol::usbip::SetupPacket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Devices reported by `DeviceList`
pub type DeviceList = Vec<(DeviceInfo, Vec<InterfaceInfo>)>;

/// How to finish an in-flight request once its response arrives
enum Completion {
    DeviceList(oneshot::Sender<Result<DeviceList>>),
    Attach(oneshot::Sender<Result<()>>),
    Heartbeat(oneshot::Sender<Result<bool>>),
    Control {
        device_to_host: bool,
        requested: usize,
        tx: oneshot::Sender<Result<Bytes>>,
    },
    Data {
        device_to_host: bool,
        requested: usize,
        tx: oneshot::Sender<Result<Bytes>>,
    },
}

impl Completion {
    fn fail(self, err: Error) {
        // The waiter may have given up already
        let _ = match self {
            Completion::DeviceList(tx) => tx.send(Err(err)).map_err(drop),
            Completion::Attach(tx) => tx.send(Err(err)).map_err(drop),
            Completion::Heartbeat(tx) => tx.send(Err(err)).map_err(drop),
            Completion::Control { tx, .. } | Completion::Data { tx, .. } => {
                tx.send(Err(err)).map_err(drop)
            }
        };
    }
}

/// One outstanding usbforward command
struct InFlightRequest {
    command: Command,
    completion: Completion,
}

struct InFlightTable {
    entries: HashMap<u32, InFlightRequest>,
    open: bool,
}

/// Proxy for the devices behind one usbforward transport
pub struct DeviceProxy {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    in_flight: Mutex<InFlightTable>,
    next_tag: AtomicU32,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
    max_transfer_length: usize,
    label: String,
}

impl DeviceProxy {
    /// Take ownership of a connected transport and start the reader and
    /// writer tasks
    pub fn start(transport: Transport, max_transfer_length: usize) -> Arc<Self> {
        let label = transport.label().to_string();
        let Transport { reader, writer, .. } = transport;
        let (outgoing, queue) = mpsc::unbounded_channel();

        let proxy = Arc::new(Self {
            outgoing,
            in_flight: Mutex::new(InFlightTable {
                entries: HashMap::new(),
                open: true,
            }),
            next_tag: AtomicU32::new(0),
            closed: watch::Sender::new(false),
            tasks: Mutex::new(Vec::with_capacity(2)),
            max_transfer_length,
            label,
        });

        let reader_task = tokio::spawn(Self::run_reader(Arc::downgrade(&proxy), reader));
        let writer_task = tokio::spawn(Self::run_writer(Arc::downgrade(&proxy), writer, queue));
        lock(&proxy.tasks).extend([reader_task.abort_handle(), writer_task.abort_handle()]);

        debug!("Device proxy started on {}", proxy.label);
        proxy
    }

    /// Issue `DeviceList` and register every reported device in `pool`
    pub async fn populate(self: &Arc<Self>, pool: &mut DevicePool) -> Result<()> {
        let devices = self.device_list().await?;
        for (info, interfaces) in devices {
            let key = BusDev::new(info.bus_id.into(), info.dev_id.into());
            debug!(
                "Registering device {} ({:04x}:{:04x}, {} interfaces)",
                key,
                info.vendor_id,
                info.product_id,
                interfaces.len()
            );
            let hooks = DeviceHooks::new(key, self);
            pool.add(DeviceDescriptor::from_info(&info, interfaces, hooks))?;
        }
        info!("Stub on {} reports {} device(s)", self.label, pool.len());
        Ok(())
    }

    pub async fn device_list(&self) -> Result<DeviceList> {
        self.request(Command::DeviceList, Vec::new(), Completion::DeviceList)
            .await
    }

    /// Claim a device; on success it is live
    pub async fn attach(&self, key: BusDev) -> Result<()> {
        let (bus_id, dev_id) = wire_ids(key)?;
        let body = AttachRequest { bus_id, dev_id }.to_bytes()?;
        self.request(Command::Attach, body, Completion::Attach).await
    }

    /// Control transfer on endpoint 0
    ///
    /// For device-to-host requests `setup.length` bytes are requested and the
    /// returned bytes are the device's answer. For host-to-device requests
    /// `payload` is sent and the result is empty.
    pub async fn control_transfer(
        &self,
        key: BusDev,
        setup: SetupPacket,
        timeout: u32,
        payload: Bytes,
    ) -> Result<Bytes> {
        let (bus_id, dev_id) = wire_ids(key)?;
        let device_to_host = setup.request_type & 0x80 != 0;
        let length = if device_to_host {
            setup.length
        } else {
            u16::try_from(payload.len()).map_err(|_| Error::TransferTooLarge {
                size: payload.len(),
                max: usize::from(u16::MAX),
            })?
        };

        let xfer = ControlTransfer {
            bus_id,
            dev_id,
            request_type: setup.request_type,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
            timeout,
        };
        let mut body = xfer.to_bytes()?;
        if !device_to_host {
            body.extend_from_slice(&payload);
        }

        self.request(Command::ControlTransfer, body, |tx| Completion::Control {
            device_to_host,
            requested: usize::from(length),
            tx,
        })
        .await
    }

    /// Bulk or interrupt transfer
    ///
    /// `length` is the number of bytes requested for device-to-host
    /// transfers; host-to-device transfers send `payload` whole.
    pub async fn data_transfer(
        &self,
        key: BusDev,
        endpoint: u8,
        host_to_device: bool,
        timeout: u32,
        length: u32,
        payload: Bytes,
    ) -> Result<Bytes> {
        let (bus_id, dev_id) = wire_ids(key)?;
        let length = if host_to_device {
            u32::try_from(payload.len()).map_err(|_| Error::TransferTooLarge {
                size: payload.len(),
                max: u32::MAX as usize,
            })?
        } else {
            length
        };

        let xfer = DataTransfer {
            bus_id,
            dev_id,
            endpoint_id: endpoint,
            is_host_to_device: host_to_device,
            length,
            timeout,
        };
        let mut body = xfer.to_bytes()?;
        if host_to_device {
            body.extend_from_slice(&payload);
        }

        self.request(Command::DataTransfer, body, |tx| Completion::Data {
            device_to_host: !host_to_device,
            requested: length as usize,
            tx,
        })
        .await
    }

    /// Liveness probe; `Ok(false)` means the stub answered but is not ready
    ///
    /// No answer within `timeout` tears the transport down.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<bool> {
        let probe = self.request(Command::Heartbeat, Vec::new(), Completion::Heartbeat);
        match tokio::time::timeout(timeout, probe).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Heartbeat on {} timed out after {:?}", self.label, timeout);
                self.teardown(&Error::TransportLost);
                Err(Error::TransportLost)
            }
        }
    }

    /// Fail everything in flight with `Cancelled` and stop reading
    pub fn shutdown(&self) {
        self.teardown(&Error::Cancelled);
    }

    /// Resolves once the proxy has been torn down
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Number of requests awaiting a response
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).entries.len()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn request<T>(
        &self,
        command: Command,
        body: Vec<u8>,
        completion: impl FnOnce(oneshot::Sender<Result<T>>) -> Completion,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.issue(command, body, completion(tx))?;
        rx.await.unwrap_or(Err(Error::TransportLost))
    }

    /// Register the request and queue its frame under the table lock
    ///
    /// The entry exists before any response can arrive, and a frame is
    /// queued only with an entry to answer.
    fn issue(&self, command: Command, body: Vec<u8>, completion: Completion) -> Result<()> {
        let mut table = lock(&self.in_flight);
        if !table.open {
            completion.fail(Error::TransportLost);
            return Err(Error::TransportLost);
        }
        // Wraps freely; skip the rare tag still in use after a wrap
        let mut tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        while table.entries.contains_key(&tag) {
            tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        }

        let mut frame = RequestHeader { command, tag }.to_bytes()?;
        frame.extend_from_slice(&body);
        trace!("-> {:?} tag={} ({} bytes)", command, tag, frame.len());

        if self.outgoing.send(frame).is_err() {
            completion.fail(Error::TransportLost);
            return Err(Error::TransportLost);
        }
        table.entries.insert(
            tag,
            InFlightRequest {
                command,
                completion,
            },
        );
        Ok(())
    }

    fn teardown(&self, reason: &Error) {
        let drained: Vec<(u32, InFlightRequest)> = {
            let mut table = lock(&self.in_flight);
            if !table.open {
                return;
            }
            table.open = false;
            table.entries.drain().collect()
        };

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        match reason {
            Error::Cancelled => debug!(
                "Device proxy on {} shut down, cancelling {} request(s)",
                self.label,
                drained.len()
            ),
            _ => info!(
                "Transport {} lost ({}), failing {} request(s)",
                self.label,
                reason,
                drained.len()
            ),
        }

        for (tag, request) in drained {
            trace!("Failing {:?} tag={}", request.command, tag);
            let err = match reason {
                Error::Cancelled => Error::Cancelled,
                _ => Error::TransportLost,
            };
            request.completion.fail(err);
        }
        self.closed.send_replace(true);
    }

    async fn run_writer(
        proxy: Weak<Self>,
        mut writer: TransportWriter,
        mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = queue.recv().await {
            if writer.send(&frame).await.is_err() {
                if let Some(proxy) = proxy.upgrade() {
                    warn!("Write to {} failed", proxy.label);
                    proxy.teardown(&Error::TransportLost);
                }
                return;
            }
        }
    }

    async fn run_reader(proxy: Weak<Self>, mut reader: TransportReader) {
        let reason = loop {
            let header: ResponseHeader = match reader.recv().await {
                Ok(header) => header,
                Err(e) => break e,
            };
            let Some(live) = proxy.upgrade() else {
                return;
            };
            if let Err(e) = live.dispatch(header, &mut reader).await {
                break e;
            }
        };

        reader.mark_dead();
        if let Some(proxy) = proxy.upgrade() {
            if let Error::ProtocolViolation(msg) = &reason {
                warn!("Protocol violation on {}: {}", proxy.label, msg);
            }
            proxy.teardown(&reason);
        }
    }

    async fn dispatch(&self, header: ResponseHeader, reader: &mut TransportReader) -> Result<()> {
        let entry = lock(&self.in_flight).entries.remove(&header.tag);
        let Some(InFlightRequest {
            command,
            completion,
        }) = entry
        else {
            return Err(Error::ProtocolViolation(format!(
                "response for unknown tag {}",
                header.tag
            )));
        };
        trace!(
            "<- {:?} tag={} status={}",
            command, header.tag, header.status
        );

        let failed = || Error::RequestFailed(header.status);
        match completion {
            Completion::Attach(tx) => {
                let result = if header.is_success() { Ok(()) } else { Err(failed()) };
                let _ = tx.send(result);
                Ok(())
            }
            Completion::Heartbeat(tx) => {
                let _ = tx.send(Ok(header.is_success()));
                Ok(())
            }
            Completion::DeviceList(tx) => {
                if !header.is_success() {
                    let _ = tx.send(Err(failed()));
                    return Ok(());
                }
                deliver(tx, read_device_list(reader).await)
            }
            Completion::Control {
                device_to_host,
                requested,
                tx,
            }
            | Completion::Data {
                device_to_host,
                requested,
                tx,
            } => {
                if !header.is_success() {
                    let _ = tx.send(Err(failed()));
                    return Ok(());
                }
                if !device_to_host {
                    let _ = tx.send(Ok(Bytes::new()));
                    return Ok(());
                }
                let result = self.read_transfer_data(header.tag, requested, reader).await;
                deliver(tx, result)
            }
        }
    }

    async fn read_transfer_data(
        &self,
        tag: u32,
        requested: usize,
        reader: &mut TransportReader,
    ) -> Result<Bytes> {
        let Length(actual) = reader.recv().await?;
        let actual = actual as usize;
        if actual > requested {
            return Err(Error::ProtocolViolation(format!(
                "tag {} returned {} bytes for a {} byte request",
                tag, actual, requested
            )));
        }
        reader.recv_exact(actual, self.max_transfer_length).await
    }
}

impl Drop for DeviceProxy {
    fn drop(&mut self) {
        // The writer ends by itself once the queue is drained
        if let Some(reader) = lock(&self.tasks).first() {
            reader.abort();
        }
    }
}

async fn read_device_list(reader: &mut TransportReader) -> Result<DeviceList> {
    let Length(count) = reader.recv().await?;
    let mut devices = Vec::new();
    for _ in 0..count {
        let info: DeviceInfo = reader.recv().await?;
        let mut interfaces = Vec::with_capacity(usize::from(info.num_interfaces));
        for _ in 0..info.num_interfaces {
            interfaces.push(reader.recv::<InterfaceInfo>().await?);
        }
        devices.push((info, interfaces));
    }
    Ok(devices)
}

/// Hand a trailer-read result to its waiter; read errors also end the
/// response loop
fn deliver<T>(tx: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Ok(value) => {
            let _ = tx.send(Ok(value));
            Ok(())
        }
        Err(e) => {
            let for_waiter = match &e {
                Error::ProtocolViolation(msg) => Error::ProtocolViolation(msg.clone()),
                Error::TransferTooLarge { size, max } => Error::TransferTooLarge {
                    size: *size,
                    max: *max,
                },
                _ => Error::TransportLost,
            };
            let _ = tx.send(Err(for_waiter));
            Err(e)
        }
    }
}

fn wire_ids(key: BusDev) -> Result<(u8, u8)> {
    match (u8::try_from(key.bus), u8::try_from(key.dev)) {
        (Ok(bus), Ok(dev)) => Ok((bus, dev)),
        _ => Err(Error::UnknownBusId(key.to_string())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
