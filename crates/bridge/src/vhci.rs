//! Linux `vhci_hcd` controller
//!
//! Owns at most one VHCI port. Attaching a port means:
//!
//! 1. pick a free high-speed port from `status`
//! 2. connect to our own USB/IP server and import the exported bus-id
//! 3. write `"<port> <fd> <devid> <speed>"` to `attach`
//!
//! The kernel then speaks USB/IP CMD frames over the socket. Our copy of the
//! socket stays open for as long as the port is attached; the kernel drops
//! the connection on some versions if it is closed early.
//!
//! All of this is blocking sysfs and socket I/O, so it runs on a dedicated
//! supervisor thread driven by [`ControllerWorker`] commands.

use crate::config::VhciSettings;
use common::{ControllerCommand, ControllerEvent, ControllerWorker, Error, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use protocol::WireFormat;
use protocol::usbip::{
    BusId, OpCode, OpHeader, OpImportRequest, ST_OK, USBIP_VERSION, UsbDevice,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// `VDEV_ST_NULL`: the port has no device
pub const PORT_FREE: u32 = 4;

/// Directory names probed under the sysfs root, in order
const VHCI_DEVICE_NAMES: [&str; 3] = ["vhci_hcd", "vhci_hcd.0", "vhci_hcd.1"];

const IMPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Events that mean the kernel let go of the attached socket
///
/// A peer close shows up as `POLLRDHUP`. `POLLIN` is left out so CMD
/// traffic on the socket does not wake the supervisor.
fn hang_up_events() -> PollFlags {
    PollFlags::from_bits_retain(libc::POLLRDHUP)
}

/// Locate the `vhci_hcd` platform device under `sysfs_root`
pub fn find_vhci_device(sysfs_root: &Path) -> Result<PathBuf> {
    VHCI_DEVICE_NAMES
        .iter()
        .map(|name| sysfs_root.join(name))
        .find(|path| path.join("status").exists())
        .ok_or_else(|| {
            Error::VhciUnavailable(format!(
                "vhci_hcd not found under {}. Please load the kernel module: sudo modprobe vhci-hcd",
                sysfs_root.display()
            ))
        })
}

/// Which root hub a port hangs off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hub {
    High,
    Super,
}

/// One row of the `status` file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    /// `None` for the legacy layout without a hub column
    pub hub: Option<Hub>,
    pub port: u32,
    pub status: u32,
}

impl PortStatus {
    pub fn is_free(&self) -> bool {
        self.status == PORT_FREE
    }

    /// Super-speed ports never accept our high-speed attach
    pub fn is_usable(&self) -> bool {
        self.hub != Some(Hub::Super)
    }
}

/// Parse either `status` layout; rows that do not parse are skipped
///
/// ```text
/// prt sta spd bus dev socket           local_busid
/// 000 004 000 000 000 0000000000000000 0-0
///
/// hub port sta spd dev      sockfd local_busid
/// hs  0000 004 000 00000000 000000 0-0
/// ```
pub fn parse_status(content: &str) -> Vec<PortStatus> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let first = fields.next()?;
            let hub = match first {
                "hs" => Some(Hub::High),
                "ss" => Some(Hub::Super),
                _ => None,
            };
            let port = match hub {
                Some(_) => fields.next()?,
                None => first,
            };
            let status = fields.next()?;
            Some(PortStatus {
                hub,
                port: port.parse().ok()?,
                status: status.parse().ok()?,
            })
        })
        .collect()
}

/// A port the kernel accepted, with our end of its socket
#[derive(Debug)]
pub struct AttachedPort {
    pub port: u32,
    socket: TcpStream,
}

pub struct VhciController {
    path: PathBuf,
    server_addr: SocketAddr,
    bus_id: BusId,
    devid: u32,
    speed: u32,
    preferred_port: Option<u32>,
    retry_interval: Duration,
    retry_timeout: PollTimeout,
}

impl VhciController {
    /// Probe for `vhci_hcd`; `listen_addr` is the USB/IP server to hand over
    pub fn new(settings: &VhciSettings, listen_addr: SocketAddr) -> Result<Self> {
        let path = find_vhci_device(&settings.sysfs_root)?;
        info!("Found vhci_hcd at: {}", path.display());

        let retry_interval = settings.retry_interval();
        let retry_timeout = PollTimeout::try_from(retry_interval).map_err(|e| {
            Error::Config(format!(
                "vhci.retry_interval_ms {} is out of range: {}",
                settings.retry_interval_ms, e
            ))
        })?;

        let (bus, dev) = settings.device_id;
        Ok(Self {
            path,
            server_addr: connect_addr(listen_addr),
            bus_id: BusId::new(u32::from(bus), u32::from(dev)),
            devid: settings.devid(),
            speed: settings.speed,
            preferred_port: settings.preferred_port,
            retry_interval,
            retry_timeout,
        })
    }

    /// Point the import at the address the server actually bound
    pub fn set_server_addr(&mut self, addr: SocketAddr) {
        self.server_addr = connect_addr(addr);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_status(&self) -> Result<Vec<PortStatus>> {
        let content = fs::read_to_string(self.path.join("status"))?;
        Ok(parse_status(&content))
    }

    /// The preferred port if it is free, else the first free usable port
    pub fn find_free_port(&self) -> Result<u32> {
        let ports = self.read_status()?;
        let mut free = ports.iter().filter(|p| p.is_free() && p.is_usable());

        if let Some(preferred) = self.preferred_port {
            if ports
                .iter()
                .any(|p| p.port == preferred && p.is_free() && p.is_usable())
            {
                return Ok(preferred);
            }
            debug!("Preferred VHCI port {} is not available", preferred);
        }

        free.next().map(|p| p.port).ok_or(Error::NoFreeVhciPort)
    }

    /// Claim a port and hand the kernel a socket to the USB/IP server
    pub fn attach(&self) -> Result<AttachedPort> {
        let port = self.find_free_port()?;
        let mut socket = TcpStream::connect(self.server_addr)?;
        self.import(&mut socket)?;

        let line = format!(
            "{} {} {} {}\n",
            port,
            socket.as_raw_fd(),
            self.devid,
            self.speed
        );
        self.write_sysfs("attach", &line)?;

        Ok(AttachedPort { port, socket })
    }

    /// Release `port`; a port that is already free is left alone
    pub fn detach(&self, port: u32) -> Result<()> {
        if let Ok(ports) = self.read_status() {
            if ports.iter().any(|p| p.port == port && p.is_free()) {
                debug!("VHCI port {} is already free", port);
                return Ok(());
            }
        }
        self.write_sysfs("detach", &format!("{}\n", port))
    }

    /// `OP_REQ_IMPORT` over the socket before the kernel takes it over
    fn import(&self, socket: &mut TcpStream) -> Result<()> {
        let busid = self.bus_id.to_string();
        socket.set_read_timeout(Some(IMPORT_TIMEOUT))?;

        let mut request = OpHeader::new(USBIP_VERSION, OpCode::ReqImport, 0).to_bytes()?;
        request.extend_from_slice(&OpImportRequest { busid: busid.clone() }.to_bytes()?);
        socket.write_all(&request)?;

        let reply = OpHeader::read_from(socket)?;
        if reply.code != OpCode::RepImport || reply.status != ST_OK {
            return Err(Error::UnknownBusId(busid));
        }
        let device = UsbDevice::read_from(socket)?;
        trace!(
            "Imported {} ({:04x}:{:04x})",
            device.busid, device.id_vendor, device.id_product
        );

        socket.set_read_timeout(None)?;
        Ok(())
    }

    fn write_sysfs(&self, file: &str, line: &str) -> Result<()> {
        let path = self.path.join(file);
        debug!("Writing to {}: {}", path.display(), line.trim());

        let rejected = |source| Error::KernelRejected {
            path: path.display().to_string(),
            source,
        };
        let mut handle = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(rejected)?;
        handle.write_all(line.as_bytes()).map_err(rejected)?;
        handle.flush().map_err(rejected)?;
        Ok(())
    }

    /// Run the supervisor on its own thread
    pub fn spawn(self, worker: ControllerWorker) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("vhci-supervisor".to_string())
            .spawn(move || Supervisor::new(self, worker).run())?;
        Ok(handle)
    }
}

/// Loopback stand-in for a wildcard listen address
fn connect_addr(listen: SocketAddr) -> SocketAddr {
    match listen.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), listen.port())
        }
        _ => listen,
    }
}

enum PortState {
    Idle,
    /// Wants a port; retried every `retry_interval`
    Pending { failure_logged: bool },
    Attached(AttachedPort),
}

struct Supervisor {
    controller: VhciController,
    worker: ControllerWorker,
    state: PortState,
}

impl Supervisor {
    fn new(controller: VhciController, worker: ControllerWorker) -> Self {
        Self {
            controller,
            worker,
            state: PortState::Idle,
        }
    }

    fn run(mut self) {
        debug!("VHCI supervisor started");
        loop {
            let (woken, hung_up) = match self.wait() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("VHCI supervisor poll failed: {}", e);
                    break;
                }
            };

            if hung_up {
                self.on_kernel_hangup();
            }

            if woken {
                self.worker.drain_wake();
                let mut stop = false;
                while let Some(cmd) = self.worker.try_recv_command() {
                    stop |= self.handle_command(cmd);
                }
                if stop || self.worker.is_closed() {
                    self.release();
                    break;
                }
            }

            if matches!(self.state, PortState::Pending { .. }) {
                self.try_attach();
            }
        }
        debug!("VHCI supervisor stopped");
    }

    /// Sleep until a command arrives, the kernel hangs up, or a pending
    /// retry is due; returns `(woken, hung_up)`
    fn wait(&self) -> std::result::Result<(bool, bool), Errno> {
        let timeout = match self.state {
            PortState::Pending { .. } => self.controller.retry_timeout,
            _ => PollTimeout::NONE,
        };

        let mut fds = vec![PollFd::new(self.worker.wake_fd(), PollFlags::POLLIN)];
        if let PortState::Attached(attached) = &self.state {
            fds.push(PollFd::new(attached.socket.as_fd(), hang_up_events()));
        }

        poll(&mut fds, timeout)?;

        let fired = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| !r.is_empty());
        let woken = fired(&fds[0]);
        let hung_up = fds.get(1).is_some_and(fired);
        Ok((woken, hung_up))
    }

    /// Returns true when the thread should stop
    fn handle_command(&mut self, cmd: ControllerCommand) -> bool {
        trace!("VHCI supervisor command: {:?}", cmd);
        match cmd {
            ControllerCommand::Attach => {
                if matches!(self.state, PortState::Idle) {
                    self.state = PortState::Pending {
                        failure_logged: false,
                    };
                }
                false
            }
            ControllerCommand::Detach => {
                self.release();
                false
            }
            ControllerCommand::Shutdown => true,
        }
    }

    fn try_attach(&mut self) {
        match self.controller.attach() {
            Ok(attached) => {
                info!(
                    "Attached to VHCI port {} ({})",
                    attached.port,
                    self.controller.path.display()
                );
                let port = attached.port;
                self.state = PortState::Attached(attached);
                self.emit(ControllerEvent::Attached { port });
            }
            Err(e) if matches!(e, Error::NoFreeVhciPort) => {
                error!("{}", e);
                self.state = PortState::Idle;
                self.emit(ControllerEvent::NoFreePort);
            }
            Err(e) => {
                if let PortState::Pending { failure_logged } = &mut self.state {
                    if !*failure_logged {
                        warn!(
                            "VHCI attach failed, retrying every {:?}: {}",
                            self.controller.retry_interval, e
                        );
                        *failure_logged = true;
                    }
                }
            }
        }
    }

    fn on_kernel_hangup(&mut self) {
        let previous = std::mem::replace(
            &mut self.state,
            PortState::Pending {
                failure_logged: false,
            },
        );
        if let PortState::Attached(attached) = previous {
            info!("Kernel released VHCI port {}", attached.port);
            // The kernel may already have freed the port
            if let Err(e) = self.controller.detach(attached.port) {
                debug!("Detach after hang-up: {}", e);
            }
            self.emit(ControllerEvent::Detached {
                port: attached.port,
                kernel_initiated: true,
            });
        }
    }

    /// Detach whatever is attached and go idle
    fn release(&mut self) {
        let previous = std::mem::replace(&mut self.state, PortState::Idle);
        if let PortState::Attached(attached) = previous {
            match self.controller.detach(attached.port) {
                Ok(()) => info!("Detached VHCI port {}", attached.port),
                Err(e) => warn!("Failed to detach VHCI port {}: {}", attached.port, e),
            }
            self.emit(ControllerEvent::Detached {
                port: attached.port,
                kernel_initiated: false,
            });
        }
    }

    fn emit(&self, event: ControllerEvent) {
        if let Err(e) = self.worker.send_event(event) {
            debug!("Dropping controller event: {}", e);
        }
    }
}
