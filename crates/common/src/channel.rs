//! Async channel bridge between the Tokio reactor and the VHCI supervisor thread
//!
//! Commands travel over a bounded `async-channel` queue. Because the
//! supervisor sleeps in `poll(2)` rather than on the channel, every command is
//! followed by a one-byte write on a `UnixStream` pair; the supervisor polls
//! the other end and drains it before looking at the queue.

use async_channel::{Receiver, Sender, bounded};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use tracing::trace;

/// Commands from the reactor to the VHCI supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    /// A session is up: claim a port and hand the kernel a socket
    Attach,
    /// The session went away: release the port
    Detach,
    /// Release the port and stop the thread
    Shutdown,
}

/// Events from the VHCI supervisor to the reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The kernel accepted the attach on `port`
    Attached { port: u32 },
    /// The port was released, either on request or by the kernel hanging up
    Detached { port: u32, kernel_initiated: bool },
    /// Every port is occupied; the process cannot continue
    NoFreePort,
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct ControllerBridge {
    cmd_tx: Sender<ControllerCommand>,
    event_rx: Receiver<ControllerEvent>,
    wake: std::sync::Arc<UnixStream>,
}

impl ControllerBridge {
    /// Send a command to the supervisor thread and wake it
    pub async fn send_command(&self, cmd: ControllerCommand) -> crate::Result<()> {
        trace!("Controller command: {:?}", cmd);
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))?;
        self.wake()
    }

    /// Receive an event from the supervisor thread
    pub async fn recv_event(&self) -> crate::Result<ControllerEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    fn wake(&self) -> crate::Result<()> {
        match (&*self.wake).write(&[1]) {
            Ok(_) => Ok(()),
            // A full socket buffer already guarantees a pending wakeup
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(crate::Error::Io(e)),
        }
    }
}

/// Handle for the supervisor thread (blocking)
pub struct ControllerWorker {
    cmd_rx: Receiver<ControllerCommand>,
    event_tx: Sender<ControllerEvent>,
    wake: UnixStream,
}

impl ControllerWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<ControllerCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every reactor-side handle has been dropped
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed() && self.cmd_rx.is_empty()
    }

    /// Send an event to the reactor (blocking)
    pub fn send_event(&self, event: ControllerEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Descriptor that becomes readable when a command was queued
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }

    /// Consume pending wake bytes
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake).read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }
}

/// Create the channel bridge between Tokio and the supervisor thread
///
/// Returns (ControllerBridge for Tokio, ControllerWorker for the thread)
pub fn create_controller_bridge() -> crate::Result<(ControllerBridge, ControllerWorker)> {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);
    let (wake_tx, wake_rx) = UnixStream::pair()?;
    wake_tx.set_nonblocking(true)?;
    wake_rx.set_nonblocking(true)?;

    Ok((
        ControllerBridge {
            cmd_tx,
            event_rx,
            wake: std::sync::Arc::new(wake_tx),
        },
        ControllerWorker {
            cmd_rx,
            event_tx,
            wake: wake_rx,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_controller_bridge().unwrap();

        let handle = std::thread::spawn(move || {
            let mut fds = [PollFd::new(worker.wake_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(2000u16)).unwrap();
            worker.drain_wake();
            let cmd = worker.try_recv_command();
            worker.send_event(ControllerEvent::Attached { port: 3 }).unwrap();
            cmd
        });

        bridge.send_command(ControllerCommand::Attach).await.unwrap();
        let event = bridge.recv_event().await.unwrap();

        assert_eq!(event, ControllerEvent::Attached { port: 3 });
        assert_eq!(handle.join().unwrap(), Some(ControllerCommand::Attach));
    }

    #[tokio::test]
    async fn test_command_wakes_poll() {
        let (bridge, worker) = create_controller_bridge().unwrap();
        bridge.send_command(ControllerCommand::Detach).await.unwrap();

        let mut fds = [PollFd::new(worker.wake_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(1000u16)).unwrap();
        assert_eq!(ready, 1);

        worker.drain_wake();
        assert_eq!(worker.try_recv_command(), Some(ControllerCommand::Detach));
        assert_eq!(worker.try_recv_command(), None);

        let mut fds = [PollFd::new(worker.wake_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, PollTimeout::ZERO).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queued_command_outlives_its_wake_byte() {
        let (bridge, worker) = create_controller_bridge().unwrap();
        bridge.send_command(ControllerCommand::Attach).await.unwrap();
        bridge.send_command(ControllerCommand::Shutdown).await.unwrap();

        // Wake bytes are coalesced; the queue keeps every command
        worker.drain_wake();
        let mut fds = [PollFd::new(worker.wake_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, PollTimeout::ZERO).unwrap(), 0);
        assert_eq!(worker.try_recv_command(), Some(ControllerCommand::Attach));
        assert_eq!(worker.try_recv_command(), Some(ControllerCommand::Shutdown));
    }

    #[test]
    fn test_worker_sees_closed_bridge() {
        let (bridge, worker) = create_controller_bridge().unwrap();
        assert!(!worker.is_closed());
        drop(bridge);
        assert!(worker.is_closed());
    }
}
