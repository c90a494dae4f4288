//! Connection lifecycle
//!
//! The reactor runs on the current-thread Tokio runtime and owns everything
//! except the VHCI supervisor thread. It repeats one cycle for as long as
//! the process lives:
//!
//! connect transport -> `populate()` -> publish session -> VHCI attach ->
//! heartbeat until the transport dies -> withdraw session -> VHCI detach ->
//! wait `reconnect_interval`
//!
//! Fatal errors (no VHCI, no free port) end the run with `Err`; a shutdown
//! signal ends it with `Ok` after cancelling everything still in flight.

use crate::config::BridgeConfig;
use crate::pool::DevicePool;
use crate::proxy::DeviceProxy;
use crate::server::{Session, UsbIpServer};
use crate::transport::{Transport, TransportSource};
use crate::vhci::VhciController;
use crate::wait_for_shutdown;
use common::{
    ControllerBridge, ControllerCommand, ControllerEvent, Error, Result, create_controller_bridge,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

pub struct Reactor {
    config: BridgeConfig,
    source: TransportSource,
}

impl Reactor {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let source = TransportSource::from_settings(&config.transport)?;
        Ok(Self { config, source })
    }

    /// Run until `shutdown` flips to true or a fatal error occurs
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Both checks happen before the listener exists
        let mut controller = VhciController::new(&self.config.vhci, self.config.usbip.listen_addr)?;
        let port = controller.find_free_port()?;
        debug!("VHCI port {} is free", port);

        let (session_tx, session_rx) = watch::channel(None);
        let server = UsbIpServer::bind(
            self.config.usbip.listen_addr,
            session_rx,
            self.config.usbip.max_transfer_length as usize,
        )?;
        controller.set_server_addr(server.local_addr()?);

        let (server_stop_tx, server_stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(server_stop_rx));

        let (bridge, worker) = create_controller_bridge()?;
        let supervisor = controller.spawn(worker)?;

        info!("Bridge running on {}", self.source_label());

        let result = tokio::select! {
            result = self.supervise(&bridge, &session_tx) => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        if let Some(session) = session_tx.send_replace(None) {
            session.proxy.shutdown();
        }
        if let Err(e) = bridge.send_command(ControllerCommand::Shutdown).await {
            debug!("VHCI supervisor already gone: {}", e);
        }
        if !matches!(
            tokio::task::spawn_blocking(move || supervisor.join()).await,
            Ok(Ok(()))
        ) {
            warn!("VHCI supervisor did not stop cleanly");
        }

        server_stop_tx.send_replace(true);
        match server_task.await {
            Ok(Err(e)) => warn!("USB/IP server stopped with error: {}", e),
            Err(e) => warn!("USB/IP server task failed: {}", e),
            Ok(Ok(())) => {}
        }

        info!("Bridge stopped");
        result
    }

    fn source_label(&self) -> String {
        match &self.source {
            TransportSource::Device(path) => format!("device {}", path.display()),
            TransportSource::Unix(path) => format!("socket {}", path.display()),
            TransportSource::Fd(_) => "inherited fd".to_string(),
        }
    }

    /// Connection cycles; returns only on a fatal error
    async fn supervise(
        &self,
        bridge: &ControllerBridge,
        session_tx: &watch::Sender<Option<Arc<Session>>>,
    ) -> Result<()> {
        let mut connect_failure_logged = false;

        loop {
            match self.source.connect().await {
                Ok(transport) => {
                    connect_failure_logged = false;
                    match self.serve_transport(transport, bridge, session_tx).await {
                        Err(e) if e.is_fatal() || matches!(e, Error::Channel(_)) => return Err(e),
                        Err(Error::TransportLost) => info!("Transport lost, reconnecting"),
                        Err(e) => warn!("Transport cycle ended: {}", e),
                        Ok(()) => {}
                    }
                }
                Err(e) => {
                    if !connect_failure_logged {
                        warn!(
                            "Cannot reach the stub: {}, retrying every {:?}",
                            e,
                            self.config.transport.reconnect_interval()
                        );
                        connect_failure_logged = true;
                    }
                }
            }

            self.idle(bridge).await?;
        }
    }

    /// Wait out the reconnect interval while still handling controller events
    async fn idle(&self, bridge: &ControllerBridge) -> Result<()> {
        let deadline = tokio::time::sleep(self.config.transport.reconnect_interval());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                event = bridge.recv_event() => on_event(event?)?,
            }
        }
    }

    async fn serve_transport(
        &self,
        transport: Transport,
        bridge: &ControllerBridge,
        session_tx: &watch::Sender<Option<Arc<Session>>>,
    ) -> Result<()> {
        let label = transport.label().to_string();
        let proxy = DeviceProxy::start(
            transport,
            self.config.usbip.max_transfer_length as usize,
        );

        let mut pool = DevicePool::new();
        if let Err(e) = proxy.populate(&mut pool).await {
            proxy.shutdown();
            return Err(e);
        }
        if pool.is_empty() {
            warn!("Stub on {} exports no devices", label);
        }

        session_tx.send_replace(Some(Arc::new(Session {
            pool,
            proxy: proxy.clone(),
        })));
        bridge.send_command(ControllerCommand::Attach).await?;

        let result = self.watch_session(&proxy, bridge).await;

        session_tx.send_replace(None);
        proxy.shutdown();
        bridge.send_command(ControllerCommand::Detach).await?;
        info!("Session on {} ended", label);
        result
    }

    async fn watch_session(&self, proxy: &DeviceProxy, bridge: &ControllerBridge) -> Result<()> {
        let mut heartbeat = self.config.proxy.heartbeat_interval().map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let timeout = self.config.proxy.heartbeat_timeout();
        let mut not_ready_logged = false;

        loop {
            tokio::select! {
                _ = proxy.closed() => return Err(Error::TransportLost),
                _ = tick(&mut heartbeat) => match proxy.heartbeat(timeout).await {
                    Ok(true) => {
                        trace!("Heartbeat ok");
                        not_ready_logged = false;
                    }
                    Ok(false) => {
                        if !not_ready_logged {
                            warn!("Device on {} not ready", proxy.label());
                            not_ready_logged = true;
                        }
                    }
                    Err(e) => debug!("Heartbeat failed: {}", e),
                },
                event = bridge.recv_event() => on_event(event?)?,
            }
        }
    }
}

fn on_event(event: ControllerEvent) -> Result<()> {
    match event {
        ControllerEvent::Attached { port } => info!("Device exported on VHCI port {}", port),
        ControllerEvent::Detached {
            port,
            kernel_initiated: true,
        } => warn!("Kernel dropped VHCI port {}, re-attaching", port),
        ControllerEvent::Detached { port, .. } => debug!("VHCI port {} released", port),
        ControllerEvent::NoFreePort => return Err(Error::NoFreeVhciPort),
    }
    Ok(())
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_free_port_event_is_fatal() {
        let result = on_event(ControllerEvent::NoFreePort);
        assert!(matches!(result, Err(Error::NoFreeVhciPort)));
        assert!(on_event(ControllerEvent::Attached { port: 1 }).is_ok());
        assert!(
            on_event(ControllerEvent::Detached {
                port: 1,
                kernel_initiated: true
            })
            .is_ok()
        );
    }

    #[tokio::test]
    async fn test_disabled_heartbeat_never_ticks() {
        let mut heartbeat = None;
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            tick(&mut heartbeat),
        )
        .await;
        assert!(result.is_err());
    }
}
