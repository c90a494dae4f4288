//! vusb-bridge
//!
//! Host-side bridge that exposes USB devices behind a usbforward stub to the
//! local kernel through USB/IP and `vhci_hcd`.
//!
//! ```text
//! stub <-usbforward-> transport -> DeviceProxy <- DevicePool hooks
//!                                                   ^
//! vhci_hcd <-USB/IP over TCP-> UsbIpServer ---------+
//!     ^
//!     +-- sysfs attach/detach -- VhciController (supervisor thread)
//! ```

pub mod config;
pub mod pool;
pub mod proxy;
pub mod reactor;
pub mod server;
pub mod transport;
pub mod vhci;

pub use config::BridgeConfig;
pub use pool::{BusDev, DeviceDescriptor, DeviceHooks, DevicePool};
pub use proxy::DeviceProxy;
pub use reactor::Reactor;
pub use server::{Session, UsbIpServer};
pub use transport::{Transport, TransportSource};
pub use vhci::VhciController;

use tokio::sync::watch;

/// Resolves once the flag is true or its sender is gone
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
