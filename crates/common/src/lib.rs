//! Common utilities for vusb-bridge
//!
//! This crate provides functionality shared across the bridge: the error
//! taxonomy, logging setup, the channel bridge between the reactor and the
//! VHCI supervisor thread, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{ControllerBridge, ControllerCommand, ControllerEvent, ControllerWorker, create_controller_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
