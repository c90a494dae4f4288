//! Device pool
//!
//! Registry of the remote devices reported by the stub, keyed by
//! `(bus, dev)` and kept in insertion order. Each descriptor carries hooks
//! that route USB/IP requests for that device back to the proxy that
//! reported it. The hooks hold a non-owning handle: the reactor owns the
//! proxy and drops it on transport loss, after which every hook fails with
//! `TransportLost`.

use crate::proxy::DeviceProxy;
use bytes::Bytes;
use common::{Error, Result};
use protocol::usbforward::{DeviceInfo, InterfaceInfo};
use protocol::usbip::{BusId, SetupPacket, UsbDevice, UsbInterface};
use std::fmt;
use std::sync::{Arc, Weak};

/// `(bus, dev)` pool key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusDev {
    pub bus: u16,
    pub dev: u16,
}

impl BusDev {
    pub fn new(bus: u16, dev: u16) -> Self {
        Self { bus, dev }
    }

    /// Split a USB/IP `devid` (`bus << 16 | dev`)
    pub fn from_devid(devid: u32) -> Self {
        Self {
            bus: (devid >> 16) as u16,
            dev: (devid & 0xffff) as u16,
        }
    }

    pub fn bus_id(&self) -> BusId {
        BusId::new(u32::from(self.bus), u32::from(self.dev))
    }
}

impl fmt::Display for BusDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.dev)
    }
}

/// Per-device dispatch into the proxy that owns the device
#[derive(Clone)]
pub struct DeviceHooks {
    key: BusDev,
    proxy: Weak<DeviceProxy>,
}

impl DeviceHooks {
    pub fn new(key: BusDev, proxy: &Arc<DeviceProxy>) -> Self {
        Self {
            key,
            proxy: Arc::downgrade(proxy),
        }
    }

    fn proxy(&self) -> Result<Arc<DeviceProxy>> {
        self.proxy.upgrade().ok_or(Error::TransportLost)
    }

    pub async fn on_attach(&self) -> Result<()> {
        self.proxy()?.attach(self.key).await
    }

    pub async fn on_control_transfer(
        &self,
        setup: SetupPacket,
        timeout: u32,
        payload: Bytes,
    ) -> Result<Bytes> {
        self.proxy()?
            .control_transfer(self.key, setup, timeout, payload)
            .await
    }

    pub async fn on_data_transfer(
        &self,
        endpoint: u8,
        host_to_device: bool,
        timeout: u32,
        length: u32,
        payload: Bytes,
    ) -> Result<Bytes> {
        self.proxy()?
            .data_transfer(self.key, endpoint, host_to_device, timeout, length, payload)
            .await
    }
}

impl fmt::Debug for DeviceHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHooks")
            .field("key", &self.key)
            .field("live", &(self.proxy.strong_count() > 0))
            .finish()
    }
}

/// One remote USB device
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub bus_number: u16,
    pub dev_number: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub dev_class: u8,
    pub dev_subclass: u8,
    pub dev_protocol: u8,
    /// libusb speed code as reported by the stub
    pub speed: u8,
    pub num_configurations: u8,
    pub cur_configuration: u8,
    pub interfaces: Vec<InterfaceInfo>,
    pub hooks: DeviceHooks,
}

impl DeviceDescriptor {
    pub fn from_info(info: &DeviceInfo, interfaces: Vec<InterfaceInfo>, hooks: DeviceHooks) -> Self {
        Self {
            bus_number: u16::from(info.bus_id),
            dev_number: u16::from(info.dev_id),
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            bcd_device: info.dev_version,
            dev_class: info.dev_class,
            dev_subclass: info.dev_subclass,
            dev_protocol: info.dev_protocol,
            speed: info.speed,
            num_configurations: info.num_configurations,
            cur_configuration: info.cur_configuration,
            interfaces,
            hooks,
        }
    }

    pub fn key(&self) -> BusDev {
        BusDev::new(self.bus_number, self.dev_number)
    }

    /// The 312-byte record published in `OP_REP_DEVLIST`/`OP_REP_IMPORT`
    pub fn to_usbip_device(&self) -> UsbDevice {
        let bus_id = self.key().bus_id();
        UsbDevice {
            path: bus_id.sysfs_path(),
            busid: bus_id.to_string(),
            busnum: u32::from(self.bus_number),
            devnum: u32::from(self.dev_number),
            speed: kernel_speed(self.speed),
            id_vendor: self.vendor_id,
            id_product: self.product_id,
            bcd_device: self.bcd_device,
            device_class: self.dev_class,
            device_subclass: self.dev_subclass,
            device_protocol: self.dev_protocol,
            configuration_value: self.cur_configuration,
            num_configurations: self.num_configurations,
            num_interfaces: self.interfaces.len() as u8,
        }
    }

    pub fn to_usbip_interfaces(&self) -> Vec<UsbInterface> {
        self.interfaces
            .iter()
            .map(|i| UsbInterface {
                interface_class: i.if_class,
                interface_subclass: i.if_subclass,
                interface_protocol: i.if_protocol,
            })
            .collect()
    }
}

/// Map a libusb speed code to the kernel's `usb_device_speed`
pub fn kernel_speed(libusb_speed: u8) -> u32 {
    match libusb_speed {
        1 => 1, // USB_SPEED_LOW
        2 => 2, // USB_SPEED_FULL
        3 => 3, // USB_SPEED_HIGH
        4 => 5, // USB_SPEED_SUPER (4 is WIRELESS)
        5 => 6, // USB_SPEED_SUPER_PLUS
        _ => 2,
    }
}

/// Insertion-ordered, uniquely keyed device registry
#[derive(Debug, Default)]
pub struct DevicePool {
    devices: Vec<DeviceDescriptor>,
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; a second device with the same key is refused
    pub fn add(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        let key = descriptor.key();
        if self.lookup(key).is_some() {
            return Err(Error::DuplicateDevice {
                bus: key.bus,
                dev: key.dev,
            });
        }
        self.devices.push(descriptor);
        Ok(())
    }

    pub fn lookup(&self, key: BusDev) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.key() == key)
    }

    /// Look up by USB/IP bus-id string
    pub fn lookup_bus_id(&self, bus_id: &BusId) -> Option<&DeviceDescriptor> {
        let bus = u16::try_from(bus_id.bus).ok()?;
        let dev = u16::try_from(bus_id.dev).ok()?;
        self.lookup(BusDev::new(bus, dev))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_device_info;

    fn detached_hooks(key: BusDev) -> DeviceHooks {
        DeviceHooks {
            key,
            proxy: Weak::new(),
        }
    }

    fn descriptor(bus: u8, dev: u8) -> DeviceDescriptor {
        let (info, interfaces) = create_mock_device_info(bus, dev);
        DeviceDescriptor::from_info(
            &info,
            interfaces,
            detached_hooks(BusDev::new(bus.into(), dev.into())),
        )
    }

    #[test]
    fn test_add_and_lookup() {
        let mut pool = DevicePool::new();
        pool.add(descriptor(1, 1)).unwrap();
        pool.add(descriptor(1, 2)).unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.lookup(BusDev::new(1, 2)).unwrap().dev_number, 2);
        assert!(pool.lookup(BusDev::new(2, 1)).is_none());
    }

    #[test]
    fn test_duplicate_key_is_refused() {
        let mut pool = DevicePool::new();
        pool.add(descriptor(1, 1)).unwrap();

        let result = pool.add(descriptor(1, 1));
        assert!(matches!(result, Err(Error::DuplicateDevice { bus: 1, dev: 1 })));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_iteration_keeps_insertion_order() {
        let mut pool = DevicePool::new();
        for dev in [5, 1, 3] {
            pool.add(descriptor(1, dev)).unwrap();
        }
        let order: Vec<u16> = pool.iter().map(|d| d.dev_number).collect();
        assert_eq!(order, vec![5, 1, 3]);
    }

    #[test]
    fn test_lookup_by_bus_id() {
        let mut pool = DevicePool::new();
        pool.add(descriptor(1, 1)).unwrap();

        assert!(pool.lookup_bus_id(&"1-1".parse().unwrap()).is_some());
        assert!(pool.lookup_bus_id(&BusId::new(70_000, 1)).is_none());
    }

    #[test]
    fn test_usbip_record() {
        let record = descriptor(1, 1).to_usbip_device();
        assert_eq!(record.path, "/sys/devices/usb/vhci/1-1");
        assert_eq!(record.busid, "1-1");
        assert_eq!(record.id_vendor, 0x18d1);
        assert_eq!(record.id_product, 0x4ee7);
        assert_eq!(record.speed, 2);
        assert_eq!(record.num_interfaces, 1);

        let interfaces = descriptor(1, 1).to_usbip_interfaces();
        assert_eq!(interfaces[0].interface_class, 0xff);
        assert_eq!(interfaces[0].interface_subclass, 0x42);
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(kernel_speed(1), 1);
        assert_eq!(kernel_speed(2), 2);
        assert_eq!(kernel_speed(3), 3);
        assert_eq!(kernel_speed(4), 5);
        assert_eq!(kernel_speed(5), 6);
        assert_eq!(kernel_speed(0), 2);
    }

    #[test]
    fn test_devid_split() {
        assert_eq!(BusDev::from_devid(0x0001_0002), BusDev::new(1, 2));
        assert_eq!(BusDev::new(1, 2).to_string(), "1-2");
    }

    #[tokio::test]
    async fn test_hooks_without_proxy_report_transport_lost() {
        let hooks = detached_hooks(BusDev::new(1, 1));
        assert!(matches!(hooks.on_attach().await, Err(Error::TransportLost)));
    }
}
