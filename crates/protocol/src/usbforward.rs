//! usbforward wire protocol
//!
//! Request/response protocol spoken with the guest-resident USB stub over
//! the transport byte stream.
//!
//! # Protocol Overview
//!
//! - All integers are little-endian; structures are packed (no padding)
//! - Every request starts with a [`RequestHeader`], every response with a
//!   [`ResponseHeader`]; the `tag` correlates the two
//! - Responses may arrive in any order
//!
//! ```text
//! DeviceList       -> ResponseHeader, u32 count, count x (DeviceInfo, num_interfaces x InterfaceInfo)
//! Attach           -> ResponseHeader
//! ControlTransfer  -> ResponseHeader [, u32 actual_length, bytes]   (trailer on d2h success only)
//! DataTransfer     -> ResponseHeader [, u32 actual_length, bytes]   (trailer on d2h success only)
//! Heartbeat        -> ResponseHeader
//! ```
//!
//! Host-to-device payloads follow the `ControlTransfer`/`DataTransfer`
//! request structure directly.

use crate::codec::WireFormat;
use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Response status reported by the stub on success
pub const STATUS_SUCCESS: u32 = 0;

/// Response status reported by the stub on failure
pub const STATUS_FAILURE: u32 = 1;

/// usbforward command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Enumerate devices exported by the stub
    DeviceList = 0xcfad_0001,
    /// Claim a device for forwarding
    Attach = 0xcfad_0002,
    /// Control transfer on endpoint 0
    ControlTransfer = 0xcfad_0003,
    /// Bulk or interrupt transfer
    DataTransfer = 0xcfad_0004,
    /// Liveness probe
    Heartbeat = 0xcfad_0005,
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0xcfad_0001 => Ok(Self::DeviceList),
            0xcfad_0002 => Ok(Self::Attach),
            0xcfad_0003 => Ok(Self::ControlTransfer),
            0xcfad_0004 => Ok(Self::DataTransfer),
            0xcfad_0005 => Ok(Self::Heartbeat),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Header preceding every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    pub tag: u32,
}

impl WireFormat for RequestHeader {
    const SIZE: usize = 8;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let command = Command::try_from(reader.read_u32::<LittleEndian>()?)?;
        let tag = reader.read_u32::<LittleEndian>()?;
        Ok(Self { command, tag })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.command as u32)?;
        writer.write_u32::<LittleEndian>(self.tag)?;
        Ok(())
    }
}

/// Header preceding every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// 0 = success
    pub status: u32,
    pub tag: u32,
}

impl ResponseHeader {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

impl WireFormat for ResponseHeader {
    const SIZE: usize = 8;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_u32::<LittleEndian>()?;
        let tag = reader.read_u32::<LittleEndian>()?;
        Ok(Self { status, tag })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.status)?;
        writer.write_u32::<LittleEndian>(self.tag)?;
        Ok(())
    }
}

/// A bare little-endian `u32`: the device count of a `DeviceList` response
/// and the `actual_length` of a device-to-host transfer trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Length(pub u32);

impl WireFormat for Length {
    const SIZE: usize = 4;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self(reader.read_u32::<LittleEndian>()?))
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.0)?;
        Ok(())
    }
}

/// Device description reported by `DeviceList`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub dev_version: u16,
    pub dev_class: u8,
    pub dev_subclass: u8,
    pub dev_protocol: u8,
    pub bus_id: u8,
    pub dev_id: u8,
    /// libusb speed code (0 unknown, 1 low, 2 full, 3 high, 4 super, 5 super-plus)
    pub speed: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub cur_configuration: u8,
}

impl WireFormat for DeviceInfo {
    const SIZE: usize = 15;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            vendor_id: reader.read_u16::<LittleEndian>()?,
            product_id: reader.read_u16::<LittleEndian>()?,
            dev_version: reader.read_u16::<LittleEndian>()?,
            dev_class: reader.read_u8()?,
            dev_subclass: reader.read_u8()?,
            dev_protocol: reader.read_u8()?,
            bus_id: reader.read_u8()?,
            dev_id: reader.read_u8()?,
            speed: reader.read_u8()?,
            num_configurations: reader.read_u8()?,
            num_interfaces: reader.read_u8()?,
            cur_configuration: reader.read_u8()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.vendor_id)?;
        writer.write_u16::<LittleEndian>(self.product_id)?;
        writer.write_u16::<LittleEndian>(self.dev_version)?;
        writer.write_u8(self.dev_class)?;
        writer.write_u8(self.dev_subclass)?;
        writer.write_u8(self.dev_protocol)?;
        writer.write_u8(self.bus_id)?;
        writer.write_u8(self.dev_id)?;
        writer.write_u8(self.speed)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        writer.write_u8(self.cur_configuration)?;
        Ok(())
    }
}

/// One interface (alternate setting) of a listed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceInfo {
    pub if_class: u8,
    pub if_subclass: u8,
    pub if_protocol: u8,
}

impl WireFormat for InterfaceInfo {
    const SIZE: usize = 4;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let if_class = reader.read_u8()?;
        let if_subclass = reader.read_u8()?;
        let if_protocol = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        Ok(Self {
            if_class,
            if_subclass,
            if_protocol,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.if_class)?;
        writer.write_u8(self.if_subclass)?;
        writer.write_u8(self.if_protocol)?;
        writer.write_u8(0)?;
        Ok(())
    }
}

/// Body of an `Attach` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachRequest {
    pub bus_id: u8,
    pub dev_id: u8,
}

impl WireFormat for AttachRequest {
    const SIZE: usize = 2;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            bus_id: reader.read_u8()?,
            dev_id: reader.read_u8()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.bus_id)?;
        writer.write_u8(self.dev_id)?;
        Ok(())
    }
}

/// Body of a `ControlTransfer` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTransfer {
    pub bus_id: u8,
    pub dev_id: u8,
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Milliseconds, enforced by the stub
    pub timeout: u32,
}

impl ControlTransfer {
    /// Bit 7 of bmRequestType selects device-to-host
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

impl WireFormat for ControlTransfer {
    const SIZE: usize = 14;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            bus_id: reader.read_u8()?,
            dev_id: reader.read_u8()?,
            request_type: reader.read_u8()?,
            request: reader.read_u8()?,
            value: reader.read_u16::<LittleEndian>()?,
            index: reader.read_u16::<LittleEndian>()?,
            length: reader.read_u16::<LittleEndian>()?,
            timeout: reader.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.bus_id)?;
        writer.write_u8(self.dev_id)?;
        writer.write_u8(self.request_type)?;
        writer.write_u8(self.request)?;
        writer.write_u16::<LittleEndian>(self.value)?;
        writer.write_u16::<LittleEndian>(self.index)?;
        writer.write_u16::<LittleEndian>(self.length)?;
        writer.write_u32::<LittleEndian>(self.timeout)?;
        Ok(())
    }
}

/// Body of a `DataTransfer` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransfer {
    pub bus_id: u8,
    pub dev_id: u8,
    pub endpoint_id: u8,
    pub is_host_to_device: bool,
    pub length: u32,
    /// Milliseconds, enforced by the stub
    pub timeout: u32,
}

impl WireFormat for DataTransfer {
    const SIZE: usize = 12;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            bus_id: reader.read_u8()?,
            dev_id: reader.read_u8()?,
            endpoint_id: reader.read_u8()?,
            is_host_to_device: reader.read_u8()? != 0,
            length: reader.read_u32::<LittleEndian>()?,
            timeout: reader.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.bus_id)?;
        writer.write_u8(self.dev_id)?;
        writer.write_u8(self.endpoint_id)?;
        writer.write_u8(u8::from(self.is_host_to_device))?;
        writer.write_u32::<LittleEndian>(self.length)?;
        writer.write_u32::<LittleEndian>(self.timeout)?;
        Ok(())
    }
}
