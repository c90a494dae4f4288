//! USB/IP wire protocol
//!
//! The protocol the Linux `vhci_hcd` driver speaks over TCP, as documented in
//! the kernel's `Documentation/usb/usbip_protocol.rst`.
//!
//! # Protocol Overview
//!
//! - All integers are big-endian (network byte order)
//! - A connection starts in the OP phase: 8-byte [`OpHeader`] messages for
//!   device listing and import
//! - After a successful import it switches to the CMD phase: every message is
//!   a 48-byte header (20-byte [`CmdHeader`] plus a 28-byte command-specific
//!   body) followed by an optional payload
//! - The 8-byte setup packet inside `CMD_SUBMIT` is copied verbatim, it keeps
//!   USB (little-endian) byte order

use crate::codec::WireFormat;
use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// USB/IP protocol version advertised in replies
pub const USBIP_VERSION: u16 = 0x0111;

/// Oldest OP-phase version accepted from a client
pub const MIN_VERSION: u16 = 0x0100;

/// Newest OP-phase version accepted from a client
pub const MAX_VERSION: u16 = 0x0111;

/// TCP port the kernel tooling expects
pub const USBIP_PORT: u16 = 3240;

/// OP reply status: success
pub const ST_OK: u32 = 0;

/// OP reply status: failure (unknown bus-id, device busy, attach refused)
pub const ST_NA: u32 = 1;

/// Prefix of the synthetic sysfs path published for exported devices
pub const SYSFS_PATH_PREFIX: &str = "/sys/devices/usb/vhci";

const PATH_FIELD_LEN: usize = 256;
const BUSID_FIELD_LEN: usize = 32;

/// OP-phase message codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ReqDevList = 0x8005,
    RepDevList = 0x0005,
    ReqImport = 0x8003,
    RepImport = 0x0003,
}

impl TryFrom<u16> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x8005 => Ok(Self::ReqDevList),
            0x0005 => Ok(Self::RepDevList),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            other => Err(ProtocolError::UnknownCommand(u32::from(other))),
        }
    }
}

/// CMD-phase message codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdCode {
    /// Submit a URB
    CmdSubmit = 0x0001,
    /// Cancel a previously submitted URB
    CmdUnlink = 0x0002,
    /// Completion of a CMD_SUBMIT
    RetSubmit = 0x0003,
    /// Completion of a CMD_UNLINK
    RetUnlink = 0x0004,
}

impl TryFrom<u32> for CmdCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x0001 => Ok(Self::CmdSubmit),
            0x0002 => Ok(Self::CmdUnlink),
            0x0003 => Ok(Self::RetSubmit),
            0x0004 => Ok(Self::RetUnlink),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Transfer direction as seen from the host
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host-to-device
    Out = 0,
    /// Device-to-host
    In = 1,
}

impl TryFrom<u32> for Direction {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }
}

/// Header of every OP-phase message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: OpCode,
    pub status: u32,
}

impl OpHeader {
    pub fn new(version: u16, code: OpCode, status: u32) -> Self {
        Self {
            version,
            code,
            status,
        }
    }

    /// Reject versions outside `MIN_VERSION..=MAX_VERSION`
    pub fn validate_version(&self) -> Result<()> {
        if (MIN_VERSION..=MAX_VERSION).contains(&self.version) {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedVersion(self.version))
        }
    }
}

impl WireFormat for OpHeader {
    const SIZE: usize = 8;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let code = OpCode::try_from(reader.read_u16::<BigEndian>()?)?;
        let status = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            code,
            status,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code as u16)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// Device count following an `OP_REP_DEVLIST` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevListCount(pub u32);

impl WireFormat for DevListCount {
    const SIZE: usize = 4;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self(reader.read_u32::<BigEndian>()?))
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.0)?;
        Ok(())
    }
}

/// A `B-D` bus-id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId {
    pub bus: u32,
    pub dev: u32,
}

impl BusId {
    pub fn new(bus: u32, dev: u32) -> Self {
        Self { bus, dev }
    }

    /// The synthetic sysfs path published in device records
    pub fn sysfs_path(&self) -> String {
        format!("{}/{}", SYSFS_PATH_PREFIX, self)
    }

    /// The `devid` used in CMD headers: `bus << 16 | dev`
    pub fn devid(&self) -> u32 {
        (self.bus << 16) | (self.dev & 0xffff)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.dev)
    }
}

impl FromStr for BusId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidBusId(s.to_string());
        let (bus, dev) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            bus: bus.parse().map_err(|_| invalid())?,
            dev: dev.parse().map_err(|_| invalid())?,
        })
    }
}

/// Body of `OP_REQ_IMPORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpImportRequest {
    /// Requested bus-id, as sent (NUL padding stripped)
    pub busid: String,
}

impl OpImportRequest {
    /// Parse the requested bus-id
    pub fn bus_id(&self) -> Result<BusId> {
        self.busid.parse()
    }
}

impl WireFormat for OpImportRequest {
    const SIZE: usize = BUSID_FIELD_LEN;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            busid: read_cstr::<_, BUSID_FIELD_LEN>(reader)?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_cstr::<_, BUSID_FIELD_LEN>(writer, &self.busid)
    }
}

/// 312-byte exported device record used by `OP_REP_DEVLIST` and
/// `OP_REP_IMPORT`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    /// Kernel `usb_device_speed` value
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl WireFormat for UsbDevice {
    const SIZE: usize = PATH_FIELD_LEN + BUSID_FIELD_LEN + 24;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            path: read_cstr::<_, PATH_FIELD_LEN>(reader)?,
            busid: read_cstr::<_, BUSID_FIELD_LEN>(reader)?,
            busnum: reader.read_u32::<BigEndian>()?,
            devnum: reader.read_u32::<BigEndian>()?,
            speed: reader.read_u32::<BigEndian>()?,
            id_vendor: reader.read_u16::<BigEndian>()?,
            id_product: reader.read_u16::<BigEndian>()?,
            bcd_device: reader.read_u16::<BigEndian>()?,
            device_class: reader.read_u8()?,
            device_subclass: reader.read_u8()?,
            device_protocol: reader.read_u8()?,
            configuration_value: reader.read_u8()?,
            num_configurations: reader.read_u8()?,
            num_interfaces: reader.read_u8()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_cstr::<_, PATH_FIELD_LEN>(writer, &self.path)?;
        write_cstr::<_, BUSID_FIELD_LEN>(writer, &self.busid)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }
}

/// Interface record following a device in `OP_REP_DEVLIST`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInterface {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl WireFormat for UsbInterface {
    const SIZE: usize = 4;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let interface_class = reader.read_u8()?;
        let interface_subclass = reader.read_u8()?;
        let interface_protocol = reader.read_u8()?;
        let _padding = reader.read_u8()?;
        Ok(Self {
            interface_class,
            interface_subclass,
            interface_protocol,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.interface_class)?;
        writer.write_u8(self.interface_subclass)?;
        writer.write_u8(self.interface_protocol)?;
        writer.write_u8(0)?;
        Ok(())
    }
}

/// Basic header shared by all CMD-phase messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub command: CmdCode,
    /// Sequence number matching requests and replies
    pub seqnum: u32,
    /// `bus << 16 | dev`; zero in replies
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
}

impl CmdHeader {
    /// Header for a reply: devid, direction and ep are zero
    pub fn reply(command: CmdCode, seqnum: u32) -> Self {
        Self {
            command,
            seqnum,
            devid: 0,
            direction: Direction::Out,
            ep: 0,
        }
    }

    pub fn bus(&self) -> u32 {
        self.devid >> 16
    }

    pub fn dev(&self) -> u32 {
        self.devid & 0xffff
    }
}

impl WireFormat for CmdHeader {
    const SIZE: usize = 20;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let command = CmdCode::try_from(reader.read_u32::<BigEndian>()?)?;
        let seqnum = reader.read_u32::<BigEndian>()?;
        let devid = reader.read_u32::<BigEndian>()?;
        let direction = Direction::try_from(reader.read_u32::<BigEndian>()?)?;
        let ep = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            command,
            seqnum,
            devid,
            direction,
            ep,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.command as u32)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction as u32)?;
        writer.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }
}

/// Size of every CMD-phase header including its command-specific body
pub const CMD_FRAME_SIZE: usize = CmdHeader::SIZE + 28;

/// Body of `CMD_SUBMIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Raw setup packet, USB byte order
    pub setup: [u8; 8],
}

impl CmdSubmit {
    /// An all-zero setup packet marks a bulk/interrupt transfer
    pub fn is_control(&self) -> bool {
        self.setup != [0u8; 8]
    }
}

impl WireFormat for CmdSubmit {
    const SIZE: usize = 28;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let transfer_flags = reader.read_u32::<BigEndian>()?;
        let transfer_buffer_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_u32::<BigEndian>()?;
        let number_of_packets = reader.read_u32::<BigEndian>()?;
        let interval = reader.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        reader.read_exact(&mut setup)?;
        Ok(Self {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)?;
        Ok(())
    }
}

/// Body of `RET_SUBMIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetSubmit {
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmit {
    pub fn success(actual_length: u32) -> Self {
        Self {
            actual_length,
            ..Default::default()
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

impl WireFormat for RetSubmit {
    const SIZE: usize = 28;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        let actual_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_u32::<BigEndian>()?;
        let number_of_packets = reader.read_u32::<BigEndian>()?;
        let error_count = reader.read_u32::<BigEndian>()?;
        let mut padding = [0u8; 8];
        reader.read_exact(&mut padding)?;
        Ok(Self {
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.error_count)?;
        writer.write_all(&[0u8; 8])?;
        Ok(())
    }
}

/// Body of `CMD_UNLINK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    /// Sequence number of the URB to cancel
    pub unlink_seqnum: u32,
}

impl WireFormat for CmdUnlink {
    const SIZE: usize = 28;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let unlink_seqnum = reader.read_u32::<BigEndian>()?;
        let mut padding = [0u8; 24];
        reader.read_exact(&mut padding)?;
        Ok(Self { unlink_seqnum })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.unlink_seqnum)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// Body of `RET_UNLINK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub status: i32,
}

impl WireFormat for RetUnlink {
    const SIZE: usize = 28;

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        let mut padding = [0u8; 24];
        reader.read_exact(&mut padding)?;
        Ok(Self { status })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// Decoded view of the 8-byte setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_raw(&self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0] = self.request_type;
        raw[1] = self.request;
        raw[2..4].copy_from_slice(&self.value.to_le_bytes());
        raw[4..6].copy_from_slice(&self.index.to_le_bytes());
        raw[6..8].copy_from_slice(&self.length.to_le_bytes());
        raw
    }
}

/// A complete `CMD_SUBMIT`: header, body, and host-to-device payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitFrame {
    pub header: CmdHeader,
    pub submit: CmdSubmit,
    /// Present only for `Direction::Out`
    pub payload: Bytes,
}

impl SubmitFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CMD_FRAME_SIZE + self.payload.len());
        self.header.write_to(&mut buf)?;
        self.submit.write_to(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let header = CmdHeader::read_from(&mut cursor)?;
        if header.command != CmdCode::CmdSubmit {
            return Err(ProtocolError::UnknownCommand(header.command as u32));
        }
        let submit = CmdSubmit::read_from(&mut cursor)?;
        let payload = if header.direction == Direction::Out {
            let len = submit.transfer_buffer_length as usize;
            if cursor.len() < len {
                return Err(ProtocolError::TruncatedFrame);
            }
            Bytes::copy_from_slice(&cursor[..len])
        } else {
            Bytes::new()
        };
        Ok(Self {
            header,
            submit,
            payload,
        })
    }
}

/// `RET_SUBMIT` header, body, and device-to-host payload as one buffer
pub fn ret_submit_frame(seqnum: u32, ret: &RetSubmit, payload: &[u8]) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(CMD_FRAME_SIZE + payload.len());
    CmdHeader::reply(CmdCode::RetSubmit, seqnum).write_to(&mut buf)?;
    ret.write_to(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(Bytes::from(buf))
}

/// `RET_UNLINK` as one buffer
pub fn ret_unlink_frame(seqnum: u32, status: i32) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(CMD_FRAME_SIZE);
    CmdHeader::reply(CmdCode::RetUnlink, seqnum).write_to(&mut buf)?;
    RetUnlink { status }.write_to(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// `OP_REP_DEVLIST` with every exported device and its interfaces
pub fn op_rep_devlist_frame(
    version: u16,
    devices: &[(UsbDevice, Vec<UsbInterface>)],
) -> Result<Bytes> {
    let mut buf = Vec::new();
    OpHeader::new(version, OpCode::RepDevList, ST_OK).write_to(&mut buf)?;
    DevListCount(devices.len() as u32).write_to(&mut buf)?;
    for (device, interfaces) in devices {
        device.write_to(&mut buf)?;
        for interface in interfaces {
            interface.write_to(&mut buf)?;
        }
    }
    Ok(Bytes::from(buf))
}

/// `OP_REP_IMPORT`; the device record is sent only on success
pub fn op_rep_import_frame(version: u16, device: Option<&UsbDevice>) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(OpHeader::SIZE + UsbDevice::SIZE);
    match device {
        Some(device) => {
            OpHeader::new(version, OpCode::RepImport, ST_OK).write_to(&mut buf)?;
            device.write_to(&mut buf)?;
        }
        None => {
            OpHeader::new(version, OpCode::RepImport, ST_NA).write_to(&mut buf)?;
        }
    }
    Ok(Bytes::from(buf))
}

fn read_cstr<R: Read, const N: usize>(reader: &mut R) -> Result<String> {
    let mut field = [0u8; N];
    reader.read_exact(&mut field)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(N);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

// Truncates to N - 1 bytes so the field stays NUL terminated
fn write_cstr<W: Write, const N: usize>(writer: &mut W, value: &str) -> Result<()> {
    let mut field = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    writer.write_all(&field)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_device() -> UsbDevice {
        let busid = BusId::new(1, 1);
        UsbDevice {
            path: busid.sysfs_path(),
            busid: busid.to_string(),
            busnum: 1,
            devnum: 1,
            speed: 2,
            id_vendor: 0x18d1,
            id_product: 0x4ee7,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }

    #[test]
    fn test_op_header_is_big_endian() {
        let header = OpHeader::new(USBIP_VERSION, OpCode::ReqDevList, 0);
        assert_eq!(header.to_bytes().unwrap(), [0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_op_header_unknown_code() {
        let bytes = [0x01, 0x11, 0x80, 0x99, 0, 0, 0, 0];
        assert!(matches!(
            OpHeader::from_bytes(&bytes),
            Err(ProtocolError::UnknownCommand(0x8099))
        ));
    }

    #[test]
    fn test_version_range() {
        assert!(OpHeader::new(0x0111, OpCode::ReqImport, 0).validate_version().is_ok());
        assert!(OpHeader::new(0x0100, OpCode::ReqImport, 0).validate_version().is_ok());
        assert!(matches!(
            OpHeader::new(0x0200, OpCode::ReqImport, 0).validate_version(),
            Err(ProtocolError::UnsupportedVersion(0x0200))
        ));
        assert!(OpHeader::new(0x00ff, OpCode::ReqImport, 0).validate_version().is_err());
    }

    #[test]
    fn test_bus_id_parse_and_display() {
        let id: BusId = "1-1".parse().unwrap();
        assert_eq!(id, BusId::new(1, 1));
        assert_eq!(id.to_string(), "1-1");
        assert_eq!(id.sysfs_path(), "/sys/devices/usb/vhci/1-1");
        assert_eq!(id.devid(), 0x0001_0001);

        assert!("1".parse::<BusId>().is_err());
        assert!("a-1".parse::<BusId>().is_err());
        assert!("1-".parse::<BusId>().is_err());
    }

    #[test]
    fn test_usb_device_record_layout() {
        let bytes = s1_device().to_bytes().unwrap();
        assert_eq!(bytes.len(), 312);
        assert!(bytes.starts_with(b"/sys/devices/usb/vhci/1-1\0"));
        assert_eq!(&bytes[256..260], b"1-1\0");
        // busnum, devnum, speed
        assert_eq!(&bytes[288..300], &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&bytes[300..302], &[0x18, 0xd1]);
        assert_eq!(bytes[311], 1);
        assert_eq!(UsbDevice::from_bytes(&bytes).unwrap(), s1_device());
    }

    #[test]
    fn test_import_request_strips_padding() {
        let mut bytes = [0u8; 32];
        bytes[..3].copy_from_slice(b"1-1");
        let req = OpImportRequest::from_bytes(&bytes).unwrap();
        assert_eq!(req.busid, "1-1");
        assert_eq!(req.bus_id().unwrap(), BusId::new(1, 1));
    }

    #[test]
    fn test_oversized_string_field_is_truncated() {
        let req = OpImportRequest {
            busid: "x".repeat(64),
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[31], 0);
    }

    #[test]
    fn test_cmd_header_devid_split() {
        let header = CmdHeader {
            command: CmdCode::CmdSubmit,
            seqnum: 7,
            devid: 0x0003_0002,
            direction: Direction::In,
            ep: 1,
        };
        assert_eq!(header.bus(), 3);
        assert_eq!(header.dev(), 2);
        assert_eq!(
            header.to_bytes().unwrap(),
            [0, 0, 0, 1, 0, 0, 0, 7, 0, 3, 0, 2, 0, 0, 0, 1, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_cmd_header_rejects_bad_direction() {
        let mut bytes = CmdHeader::reply(CmdCode::CmdSubmit, 1).to_bytes().unwrap();
        bytes[15] = 2;
        assert!(matches!(
            CmdHeader::from_bytes(&bytes),
            Err(ProtocolError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_setup_packet_is_not_swapped() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let raw = setup.to_raw();
        assert_eq!(raw, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

        let submit = CmdSubmit {
            transfer_buffer_length: 18,
            setup: raw,
            ..Default::default()
        };
        let bytes = submit.to_bytes().unwrap();
        assert_eq!(&bytes[20..28], &raw);
        assert!(submit.is_control());
        assert_eq!(SetupPacket::parse(&raw), setup);
    }

    #[test]
    fn test_zero_setup_is_data_transfer() {
        assert!(!CmdSubmit::default().is_control());
    }

    #[test]
    fn test_submit_frame_reads_payload_only_for_out() {
        let frame = SubmitFrame {
            header: CmdHeader {
                command: CmdCode::CmdSubmit,
                seqnum: 1,
                devid: BusId::new(1, 1).devid(),
                direction: Direction::Out,
                ep: 2,
            },
            submit: CmdSubmit {
                transfer_buffer_length: 5,
                ..Default::default()
            },
            payload: Bytes::from_static(b"hello"),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), CMD_FRAME_SIZE + 5);
        assert_eq!(SubmitFrame::decode(&bytes).unwrap(), frame);

        let short = &bytes[..bytes.len() - 1];
        assert!(matches!(
            SubmitFrame::decode(short),
            Err(ProtocolError::TruncatedFrame)
        ));
    }

    #[test]
    fn test_ret_submit_frame() {
        let payload = [0x12, 0x01, 0x00, 0x02];
        let frame = ret_submit_frame(9, &RetSubmit::success(4), &payload).unwrap();
        assert_eq!(frame.len(), CMD_FRAME_SIZE + 4);

        let mut cursor = &frame[..];
        let header = CmdHeader::read_from(&mut cursor).unwrap();
        assert_eq!(header, CmdHeader::reply(CmdCode::RetSubmit, 9));
        let ret = RetSubmit::read_from(&mut cursor).unwrap();
        assert_eq!(ret.actual_length, 4);
        assert_eq!(cursor, &payload);
    }

    #[test]
    fn test_ret_unlink_frame() {
        let frame = ret_unlink_frame(42, 1).unwrap();
        assert_eq!(frame.len(), CMD_FRAME_SIZE);
        assert_eq!(&frame[0..8], &[0, 0, 0, 4, 0, 0, 0, 42]);
        assert_eq!(&frame[20..24], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_devlist_reply_layout() {
        let iface = UsbInterface {
            interface_class: 0xff,
            interface_subclass: 0x42,
            interface_protocol: 1,
        };
        let frame = op_rep_devlist_frame(USBIP_VERSION, &[(s1_device(), vec![iface])]).unwrap();
        assert_eq!(frame.len(), 8 + 4 + 312 + 4);
        assert_eq!(&frame[8..12], &[0, 0, 0, 1]);
        assert_eq!(&frame[324..], &[0xff, 0x42, 0x01, 0x00]);
    }

    #[test]
    fn test_import_reply_failure_has_no_record() {
        let frame = op_rep_import_frame(USBIP_VERSION, None).unwrap();
        assert_eq!(frame.len(), OpHeader::SIZE);
        let header = OpHeader::from_bytes(&frame).unwrap();
        assert_eq!(header.status, ST_NA);

        let frame = op_rep_import_frame(USBIP_VERSION, Some(&s1_device())).unwrap();
        assert_eq!(frame.len(), OpHeader::SIZE + UsbDevice::SIZE);
    }
}
