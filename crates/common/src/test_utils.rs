//! Test utilities for vusb-bridge
//!
//! Provides a scripted usbforward stub and helper constructors for testing
//! across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_info, create_mock_interface};
//!
//! let (device, interfaces) = create_mock_device_info(1, 1);
//! assert_eq!(device.vendor_id, 0x18d1);
//! assert_eq!(interfaces, vec![create_mock_interface()]);
//! ```

use bytes::Bytes;
use protocol::WireFormat;
use protocol::usbforward::{
    AttachRequest, Command, ControlTransfer, DataTransfer, DeviceInfo, InterfaceInfo, Length,
    RequestHeader, ResponseHeader, STATUS_FAILURE, STATUS_SUCCESS,
};
use protocol::{read_frame, read_payload, write_frame};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The single exported device of the enumeration scenario: 18d1:4ee7 on
/// bus `bus`, device `dev`, full speed, one vendor-specific interface
pub fn create_mock_device_info(bus: u8, dev: u8) -> (DeviceInfo, Vec<InterfaceInfo>) {
    let device = DeviceInfo {
        vendor_id: 0x18d1,
        product_id: 0x4ee7,
        dev_version: 0x0100,
        dev_class: 0,
        dev_subclass: 0,
        dev_protocol: 0,
        bus_id: bus,
        dev_id: dev,
        speed: 2,
        num_configurations: 1,
        num_interfaces: 1,
        cur_configuration: 1,
    };
    (device, vec![create_mock_interface()])
}

/// Vendor-specific interface `ff/42/01`
pub fn create_mock_interface() -> InterfaceInfo {
    InterfaceInfo {
        if_class: 0xff,
        if_subclass: 0x42,
        if_protocol: 1,
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor for 18d1:4ee7
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0xd1, 0x18, // idVendor (0x18d1)
        0xe7, 0x4e, // idProduct (0x4ee7)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create a mock control transfer setup packet
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (index & 0xFF) as u8,
        ((index >> 8) & 0xFF) as u8,
        (length & 0xFF) as u8,
        ((length >> 8) & 0xFF) as u8,
    ]
}

/// A request as received by [`MockStub`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubRequest {
    DeviceList,
    Attach(AttachRequest),
    Control(ControlTransfer, Bytes),
    Data(DataTransfer, Bytes),
    Heartbeat,
}

/// What [`MockStub`] does with one request
#[derive(Debug, Clone)]
pub enum StubAction {
    /// Reply success; `data` is sent back for device-to-host transfers
    Reply(Bytes),
    /// Reply with a failure status
    Fail,
    /// Never reply
    Ignore,
    /// Close the transport without replying
    Close,
}

/// A scripted usbforward stub
///
/// Serves `DeviceList` from `devices`, delegates everything else to the
/// handler, and records every request it saw.
pub struct MockStub<H> {
    devices: Vec<(DeviceInfo, Vec<InterfaceInfo>)>,
    handler: H,
    requests: Vec<(u32, StubRequest)>,
}

impl<H> MockStub<H>
where
    H: FnMut(&StubRequest) -> StubAction,
{
    pub fn new(devices: Vec<(DeviceInfo, Vec<InterfaceInfo>)>, handler: H) -> Self {
        Self {
            devices,
            handler,
            requests: Vec::new(),
        }
    }

    /// Serve until the peer closes or the handler asks to close; returns
    /// every `(tag, request)` received
    pub async fn serve<S>(mut self, stream: S) -> Vec<(u32, StubRequest)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        loop {
            let Ok(header) = read_frame::<RequestHeader, _>(&mut reader).await else {
                break;
            };
            let Ok(request) = read_request(&mut reader, header.command).await else {
                break;
            };
            self.requests.push((header.tag, request.clone()));

            let action = match request {
                StubRequest::DeviceList => StubAction::Reply(Bytes::new()),
                _ => (self.handler)(&request),
            };
            let reply = match action {
                StubAction::Ignore => continue,
                StubAction::Close => break,
                StubAction::Fail => encode_reply(header.tag, &request, None, &self.devices),
                StubAction::Reply(data) => {
                    encode_reply(header.tag, &request, Some(data), &self.devices)
                }
            };
            if writer.write_all(&reply).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.requests
    }
}

async fn read_request<R>(reader: &mut R, command: Command) -> protocol::Result<StubRequest>
where
    R: AsyncRead + Unpin,
{
    Ok(match command {
        Command::DeviceList => StubRequest::DeviceList,
        Command::Heartbeat => StubRequest::Heartbeat,
        Command::Attach => StubRequest::Attach(read_frame(reader).await?),
        Command::ControlTransfer => {
            let xfer: ControlTransfer = read_frame(reader).await?;
            let payload = if xfer.is_device_to_host() {
                Bytes::new()
            } else {
                read_payload(reader, xfer.length as usize, usize::MAX).await?
            };
            StubRequest::Control(xfer, payload)
        }
        Command::DataTransfer => {
            let xfer: DataTransfer = read_frame(reader).await?;
            let payload = if xfer.is_host_to_device {
                read_payload(reader, xfer.length as usize, usize::MAX).await?
            } else {
                Bytes::new()
            };
            StubRequest::Data(xfer, payload)
        }
    })
}

fn encode_reply(
    tag: u32,
    request: &StubRequest,
    data: Option<Bytes>,
    devices: &[(DeviceInfo, Vec<InterfaceInfo>)],
) -> Vec<u8> {
    let status = if data.is_some() {
        STATUS_SUCCESS
    } else {
        STATUS_FAILURE
    };
    let mut buf = ResponseHeader { status, tag }.to_bytes().unwrap_or_default();
    let Some(data) = data else {
        return buf;
    };
    let device_to_host = match request {
        StubRequest::DeviceList => {
            let _ = Length(devices.len() as u32).write_to(&mut buf);
            for (device, interfaces) in devices {
                let _ = device.write_to(&mut buf);
                for interface in interfaces {
                    let _ = interface.write_to(&mut buf);
                }
            }
            false
        }
        StubRequest::Control(xfer, _) => xfer.is_device_to_host(),
        StubRequest::Data(xfer, _) => !xfer.is_host_to_device,
        StubRequest::Attach(_) | StubRequest::Heartbeat => false,
    };
    if device_to_host {
        let _ = Length(data.len() as u32).write_to(&mut buf);
        buf.extend_from_slice(&data);
    }
    buf
}

/// Write a single `ResponseHeader`, for tests that script replies by hand
pub async fn write_response<W>(writer: &mut W, status: u32, tag: u32) -> protocol::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &ResponseHeader { status, tag }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_device_descriptor() {
        let desc = create_mock_device_descriptor();

        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 0x12); // bLength
        assert_eq!(desc[1], 0x01); // bDescriptorType
    }

    #[test]
    fn test_create_mock_setup_packet() {
        let setup = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012);

        assert_eq!(setup[0], 0x80); // bmRequestType (Device-to-host, Standard, Device)
        assert_eq!(setup[1], 0x06); // bRequest (GET_DESCRIPTOR)
        assert_eq!(setup[3], 0x01); // wValue high (Descriptor type: Device)
        assert_eq!(setup[6], 0x12); // wLength low (18 bytes)
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_stub_serves_device_list() {
        let (client, server) = tokio::io::duplex(4096);
        let stub = MockStub::new(vec![create_mock_device_info(1, 1)], |_| StubAction::Fail);
        let task = tokio::spawn(stub.serve(server));

        let (mut reader, mut writer) = tokio::io::split(client);
        let header = RequestHeader {
            command: Command::DeviceList,
            tag: 5,
        };
        write_frame(&mut writer, &header).await.unwrap();

        let response: ResponseHeader = read_frame(&mut reader).await.unwrap();
        assert_eq!(response, ResponseHeader { status: 0, tag: 5 });
        let count: Length = read_frame(&mut reader).await.unwrap();
        assert_eq!(count, Length(1));
        let device: DeviceInfo = read_frame(&mut reader).await.unwrap();
        assert_eq!(device.vendor_id, 0x18d1);
        let interface: InterfaceInfo = read_frame(&mut reader).await.unwrap();
        assert_eq!(interface, create_mock_interface());

        drop(writer);
        drop(reader);
        let requests = task.await.unwrap();
        assert_eq!(requests, vec![(5, StubRequest::DeviceList)]);
    }
}
