//! Wire format property tests
//!
//! Covers the codec round-trip properties for both protocols:
//! - usbforward request/response headers encode and decode bit-identically
//! - USB/IP `CMD_SUBMIT` frames with arbitrary setup and payload survive a
//!   decode/re-encode cycle unchanged
//! - Truncated input is always reported, never panics
//!
//! Run with: `cargo test -p protocol`

use bytes::Bytes;
use proptest::prelude::*;
use protocol::usbforward::{
    Command, ControlTransfer, DataTransfer, DeviceInfo, RequestHeader, ResponseHeader,
};
use protocol::usbip::{
    BusId, CmdCode, CmdHeader, CmdSubmit, CmdUnlink, Direction, SubmitFrame, UsbDevice,
};
use protocol::{ProtocolError, WireFormat};

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::DeviceList),
        Just(Command::Attach),
        Just(Command::ControlTransfer),
        Just(Command::DataTransfer),
        Just(Command::Heartbeat),
    ]
}

fn direction_strategy() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Out), Just(Direction::In)]
}

prop_compose! {
    fn submit_frame_strategy()(
        seqnum in any::<u32>(),
        bus in 0u32..0xffff,
        dev in 0u32..0xffff,
        direction in direction_strategy(),
        ep in 0u32..16,
        transfer_flags in any::<u32>(),
        interval in any::<u32>(),
        setup in any::<[u8; 8]>(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) -> SubmitFrame {
        let payload = if direction == Direction::Out {
            Bytes::from(payload)
        } else {
            Bytes::new()
        };
        SubmitFrame {
            header: CmdHeader {
                command: CmdCode::CmdSubmit,
                seqnum,
                devid: BusId::new(bus, dev).devid(),
                direction,
                ep,
            },
            submit: CmdSubmit {
                transfer_flags,
                transfer_buffer_length: payload.len() as u32,
                start_frame: 0,
                number_of_packets: 0,
                interval,
                setup,
            },
            payload,
        }
    }
}

proptest! {
    #[test]
    fn request_header_round_trip(command in command_strategy(), tag in any::<u32>()) {
        let header = RequestHeader { command, tag };
        let bytes = header.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), RequestHeader::SIZE);

        let decoded = RequestHeader::from_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded, header);
        prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn response_header_round_trip(status in any::<u32>(), tag in any::<u32>()) {
        let header = ResponseHeader { status, tag };
        let bytes = header.to_bytes().unwrap();

        let decoded = ResponseHeader::from_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn submit_frame_round_trip(frame in submit_frame_strategy()) {
        let bytes = frame.encode().unwrap();
        let decoded = SubmitFrame::decode(&bytes).unwrap();

        prop_assert_eq!(&decoded, &frame);
        prop_assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn submit_frame_setup_bytes_are_verbatim(frame in submit_frame_strategy()) {
        let bytes = frame.encode().unwrap();
        prop_assert_eq!(&bytes[40..48], &frame.submit.setup[..]);
        prop_assert_eq!(frame.submit.is_control(), frame.submit.setup != [0u8; 8]);
    }

    #[test]
    fn truncated_submit_is_reported(frame in submit_frame_strategy(), cut in 1usize..48) {
        let bytes = frame.encode().unwrap();
        let result = SubmitFrame::decode(&bytes[..bytes.len().saturating_sub(cut)]);
        prop_assert!(matches!(result, Err(ProtocolError::TruncatedFrame)));
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
        let _ = RequestHeader::from_bytes(&bytes);
        let _ = DeviceInfo::from_bytes(&bytes);
        let _ = ControlTransfer::from_bytes(&bytes);
        let _ = DataTransfer::from_bytes(&bytes);
        let _ = CmdHeader::from_bytes(&bytes);
        let _ = UsbDevice::from_bytes(&bytes);
        let _ = SubmitFrame::decode(&bytes);
    }
}

#[test]
fn test_unlink_body_carries_target_seqnum() {
    let bytes = CmdUnlink { unlink_seqnum: 42 }.to_bytes().unwrap();
    assert_eq!(bytes.len(), 28);
    assert_eq!(&bytes[..4], &[0, 0, 0, 42]);
    assert!(bytes[4..].iter().all(|&b| b == 0));
}

#[test]
fn test_headers_of_both_protocols_differ_in_byte_order() {
    let usbforward = ResponseHeader { status: 0, tag: 1 }.to_bytes().unwrap();
    let usbip = CmdHeader::reply(CmdCode::RetSubmit, 1).to_bytes().unwrap();

    assert_eq!(&usbforward[4..8], &[1, 0, 0, 0]);
    assert_eq!(&usbip[4..8], &[0, 0, 0, 1]);
}
