// Tests for the AMS/TCP frame codec.

use byteorder::{ByteOrder, WriteBytesExt, LE};

use crate::frame::{drain, encode_request, Command, ResponseBody, RoutePrefix};
use crate::Error;

// Assemble one wire frame with the prelude, AMS header and payload.
fn make_frame(cmd: u16, state_flags: u16, invoke_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LE>(0).unwrap(); // reserved
    buf.write_u32::<LE>(32 + payload.len() as u32).unwrap();
    buf.extend_from_slice(&[10, 0, 0, 1, 1, 1]); // dest netid
    buf.write_u16::<LE>(800).unwrap();
    buf.extend_from_slice(&[10, 0, 0, 2, 1, 1]); // source netid
    buf.write_u16::<LE>(851).unwrap();
    buf.write_u16::<LE>(cmd).unwrap();
    buf.write_u16::<LE>(state_flags).unwrap();
    buf.write_u32::<LE>(payload.len() as u32).unwrap();
    buf.write_u32::<LE>(0).unwrap(); // error code
    buf.write_u32::<LE>(invoke_id).unwrap();
    buf.extend_from_slice(payload);
    buf
}

fn read_response(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.write_u32::<LE>(0).unwrap();
    payload.write_u32::<LE>(data.len() as u32).unwrap();
    payload.extend_from_slice(data);
    payload
}

#[test]
fn requests_carry_the_routing_prefix() {
    let route = RoutePrefix::new(([10, 0, 0, 10, 1, 1], 851), ([10, 0, 0, 2, 1, 1], 800));
    let buf = encode_request(&route, Command::Read, 99, &[1, 2, 3]).unwrap();
    assert_eq!(buf.len(), 38 + 3);

    // Prelude: two reserved bytes, then the length of the rest.
    assert_eq!(buf[..2], [0, 0]);
    assert_eq!(LE::read_u32(&buf[2..6]), 32 + 3);
    // Routing prefix: target NetID and port, then source NetID and port.
    assert_eq!(buf[6..12], [10, 0, 0, 10, 1, 1]);
    assert_eq!(LE::read_u16(&buf[12..14]), 851);
    assert_eq!(buf[14..20], [10, 0, 0, 2, 1, 1]);
    assert_eq!(LE::read_u16(&buf[20..22]), 800);
    // Command, request flags, payload length, error code, invoke ID.
    assert_eq!(LE::read_u16(&buf[22..24]), 2);
    assert_eq!(LE::read_u16(&buf[24..26]), 4);
    assert_eq!(LE::read_u32(&buf[26..30]), 3);
    assert_eq!(LE::read_u32(&buf[30..34]), 0);
    assert_eq!(LE::read_u32(&buf[34..38]), 99);
    assert_eq!(buf[38..], [1, 2, 3]);
}

#[test]
fn whole_packets_decode_without_residue() {
    let mut buf = Vec::new();
    buf.extend(make_frame(2, 5, 1, &read_response(&[1, 2, 3, 4])));
    buf.extend(make_frame(3, 5, 2, &[0, 0, 0, 0]));
    buf.extend(make_frame(6, 5, 3, &{
        let mut p = vec![0, 0, 0, 0];
        p.write_u32::<LE>(77).unwrap();
        p
    }));

    let packets = drain(&mut buf).unwrap();
    assert!(buf.is_empty());
    assert_eq!(packets.len(), 3);

    assert_eq!(packets[0].command, Command::Read);
    assert_eq!(packets[0].invoke_id, 1);
    match &packets[0].body {
        ResponseBody::Read { result: 0, data } => assert_eq!(data, &[1, 2, 3, 4]),
        other => panic!("unexpected body {other:?}"),
    }
    assert!(matches!(packets[1].body, ResponseBody::Write { result: 0 }));
    assert!(matches!(packets[2].body, ResponseBody::AddNotification { result: 0, handle: 77 }));
}

#[test]
fn any_split_point_yields_the_same_packets() {
    let mut whole = Vec::new();
    whole.extend(make_frame(2, 5, 10, &read_response(b"abcd")));
    whole.extend(make_frame(4, 5, 11, &[0, 0, 0, 0, 5, 0, 3, 0]));

    for k in 0..whole.len() {
        let mut buf = whole[..k].to_vec();
        let mut packets = drain(&mut buf).unwrap();
        buf.extend_from_slice(&whole[k..]);
        packets.extend(drain(&mut buf).unwrap());

        assert!(buf.is_empty(), "residue at split {k}");
        assert_eq!(packets.len(), 2, "packet count at split {k}");
        assert_eq!(packets[0].invoke_id, 10);
        assert_eq!(packets[1].invoke_id, 11);
        match &packets[1].body {
            ResponseBody::ReadState { result: 0, ads_state: 5, dev_state: 3 } => {}
            other => panic!("unexpected body {other:?}"),
        }
    }
}

#[test]
fn partial_frame_emits_nothing_until_complete() {
    // A write response is a 42-byte frame; feed it byte by byte.
    let whole = make_frame(3, 5, 7, &[0, 0, 0, 0]);
    let mut buf = Vec::new();
    for (i, &byte) in whole.iter().enumerate() {
        buf.push(byte);
        let packets = drain(&mut buf).unwrap();
        if i + 1 < whole.len() {
            assert!(packets.is_empty(), "spurious packet after {} bytes", i + 1);
        } else {
            assert_eq!(packets.len(), 1);
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn unknown_command_is_a_protocol_error() {
    let mut buf = make_frame(12, 5, 1, &[0, 0, 0, 0]);
    assert!(matches!(drain(&mut buf), Err(Error::UnknownCommand(12))));
}

#[test]
fn declared_length_below_header_size_is_rejected() {
    let mut buf = vec![0, 0];
    buf.write_u32::<LE>(10).unwrap();
    buf.extend_from_slice(&[0; 10]);
    assert!(matches!(drain(&mut buf), Err(Error::FrameTooShort(10))));
}

#[test]
fn notification_frames_decode_samples() {
    let mut payload = Vec::new();
    payload.write_u32::<LE>(4 + 8 + 4 + 4 + 4 + 2).unwrap();
    payload.write_u32::<LE>(1).unwrap(); // stamps
    payload.write_u64::<LE>(0x0102_0304_0506_0708).unwrap();
    payload.write_u32::<LE>(1).unwrap(); // samples
    payload.write_u32::<LE>(42).unwrap(); // handle
    payload.write_u32::<LE>(2).unwrap(); // size
    payload.extend_from_slice(&[0xAB, 0xCD]);

    let mut buf = make_frame(8, 4, 0, &payload);
    let packets = drain(&mut buf).unwrap();
    assert_eq!(packets.len(), 1);
    match &packets[0].body {
        ResponseBody::Notification(n) => {
            let samples: Vec<_> = n.samples().collect();
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].handle, 42);
            assert_eq!(samples[0].timestamp, 0x0102_0304_0506_0708);
            assert_eq!(samples[0].data, &[0xAB, 0xCD]);
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn router_service_frames_are_skipped() {
    // ams_cmd 0x1001 is a router state note; it must not surface.
    let mut note = make_frame(3, 5, 1, &[0, 0, 0, 0]);
    note[0] = 0x01;
    note[1] = 0x10;
    let mut buf = note;
    buf.extend(make_frame(3, 5, 2, &[0, 0, 0, 0]));

    let packets = drain(&mut buf).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].invoke_id, 2);
}
