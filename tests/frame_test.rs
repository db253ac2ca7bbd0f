use bytes::BytesMut;
use rstest::rstest;
use stonelink::network::{check_body_size, HEADER_SIZE};
use stonelink::{AppError, DefaultProtocol, FrameProtocol, LengthPrefixProtocol, MessageHeader};

#[test]
fn encode_then_parse_keeps_body_and_sequence() {
    let protocol = DefaultProtocol;
    let mut message = protocol.encode(0x0102_0304, b"round trip body").unwrap();
    protocol.stamp_sequence(&mut message, 9_000_000_001);

    let mut buffer = BytesMut::from(message.frame());
    let decoded = protocol.parse(&mut buffer, 1024).unwrap().unwrap();

    assert_eq!(decoded.body(), b"round trip body");
    assert_eq!(decoded.sequence(), Some(9_000_000_001));
    assert_eq!(decoded.descriptor(), Some(0x0102_0304));
    assert_eq!(decoded.header_fields().unwrap().body_len as usize, decoded.body_len());
}

#[test]
fn back_to_back_frames_split_in_order() {
    let protocol = DefaultProtocol;
    let mut buffer = BytesMut::new();
    let bodies = [b"first".as_slice(), b"".as_slice(), b"third".as_slice()];
    for (sequence, body) in bodies.into_iter().enumerate() {
        let mut message = protocol.encode(0, body).unwrap();
        protocol.stamp_sequence(&mut message, sequence as u64 + 1);
        buffer.extend_from_slice(message.frame());
    }

    let mut seen = Vec::new();
    while let Some(message) = protocol.parse(&mut buffer, 1024).unwrap() {
        seen.push((message.sequence().unwrap(), message.into_body()));
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, 1);
    assert_eq!(seen[0].1.as_ref(), b"first");
    assert!(seen[1].1.is_empty());
    assert_eq!(seen[2].0, 3);
    assert!(buffer.is_empty());
}

#[rstest]
#[case(0, 0, true)]
#[case(16, 16, true)]
#[case(17, 16, false)]
fn body_size_limit(#[case] body_size: usize, #[case] limit: usize, #[case] accepted: bool) {
    let result = check_body_size(body_size, limit);
    assert_eq!(result.is_ok(), accepted);
    if !accepted {
        assert!(matches!(result, Err(AppError::FrameTooLarge(size)) if size == body_size));
    }
}

#[test]
fn header_write_read_symmetry() {
    let header = MessageHeader {
        body_len: 5,
        descriptor: 77,
        sequence: u64::MAX,
        reserved: [0xAB; 16],
    };
    let mut raw = [0u8; HEADER_SIZE];
    header.write_to(&mut raw);
    assert_eq!(MessageHeader::read_from(&raw).unwrap(), header);
}

#[test]
fn length_prefix_round_trip() {
    let protocol = LengthPrefixProtocol;
    let message = protocol.encode(0, b"plain").unwrap();
    let mut buffer = BytesMut::from(message.frame());
    let decoded = protocol.parse(&mut buffer, 1024).unwrap().unwrap();
    assert_eq!(decoded.body(), b"plain");
    assert_eq!(decoded.header(), &5u32.to_le_bytes());
}
