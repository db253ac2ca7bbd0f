// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Size of the default header: body length, descriptor, sequence number, reserved.
pub const HEADER_SIZE: usize = 32;
pub const RESERVED_SIZE: usize = 16;
/// Size of the header used by [`LengthPrefixProtocol`].
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Decoded form of the default 32 byte header. All integers are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub body_len: u32,
    pub descriptor: u32,
    pub sequence: u64,
    pub reserved: [u8; RESERVED_SIZE],
}

impl MessageHeader {
    pub fn read_from(buffer: &[u8]) -> AppResult<MessageHeader> {
        if buffer.len() < HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buffer.len()
            )));
        }
        let mut buf = &buffer[..HEADER_SIZE];
        let body_len = buf.get_u32_le();
        let descriptor = buf.get_u32_le();
        let sequence = buf.get_u64_le();
        let mut reserved = [0u8; RESERVED_SIZE];
        buf.copy_to_slice(&mut reserved);
        Ok(MessageHeader {
            body_len,
            descriptor,
            sequence,
            reserved,
        })
    }

    /// `buffer` must hold at least [`HEADER_SIZE`] bytes.
    pub fn write_to(&self, buffer: &mut [u8]) {
        let mut buf = &mut buffer[..HEADER_SIZE];
        buf.put_u32_le(self.body_len);
        buf.put_u32_le(self.descriptor);
        buf.put_u64_le(self.sequence);
        buf.put_slice(&self.reserved);
    }
}

/// One frame: header immediately followed by the body, kept in a single buffer so the
/// write pipeline can hand out header and body slices without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct WireMessage {
    frame: BytesMut,
    header_size: usize,
}

impl WireMessage {
    /// Builds a default-framing message with descriptor 0.
    pub fn new(body: impl AsRef<[u8]>) -> AppResult<WireMessage> {
        Self::with_descriptor(0, body)
    }

    /// Fails with [`AppError::FrameTooLarge`] when the body does not fit the u32 length
    /// field.
    pub fn with_descriptor(descriptor: u32, body: impl AsRef<[u8]>) -> AppResult<WireMessage> {
        let body = body.as_ref();
        let mut frame = BytesMut::zeroed(HEADER_SIZE);
        MessageHeader {
            body_len: body_len_u32(body.len())?,
            descriptor,
            ..Default::default()
        }
        .write_to(&mut frame);
        frame.extend_from_slice(body);
        Ok(WireMessage {
            frame,
            header_size: HEADER_SIZE,
        })
    }

    pub(crate) fn from_frame(frame: BytesMut, header_size: usize) -> WireMessage {
        debug_assert!(frame.len() >= header_size);
        WireMessage { frame, header_size }
    }

    pub fn header(&self) -> &[u8] {
        &self.frame[..self.header_size]
    }

    pub(crate) fn header_mut(&mut self) -> &mut [u8] {
        &mut self.frame[..self.header_size]
    }

    pub fn body(&self) -> &[u8] {
        &self.frame[self.header_size..]
    }

    pub fn into_body(mut self) -> Bytes {
        self.frame.split_off(self.header_size).freeze()
    }

    /// Header and body as laid out on the wire.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn frame_len(&self) -> usize {
        self.frame.len()
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn body_len(&self) -> usize {
        self.frame.len() - self.header_size
    }

    /// Parses the default header layout, fails for frames produced by other framings.
    pub fn header_fields(&self) -> AppResult<MessageHeader> {
        if self.header_size != HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame header is {} bytes, not the default {}",
                self.header_size, HEADER_SIZE
            )));
        }
        MessageHeader::read_from(self.header())
    }

    pub fn descriptor(&self) -> Option<u32> {
        self.header_fields().ok().map(|h| h.descriptor)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.header_fields().ok().map(|h| h.sequence)
    }
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMessage")
            .field("header_size", &self.header_size)
            .field("body_len", &self.body_len())
            .finish()
    }
}

/// Pluggable framing: tells the connection pipeline how large a header is, how to find
/// the body length inside it and how to build outgoing frames.
pub trait FrameProtocol: Send + Sync + fmt::Debug + 'static {
    fn header_size(&self) -> usize;

    /// Body length announced by `header`, which is exactly `header_size` bytes long.
    fn body_size(&self, header: &[u8]) -> AppResult<usize>;

    fn encode(&self, descriptor: u32, body: &[u8]) -> AppResult<WireMessage>;

    /// Writes the per-connection sequence number into an outgoing frame.
    /// Framings without a sequence field ignore it.
    fn stamp_sequence(&self, _message: &mut WireMessage, _sequence: u64) {}

    /// Splits one complete frame off the front of `buffer`.
    ///
    /// Returns `Ok(None)` and reserves room when the buffer does not yet hold a whole
    /// frame, so callers can keep reading into the same buffer.
    fn parse(&self, buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<Option<WireMessage>> {
        let header_size = self.header_size();
        if buffer.remaining() < header_size {
            return Ok(None);
        }
        let body_size = self.body_size(&buffer[..header_size])?;
        check_body_size(body_size, max_frame_size)?;
        let frame_size = header_size + body_size;
        if buffer.remaining() < frame_size {
            buffer.reserve(frame_size - buffer.remaining());
            return Ok(None);
        }
        Ok(Some(WireMessage::from_frame(
            buffer.split_to(frame_size),
            header_size,
        )))
    }
}

/// Rejects bodies larger than the configured limit before any buffer is sized for them.
pub fn check_body_size(body_size: usize, max_frame_size: usize) -> AppResult<()> {
    if body_size > max_frame_size {
        return Err(AppError::FrameTooLarge(body_size));
    }
    Ok(())
}

fn body_len_u32(body_len: usize) -> AppResult<u32> {
    u32::try_from(body_len).map_err(|_| AppError::FrameTooLarge(body_len))
}

/// `[u32 body_len][u32 descriptor][u64 sequence][16 reserved][body]`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProtocol;

impl FrameProtocol for DefaultProtocol {
    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn body_size(&self, header: &[u8]) -> AppResult<usize> {
        Ok(MessageHeader::read_from(header)?.body_len as usize)
    }

    fn encode(&self, descriptor: u32, body: &[u8]) -> AppResult<WireMessage> {
        WireMessage::with_descriptor(descriptor, body)
    }

    fn stamp_sequence(&self, message: &mut WireMessage, sequence: u64) {
        let mut header = match MessageHeader::read_from(message.header()) {
            Ok(header) => header,
            Err(_) => return,
        };
        header.sequence = sequence;
        header.write_to(message.header_mut());
    }
}

/// Plain `[u32 body_len][body]`, descriptor and sequence are not transmitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixProtocol;

impl FrameProtocol for LengthPrefixProtocol {
    fn header_size(&self) -> usize {
        LENGTH_PREFIX_SIZE
    }

    fn body_size(&self, header: &[u8]) -> AppResult<usize> {
        if header.len() < LENGTH_PREFIX_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "length prefix needs {} bytes, got {}",
                LENGTH_PREFIX_SIZE,
                header.len()
            )));
        }
        let mut buf = header;
        Ok(buf.get_u32_le() as usize)
    }

    fn encode(&self, _descriptor: u32, body: &[u8]) -> AppResult<WireMessage> {
        let body_len = body_len_u32(body.len())?;
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.put_u32_le(body_len);
        frame.put_slice(body);
        Ok(WireMessage::from_frame(frame, LENGTH_PREFIX_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_header_layout() {
        let mut message = DefaultProtocol.encode(7, b"Hello").unwrap();
        DefaultProtocol.stamp_sequence(&mut message, 42);

        let frame = message.frame();
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(&frame[0..4], &5u32.to_le_bytes());
        assert_eq!(&frame[4..8], &7u32.to_le_bytes());
        assert_eq!(&frame[8..16], &42u64.to_le_bytes());
        assert_eq!(&frame[16..32], &[0u8; RESERVED_SIZE]);
        assert_eq!(&frame[32..], b"Hello");
    }

    #[rstest]
    #[case::default_framing(&DefaultProtocol as &dyn FrameProtocol)]
    #[case::length_prefix(&LengthPrefixProtocol as &dyn FrameProtocol)]
    fn parse_waits_for_complete_frame(#[case] protocol: &dyn FrameProtocol) {
        let message = protocol.encode(1, b"partial body").unwrap();
        let frame = message.frame();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&frame[..protocol.header_size() - 1]);
        assert!(protocol.parse(&mut buffer, 1024).unwrap().is_none());

        buffer.extend_from_slice(&frame[protocol.header_size() - 1..frame.len() - 1]);
        assert!(protocol.parse(&mut buffer, 1024).unwrap().is_none());

        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        let parsed = protocol.parse(&mut buffer, 1024).unwrap().unwrap();
        assert_eq!(parsed.body(), b"partial body");
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_rejects_oversized_body() {
        let message = DefaultProtocol.encode(0, &[1u8; 64]).unwrap();
        let mut buffer = BytesMut::from(message.frame());
        assert!(matches!(
            DefaultProtocol.parse(&mut buffer, 63),
            Err(AppError::FrameTooLarge(64))
        ));
    }

    #[test]
    fn empty_body_is_a_complete_frame() {
        let message = WireMessage::new(b"").unwrap();
        assert_eq!(message.body_len(), 0);
        let mut buffer = BytesMut::from(message.frame());
        let parsed = DefaultProtocol.parse(&mut buffer, 0).unwrap().unwrap();
        assert!(parsed.body().is_empty());
        assert_eq!(parsed.header_fields().unwrap().body_len, 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn body_length_must_fit_u32() {
        assert_eq!(body_len_u32(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            body_len_u32(u32::MAX as usize + 1),
            Err(AppError::FrameTooLarge(len)) if len == u32::MAX as usize + 1
        ));
    }

    #[test]
    fn length_prefix_has_no_header_fields() {
        let message = LengthPrefixProtocol.encode(3, b"abc").unwrap();
        assert_eq!(message.frame(), &[3, 0, 0, 0, b'a', b'b', b'c']);
        assert!(message.header_fields().is_err());
        assert_eq!(message.sequence(), None);
        assert_eq!(message.into_body().as_ref(), b"abc");
    }

    #[test]
    fn short_header_is_malformed() {
        assert!(matches!(
            MessageHeader::read_from(&[0u8; HEADER_SIZE - 1]),
            Err(AppError::MalformedProtocol(_))
        ));
    }
}
