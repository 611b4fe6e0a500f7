//! # Length-delimited frame codec.
//!
//! Wire layout of one frame (all integers big-endian):
//! ```text
//! ┌────────────┬──────────────┬───────────┬────────────────┬───────────────┐
//! │ len: u32   │ tag_len: u16 │ tag: utf8 │ correlation:u64│ payload: json │
//! └────────────┴──────────────┴───────────┴────────────────┴───────────────┘
//!   len counts every byte after itself
//! ```
//!
//! - correlation id `0` marks a fire-and-forget message;
//! - the header tag must equal [`Message::tag`] of the decoded payload;
//! - frames above `max_frame_len` are rejected on both sides.
//!
//! The codec is driven by [`tokio_util::codec::Framed`], which owns the read and
//! write buffers: a frame split over several socket reads stays buffered until
//! complete, and a partially written frame is resumed on the next writable turn.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::ipc::message::Message;

const LEN_PREFIX: usize = 4;
const TAG_LEN: usize = 2;
const CORRELATION_LEN: usize = 8;

/// One decoded frame: correlation id plus message.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Correlation id (`0` = no reply expected).
    pub id: u64,
    /// Frame payload.
    pub message: Message,
}

impl Packet {
    /// Creates a packet.
    pub fn new(id: u64, message: impl Into<Message>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }
}

/// Encoder/decoder for [`Packet`] frames.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec accepting frames up to `max_frame_len` bytes (clamped to the header size).
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(TAG_LEN + CORRELATION_LEN),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let mut frame = src.split_to(len);
        if frame.len() < TAG_LEN {
            return Err(CodecError::MalformedHeader);
        }
        let tag_len = frame.get_u16() as usize;
        if frame.len() < tag_len + CORRELATION_LEN {
            return Err(CodecError::MalformedHeader);
        }
        let tag_bytes = frame.split_to(tag_len);
        let tag = std::str::from_utf8(&tag_bytes).map_err(|_| CodecError::MalformedHeader)?;
        let id = frame.get_u64();

        let message: Message = serde_json::from_slice(&frame)?;
        if message.tag() != tag {
            return Err(CodecError::TagMismatch {
                header: tag.to_string(),
                payload: message.tag().to_string(),
            });
        }
        Ok(Some(Packet { id, message }))
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&item.message)?;
        let tag = item.message.tag().as_bytes();
        let len = TAG_LEN + tag.len() + CORRELATION_LEN + payload.len();
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(LEN_PREFIX + len);
        dst.put_u32(len as u32);
        dst.put_u16(tag.len() as u16);
        dst.put_slice(tag);
        dst.put_u64(item.id);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{Command, Event};

    fn encoded(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(1024).encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_a_frame_delivered_in_pieces() {
        let packet = Packet::new(42, Command::ContainerGet { id: "x".into() });
        let wire = encoded(packet.clone());

        let mut codec = FrameCodec::new(1024);
        let mut src = BytesMut::new();
        for chunk in wire.chunks(3) {
            assert_eq!(codec.decode(&mut src).unwrap(), None);
            src.extend_from_slice(chunk);
        }
        assert_eq!(codec.decode(&mut src).unwrap(), Some(packet));
        assert!(src.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut src = encoded(Packet::new(0, Event::ProcessDetached { pid: 10 }));
        src.extend_from_slice(&encoded(Packet::new(0, Event::ProcessBlocked { pid: 11 })));

        let mut codec = FrameCodec::new(1024);
        let first = codec.decode(&mut src).unwrap().unwrap();
        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.message, Message::Event(Event::ProcessDetached { pid: 10 }));
        assert_eq!(second.message, Message::Event(Event::ProcessBlocked { pid: 11 }));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut src = BytesMut::new();
        src.put_u32(4096);
        let err = FrameCodec::new(1024).decode(&mut src).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 4096, max: 1024 }));

        let mut dst = BytesMut::new();
        let big = Command::ContainerSet {
            id: "blob".into(),
            value: serde_json::Value::String("x".repeat(2048)),
        };
        let err = FrameCodec::new(1024)
            .encode(Packet::new(1, big), &mut dst)
            .unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn rejects_header_that_lies_about_the_payload() {
        let payload = serde_json::to_vec(&Message::Command(Command::StopServer)).unwrap();
        let tag = b"ReloadServer";
        let mut src = BytesMut::new();
        src.put_u32((2 + tag.len() + 8 + payload.len()) as u32);
        src.put_u16(tag.len() as u16);
        src.put_slice(tag);
        src.put_u64(3);
        src.put_slice(&payload);

        let err = FrameCodec::new(1024).decode(&mut src).unwrap_err();
        assert!(matches!(err, CodecError::TagMismatch { .. }));
    }
}
