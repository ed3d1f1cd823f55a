// Wire format for the simhub transport protocol.
//
// One logical message on the wire:
//   data:  01 | ctrl | id:4 | len:2 | bytes | (02 | len:2 | bytes)* | 03
//   ack:   01 | 02   | id:4 | 03
//   ping:  01 | 18   | 03
//   pong:  01 | 10   | 03
// A bare 03 where a start marker is expected is the peer's close marker.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod envelope;

pub use envelope::{Envelope, EnvelopeOption, LoginData, PublishData, TopicData};

pub const MARKER_START: u8 = 0x01;
pub const MARKER_CONTINUE: u8 = 0x02;
pub const MARKER_END: u8 = 0x03;

// Control byte flags.
pub const CTRL_SEGMENTED: u8 = 0b0000_0001;
pub const CTRL_ACK_REPLY: u8 = 0b0000_0010;
pub const CTRL_NEED_ACK: u8 = 0b0000_0100;
pub const CTRL_PING: u8 = 0b0000_1000;
pub const CTRL_PING_EXCHANGE: u8 = 0b0001_0000;

/// Largest segment the 2-byte length field can describe.
pub const SEGMENT_CEILING: usize = u16::MAX as usize;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

// start + control + message id
const DATA_PREFIX_LEN: usize = 6;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unexpected marker byte 0x{0:02x}")]
    UnexpectedMarker(u8),
    #[error("peer signalled end of stream")]
    EndOfStream,
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },
    #[error("failed to serialize envelope")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize envelope")]
    Deserialize(serde_json::Error),
}

/// Message kinds surfaced to transport callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Data = 1,
    Ping = 2,
    Pong = 3,
    Ack = 4,
}

/// One logical transport message.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use simhub_wire::{Frame, FrameDecoder};
///
/// let frame = Frame::data(7, Bytes::from_static(b"hello"), false);
/// let mut buf = BytesMut::from(&frame.encode()[..]);
/// let decoded = FrameDecoder::default().decode(&mut buf).expect("decode");
/// assert_eq!(decoded, Some(frame));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        message_id: u32,
        need_ack: bool,
        payload: Bytes,
    },
    Ack {
        message_id: u32,
    },
    Ping,
    Pong,
}

/// Number of segments a payload of `len` bytes is split into.
pub fn segment_count(len: usize) -> usize {
    len.div_ceil(SEGMENT_CEILING).max(1)
}

impl Frame {
    pub fn data(message_id: u32, payload: Bytes, need_ack: bool) -> Self {
        Self::Data {
            message_id,
            need_ack,
            payload,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Self::Data { .. } => Kind::Data,
            Self::Ack { .. } => Kind::Ack,
            Self::Ping => Kind::Ping,
            Self::Pong => Kind::Pong,
        }
    }

    pub fn control(&self) -> u8 {
        match self {
            Self::Data {
                need_ack, payload, ..
            } => {
                let mut control = 0;
                if *need_ack {
                    control |= CTRL_NEED_ACK;
                }
                if segment_count(payload.len()) > 1 {
                    control |= CTRL_SEGMENTED;
                }
                control
            }
            Self::Ack { .. } => CTRL_ACK_REPLY,
            Self::Ping => CTRL_PING_EXCHANGE | CTRL_PING,
            Self::Pong => CTRL_PING_EXCHANGE,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => {
                let segments = segment_count(payload.len());
                // Each segment costs a length field, all but the first a continue marker.
                DATA_PREFIX_LEN + payload.len() + segments * 2 + (segments - 1) + 1
            }
            Self::Ack { .. } => DATA_PREFIX_LEN + 1,
            Self::Ping | Self::Pong => 3,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(MARKER_START);
        buf.put_u8(self.control());
        match self {
            Self::Data {
                message_id,
                payload,
                ..
            } => {
                buf.put_u32(*message_id);
                if payload.is_empty() {
                    buf.put_u16(0);
                }
                for (index, segment) in payload.chunks(SEGMENT_CEILING).enumerate() {
                    if index > 0 {
                        buf.put_u8(MARKER_CONTINUE);
                    }
                    buf.put_u16(segment.len() as u16);
                    buf.extend_from_slice(segment);
                }
            }
            Self::Ack { message_id } => buf.put_u32(*message_id),
            Self::Ping | Self::Pong => {}
        }
        buf.put_u8(MARKER_END);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Incremental decoder over a read buffer.
///
/// `decode` leaves the buffer untouched until a whole logical message is
/// available, so callers can keep appending socket reads and retry.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_message_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Largest encoded data message the limit admits: the prefix, every
    /// payload byte, and a length field plus trailing marker per segment.
    fn max_encoded_len(&self) -> usize {
        DATA_PREFIX_LEN
            .saturating_add(self.max_message_bytes)
            .saturating_add(segment_count(self.max_message_bytes).saturating_mul(3))
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(&marker) = buf.first() else {
            return Ok(None);
        };
        match marker {
            MARKER_START => {}
            MARKER_END => {
                buf.advance(1);
                return Err(Error::EndOfStream);
            }
            other => return Err(Error::UnexpectedMarker(other)),
        }
        if buf.len() < 2 {
            return Ok(None);
        }
        let control = buf[1];

        if control & CTRL_PING_EXCHANGE != 0 {
            if buf.len() < 3 {
                return Ok(None);
            }
            expect_end(buf[2])?;
            buf.advance(3);
            let frame = if control & CTRL_PING != 0 {
                Frame::Ping
            } else {
                Frame::Pong
            };
            return Ok(Some(frame));
        }

        if buf.len() < DATA_PREFIX_LEN {
            return Ok(None);
        }
        let message_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

        if control & CTRL_ACK_REPLY != 0 {
            if buf.len() < DATA_PREFIX_LEN + 1 {
                return Ok(None);
            }
            expect_end(buf[DATA_PREFIX_LEN])?;
            buf.advance(DATA_PREFIX_LEN + 1);
            return Ok(Some(Frame::Ack { message_id }));
        }

        // Walk segment headers first; nothing is copied until the end marker is buffered.
        let max_encoded = self.max_encoded_len();
        let mut cursor = DATA_PREFIX_LEN;
        let mut total = 0usize;
        let mut segments: Vec<(usize, usize)> = Vec::new();
        loop {
            if buf.len() < cursor + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]) as usize;
            cursor += 2;
            total += len;
            let needed = cursor + len + 1;
            // Empty or tiny segments still count against the limit through their framing.
            if total > self.max_message_bytes || needed > max_encoded {
                return Err(Error::MessageTooLarge {
                    limit: self.max_message_bytes,
                });
            }
            if buf.len() < needed {
                buf.reserve(needed - buf.len());
                return Ok(None);
            }
            segments.push((cursor, len));
            cursor += len;
            let marker = buf[cursor];
            cursor += 1;
            match marker {
                MARKER_END => break,
                MARKER_CONTINUE => continue,
                other => return Err(Error::UnexpectedMarker(other)),
            }
        }

        let message = buf.split_to(cursor).freeze();
        let payload = match segments.as_slice() {
            [(start, len)] => message.slice(*start..*start + *len),
            _ => {
                let mut payload = BytesMut::with_capacity(total);
                for (start, len) in &segments {
                    payload.extend_from_slice(&message[*start..*start + *len]);
                }
                payload.freeze()
            }
        };
        Ok(Some(Frame::Data {
            message_id,
            need_ack: control & CTRL_NEED_ACK != 0,
            payload,
        }))
    }
}

fn expect_end(byte: u8) -> Result<()> {
    if byte == MARKER_END {
        Ok(())
    } else {
        Err(Error::UnexpectedMarker(byte))
    }
}
