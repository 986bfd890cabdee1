//! Bit-exact HCP framing: fragmentation of logical messages into
//! transport frames and reassembly of inbound frames.
//!
//! Frame layout: byte 0 = chain-bit (bit 7, set when more frames follow)
//! | 7-bit pipe id; byte 1 (first frame of a message only) = 2-bit
//! message type | 6-bit instruction; remaining bytes are payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Chain bit: set on every frame of a message except the last.
pub const HCP_CHAIN_BIT: u8 = 0x80;

/// Mask extracting the 7-bit pipe id from the first frame byte.
pub const HCP_PIPE_MASK: u8 = 0x7F;

/// Mask extracting the 6-bit instruction from the second frame byte.
pub const HCP_INST_MASK: u8 = 0x3F;

const HCP_TYPE_SHIFT: u32 = 6;

/// Smallest usable frame budget: two header bytes plus one payload byte.
pub const MIN_FRAME_SIZE: usize = 3;

/// Message type carried in the two high bits of the first-frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command = 0,
    Event = 1,
    Response = 2,
}

impl MessageKind {
    /// Decode the two type bits.
    pub fn from_bits(bits: u8) -> Result<Self, FramingError> {
        match bits {
            0 => Ok(MessageKind::Command),
            1 => Ok(MessageKind::Event),
            2 => Ok(MessageKind::Response),
            other => Err(FramingError::InvalidType(other)),
        }
    }
}

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid message type bits: {0:#04x}")]
    InvalidType(u8),

    #[error("Pipe changed mid-message: {0:#04x} then {1:#04x}")]
    PipeMismatch(u8, u8),

    #[error("Frame budget {0} below minimum {1}")]
    FrameTooSmall(usize, usize),
}

/// One reassembled logical HCP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HcpMessage {
    pub pipe: u8,
    pub kind: MessageKind,
    pub instruction: u8,
    pub payload: Bytes,
    /// Set when the payload overran the reassembly buffer and was cut
    /// at capacity; the receiver reports buffer-full instead of the
    /// silent drop.
    pub truncated: bool,
}

/// Fragmenting encoder bound to a negotiated maximum frame size.
#[derive(Clone, Copy, Debug)]
pub struct HcpCodec {
    max_frame: usize,
}

impl HcpCodec {
    /// Create a codec for the given transport frame budget.
    pub fn new(max_frame: usize) -> Result<Self, FramingError> {
        if max_frame < MIN_FRAME_SIZE {
            return Err(FramingError::FrameTooSmall(max_frame, MIN_FRAME_SIZE));
        }
        Ok(Self { max_frame })
    }

    /// Negotiated maximum frame size.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Split one logical message into transport frames.
    ///
    /// The first frame carries up to `max_frame - 2` payload bytes after
    /// the two header bytes, each continuation up to `max_frame - 1`.
    /// A zero-length payload still produces one header-only frame.
    pub fn fragment(
        &self,
        pipe: u8,
        kind: MessageKind,
        instruction: u8,
        payload: &[u8],
    ) -> Vec<Bytes> {
        let first_budget = self.max_frame - 2;
        let cont_budget = self.max_frame - 1;

        let first_len = payload.len().min(first_budget);
        let mut rest = &payload[first_len..];

        let mut frames = Vec::with_capacity(1 + rest.len().div_ceil(cont_budget));
        let chained = !rest.is_empty();

        let mut frame = BytesMut::with_capacity(2 + first_len);
        frame.put_u8(chain_byte(pipe, chained));
        frame.put_u8(((kind as u8) << HCP_TYPE_SHIFT) | (instruction & HCP_INST_MASK));
        frame.put_slice(&payload[..first_len]);
        frames.push(frame.freeze());

        while !rest.is_empty() {
            let take = rest.len().min(cont_budget);
            let (chunk, tail) = rest.split_at(take);
            let mut frame = BytesMut::with_capacity(1 + take);
            frame.put_u8(chain_byte(pipe, !tail.is_empty()));
            frame.put_slice(chunk);
            frames.push(frame.freeze());
            rest = tail;
        }

        frames
    }
}

fn chain_byte(pipe: u8, more: bool) -> u8 {
    let bit = if more { HCP_CHAIN_BIT } else { 0 };
    bit | (pipe & HCP_PIPE_MASK)
}

/// Extract the pipe id from a raw frame without consuming it.
pub fn frame_pipe(frame: &[u8]) -> Result<u8, FramingError> {
    frame
        .first()
        .map(|b| b & HCP_PIPE_MASK)
        .ok_or(FramingError::TooShort(0))
}

/// Fixed-capacity reassembler for one logical message at a time.
///
/// Frames for a second pipe arriving while a chained message is in
/// progress are a protocol violation and reset the assembly. Payload
/// beyond the buffer capacity is cut at capacity and the delivered
/// message is flagged `truncated`; the reassembler is immediately
/// reusable for the next message.
#[derive(Debug)]
pub struct Reassembler {
    capacity: usize,
    buf: BytesMut,
    header: Option<(u8, MessageKind, u8)>,
    truncated: bool,
}

impl Reassembler {
    /// Create a reassembler with the given payload capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: BytesMut::with_capacity(capacity),
            header: None,
            truncated: false,
        }
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a chained message is currently being assembled.
    pub fn in_progress(&self) -> bool {
        self.header.is_some()
    }

    /// Drop any partial assembly.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header = None;
        self.truncated = false;
    }

    /// Consume one inbound frame.
    ///
    /// Returns `Ok(Some(msg))` when the frame completes a logical
    /// message, `Ok(None)` when more frames are expected.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<HcpMessage>, FramingError> {
        let first = *frame.first().ok_or(FramingError::TooShort(0))?;
        let more = first & HCP_CHAIN_BIT != 0;
        let pipe = first & HCP_PIPE_MASK;

        let body = match self.header {
            None => {
                if frame.len() < 2 {
                    return Err(FramingError::TooShort(frame.len()));
                }
                let kind = MessageKind::from_bits(frame[1] >> HCP_TYPE_SHIFT)?;
                self.header = Some((pipe, kind, frame[1] & HCP_INST_MASK));
                &frame[2..]
            }
            Some((expected, _, _)) => {
                if expected != pipe {
                    self.reset();
                    return Err(FramingError::PipeMismatch(expected, pipe));
                }
                &frame[1..]
            }
        };

        let room = self.capacity - self.buf.len();
        if body.len() > room {
            self.buf.put_slice(&body[..room]);
            self.truncated = true;
        } else {
            self.buf.put_slice(body);
        }

        if more {
            return Ok(None);
        }

        let (pipe, kind, instruction) = self.header.take().expect("header parsed above");
        let payload = self.buf.split().freeze();
        let truncated = self.truncated;
        self.truncated = false;
        Ok(Some(HcpMessage {
            pipe,
            kind,
            instruction,
            payload,
            truncated,
        }))
    }
}
