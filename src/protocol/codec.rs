//! Protocol codec for framing payloads
//!
//! Encoding wraps a payload in header, size and checksum. Decoding is done by
//! [`FrameParser`], a byte-at-a-time state machine that resynchronizes on
//! garbage and only ever yields payloads whose checksum matches.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{FRAME_OVERHEAD, HEADER_1, HEADER_2, MAX_PAYLOAD_SIZE};

/// Codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {max})", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// XOR of the size byte and every payload byte
pub fn checksum(size: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(size, |cs, b| cs ^ b)
}

/// Wrap a payload into a complete frame
pub fn encode(payload: &[u8]) -> CodecResult<Bytes> {
    let size = u8::try_from(payload.len())
        .map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.put_u8(HEADER_1);
    buf.put_u8(HEADER_2);
    buf.put_u8(size);
    buf.put_slice(payload);
    buf.put_u8(checksum(size, payload));

    Ok(buf.freeze())
}

/// Strictly decode exactly one frame
///
/// Unlike [`FrameParser`] this does not skip noise: the buffer has to start
/// with the header and hold the whole frame.
pub fn decode_frame(frame: &[u8]) -> CodecResult<Bytes> {
    if frame.len() < 3 {
        return Err(CodecError::Truncated {
            expected: FRAME_OVERHEAD,
            actual: frame.len(),
        });
    }
    if frame[0] != HEADER_1 || frame[1] != HEADER_2 {
        return Err(CodecError::InvalidHeader);
    }

    let size = frame[2];
    let expected = size as usize + FRAME_OVERHEAD;
    if frame.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: frame.len(),
        });
    }

    let payload = &frame[3..3 + size as usize];
    let received = frame[expected - 1];
    let computed = checksum(size, payload);
    if received != computed {
        return Err(CodecError::ChecksumMismatch {
            expected: computed,
            actual: received,
        });
    }

    Ok(Bytes::copy_from_slice(payload))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    #[default]
    AwaitHeader1,
    AwaitHeader2,
    AwaitSize,
    AwaitPayload,
    AwaitChecksum,
}

/// Scans a byte stream for frames
pub struct FrameParser {
    state: ParseState,
    size: u8,
    payload: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::AwaitHeader1,
            size: 0,
            payload: BytesMut::with_capacity(MAX_PAYLOAD_SIZE),
        }
    }

    /// Feed one byte, returning a payload when it completes a valid frame
    pub fn push(&mut self, byte: u8) -> Option<Bytes> {
        match self.state {
            ParseState::AwaitHeader1 => {
                if byte == HEADER_1 {
                    self.state = ParseState::AwaitHeader2;
                }
            }
            ParseState::AwaitHeader2 => {
                self.state = if byte == HEADER_2 {
                    ParseState::AwaitSize
                } else {
                    ParseState::AwaitHeader1
                };
            }
            ParseState::AwaitSize => {
                self.size = byte;
                self.payload.clear();
                self.state = if byte == 0 {
                    ParseState::AwaitChecksum
                } else {
                    ParseState::AwaitPayload
                };
            }
            ParseState::AwaitPayload => {
                self.payload.put_u8(byte);
                if self.payload.len() == self.size as usize {
                    self.state = ParseState::AwaitChecksum;
                }
            }
            ParseState::AwaitChecksum => {
                self.state = ParseState::AwaitHeader1;
                let computed = checksum(self.size, &self.payload);
                if computed == byte {
                    return Some(self.payload.split().freeze());
                }
                tracing::warn!(
                    "Checksum error: expected {:#04x}, got {:#04x} ({} byte payload dropped)",
                    computed,
                    byte,
                    self.size
                );
            }
        }
        None
    }

    /// Feed a buffer, collecting every valid payload in order
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a single socket delivery from a fresh parser state
///
/// Deliveries are assumed to be frame aligned: a frame cut off at the end of
/// `data` is dropped, not carried into the next delivery.
pub fn parse_frames(data: &[u8]) -> Vec<Bytes> {
    FrameParser::new().feed(data)
}
