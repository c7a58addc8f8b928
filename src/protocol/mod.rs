//! Protocol module - Defines the wire protocol between host and peer
//!
//! Every packet travels in a fixed frame:
//! - 2 header bytes (0xBE 0xEF)
//! - 1 byte payload size
//! - Payload (up to 255 bytes), first byte is the packet id
//! - 1 byte XOR checksum over size and payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default TCP port, also used as the UDP discovery port
pub const DEFAULT_PORT: u16 = 2342;

/// First frame header byte
pub const HEADER_1: u8 = 0xBE;

/// Second frame header byte
pub const HEADER_2: u8 = 0xEF;

/// Largest payload a single size byte can announce
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Header, size and checksum bytes around every payload
pub const FRAME_OVERHEAD: usize = 4;
