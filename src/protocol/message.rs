//! Packet definitions
//!
//! Payload layouts exchanged inside frames. All records are packed with no
//! padding, multi-byte fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Packet decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("Empty payload")]
    Empty,

    #[error("Unknown packet id: {0}")]
    UnknownId(u8),

    #[error("{kind} packet too short: {actual} bytes (need {expected})")]
    TooShort {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}

pub type PacketResult<T> = Result<T, PacketError>;

/// Leading payload byte identifying the packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketId {
    Handshake = 0,
    /// Host to peer: session status or vessel data
    Status = 1,
    Control = 101,
}

impl TryFrom<u8> for PacketId {
    type Error = PacketError;

    fn try_from(id: u8) -> PacketResult<Self> {
        match id {
            0 => Ok(PacketId::Handshake),
            1 => Ok(PacketId::Status),
            101 => Ok(PacketId::Control),
            other => Err(PacketError::UnknownId(other)),
        }
    }
}

/// Markers a peer must send to complete the handshake
pub const HANDSHAKE_MARKERS: (u8, u8, u8) = (3, 1, 4);

/// Markers the host puts in its discovery broadcast; the third byte is replaced
/// by the current status
pub const BROADCAST_MARKERS: (u8, u8) = (1, 2);

/// Four byte handshake record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacket {
    pub m1: u8,
    pub m2: u8,
    pub m3: u8,
}

impl HandshakePacket {
    pub const SIZE: usize = 4;

    pub fn new(m1: u8, m2: u8, m3: u8) -> Self {
        Self { m1, m2, m3 }
    }

    /// The handshake a peer sends to the host
    pub fn peer() -> Self {
        let (m1, m2, m3) = HANDSHAKE_MARKERS;
        Self::new(m1, m2, m3)
    }

    /// The handshake-shaped discovery broadcast carrying the host status
    pub fn broadcast(status: HostStatus) -> Self {
        let (m1, m2) = BROADCAST_MARKERS;
        Self::new(m1, m2, status.to_byte())
    }

    /// True only for the agreed peer markers
    pub fn is_valid(&self) -> bool {
        (self.m1, self.m2, self.m3) == HANDSHAKE_MARKERS
    }

    pub fn from_payload(payload: &[u8]) -> PacketResult<Self> {
        check_len("Handshake", payload, Self::SIZE)?;
        Ok(Self::new(payload[1], payload[2], payload[3]))
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&[PacketId::Handshake as u8, self.m1, self.m2, self.m3])
    }
}

/// Host session state reported to the peer
///
/// Only equality matters to the link itself; the named values are what the
/// host application reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HostStatus {
    #[default]
    Undefined,
    NotInFlight,
    InFlight,
    Other(u8),
}

impl HostStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => HostStatus::Undefined,
            1 => HostStatus::NotInFlight,
            2 => HostStatus::InFlight,
            other => HostStatus::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            HostStatus::Undefined => 0,
            HostStatus::NotInFlight => 1,
            HostStatus::InFlight => 2,
            HostStatus::Other(b) => b,
        }
    }
}

/// Two byte status record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket {
    pub status: HostStatus,
}

impl StatusPacket {
    pub const SIZE: usize = 2;

    pub fn new(status: HostStatus) -> Self {
        Self { status }
    }

    pub fn from_payload(payload: &[u8]) -> PacketResult<Self> {
        check_len("Status", payload, Self::SIZE)?;
        Ok(Self::new(HostStatus::from_byte(payload[1])))
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&[PacketId::Status as u8, self.status.to_byte()])
    }
}

/// Bits of [`ControlPacket::main_controls`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MainControls {
    pub sas: bool,
    pub rcs: bool,
    pub lights: bool,
    pub gear: bool,
    pub brakes: bool,
    pub precision: bool,
    pub abort: bool,
    pub stage: bool,
}

impl MainControls {
    pub fn to_bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.sas {
            bits |= 0x01;
        }
        if self.rcs {
            bits |= 0x02;
        }
        if self.lights {
            bits |= 0x04;
        }
        if self.gear {
            bits |= 0x08;
        }
        if self.brakes {
            bits |= 0x10;
        }
        if self.precision {
            bits |= 0x20;
        }
        if self.abort {
            bits |= 0x40;
        }
        if self.stage {
            bits |= 0x80;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            sas: bits & 0x01 != 0,
            rcs: bits & 0x02 != 0,
            lights: bits & 0x04 != 0,
            gear: bits & 0x08 != 0,
            brakes: bits & 0x10 != 0,
            precision: bits & 0x20 != 0,
            abort: bits & 0x40 != 0,
            stage: bits & 0x80 != 0,
        }
    }
}

/// Snapshot of the peer's control inputs
///
/// Axis values range -1000..=1000, throttles 0..=1000.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPacket {
    pub main_controls: u8,
    /// UI mode in the low nibble, camera mode in the high nibble
    pub mode: u8,
    /// Action groups 1-10 in bits 1-10
    pub control_group: u16,
    /// SAS mode in the low nibble, navball speed mode in the high nibble
    pub navball_sas_mode: u8,
    /// Bit 0: open menu, bit 1: open map
    pub additional_control: u8,
    pub pitch: i16,
    pub roll: i16,
    pub yaw: i16,
    pub tx: i16,
    pub ty: i16,
    pub tz: i16,
    pub wheel_steer: i16,
    pub throttle: i16,
    pub wheel_throttle: i16,
}

impl ControlPacket {
    pub const SIZE: usize = 25;

    pub fn from_payload(payload: &[u8]) -> PacketResult<Self> {
        check_len("Control", payload, Self::SIZE)?;

        let mut buf = &payload[1..Self::SIZE];
        Ok(Self {
            main_controls: buf.get_u8(),
            mode: buf.get_u8(),
            control_group: buf.get_u16_le(),
            navball_sas_mode: buf.get_u8(),
            additional_control: buf.get_u8(),
            pitch: buf.get_i16_le(),
            roll: buf.get_i16_le(),
            yaw: buf.get_i16_le(),
            tx: buf.get_i16_le(),
            ty: buf.get_i16_le(),
            tz: buf.get_i16_le(),
            wheel_steer: buf.get_i16_le(),
            throttle: buf.get_i16_le(),
            wheel_throttle: buf.get_i16_le(),
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(PacketId::Control as u8);
        buf.put_u8(self.main_controls);
        buf.put_u8(self.mode);
        buf.put_u16_le(self.control_group);
        buf.put_u8(self.navball_sas_mode);
        buf.put_u8(self.additional_control);
        for axis in [
            self.pitch,
            self.roll,
            self.yaw,
            self.tx,
            self.ty,
            self.tz,
            self.wheel_steer,
            self.throttle,
            self.wheel_throttle,
        ] {
            buf.put_i16_le(axis);
        }
        buf.freeze()
    }

    pub fn controls(&self) -> MainControls {
        MainControls::from_bits(self.main_controls)
    }

    pub fn ui_mode(&self) -> u8 {
        self.mode & 0x0F
    }

    pub fn camera_mode(&self) -> u8 {
        self.mode >> 4
    }

    /// Whether action group `n` (1-10) is set
    pub fn control_group(&self, n: u8) -> bool {
        (1..=10).contains(&n) && (self.control_group >> n) & 1 == 1
    }

    pub fn sas_mode(&self) -> u8 {
        self.navball_sas_mode & 0x0F
    }

    pub fn speed_mode(&self) -> u8 {
        self.navball_sas_mode >> 4
    }

    pub fn open_menu(&self) -> bool {
        self.additional_control & 0x01 != 0
    }

    pub fn open_map(&self) -> bool {
        self.additional_control & 0x02 != 0
    }
}

/// A classified inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(HandshakePacket),
    Status(StatusPacket),
    Control(ControlPacket),
}

impl Packet {
    /// Classify a payload by its leading id byte
    pub fn parse(payload: &[u8]) -> PacketResult<Self> {
        let id = *payload.first().ok_or(PacketError::Empty)?;
        match PacketId::try_from(id)? {
            PacketId::Handshake => HandshakePacket::from_payload(payload).map(Packet::Handshake),
            PacketId::Status => StatusPacket::from_payload(payload).map(Packet::Status),
            PacketId::Control => ControlPacket::from_payload(payload).map(Packet::Control),
        }
    }

    pub fn id(&self) -> PacketId {
        match self {
            Packet::Handshake(_) => PacketId::Handshake,
            Packet::Status(_) => PacketId::Status,
            Packet::Control(_) => PacketId::Control,
        }
    }
}

fn check_len(kind: &'static str, payload: &[u8], expected: usize) -> PacketResult<()> {
    if payload.len() < expected {
        return Err(PacketError::TooShort {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}
