//! flipmesh wire format: everything that crosses a TCP connection.
//!
//! There is no outer framing. A connection starts with a raw two-byte port
//! preamble from the dialing side, then carries a sequence of tagged packets:
//!
//! ```text
//! preamble     [port:2 LE]                                   (once, untagged)
//! AddPeer      [0x01][family:1][address:4|16][port:2 LE]
//! ChangeState  [0x02][timestamp:8 LE][state:1]
//! ```
//!
//! Fixed-size bodies are zerocopy structs with little-endian integer fields,
//! so their layout is checked at compile time. The tag byte is read on its
//! own, then the body decoder for that tag runs.

use std::io;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::peer::{AddressFamily, Peer, IPV4_LEN, IPV6_LEN};

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Leading byte of every packet after the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketTag {
    /// Announces a peer the sender knows about.
    AddPeer = 0x01,
    /// Carries a timestamped value of the replicated register.
    ChangeState = 0x02,
}

impl TryFrom<u8> for PacketTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketTag::AddPeer),
            0x02 => Ok(PacketTag::ChangeState),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketTag> for u8 {
    fn from(tag: PacketTag) -> u8 {
        tag as u8
    }
}

/// Family byte for a 4-byte address.
pub const FAMILY_IPV4: u8 = 0x04;

/// Family byte for a 16-byte address.
pub const FAMILY_IPV6: u8 = 0x06;

impl From<AddressFamily> for u8 {
    fn from(family: AddressFamily) -> u8 {
        match family {
            AddressFamily::V4 => FAMILY_IPV4,
            AddressFamily::V6 => FAMILY_IPV6,
        }
    }
}

const STATE_FALSE: u8 = 0x00;
const STATE_TRUE: u8 = 0x01;

/// Largest encoded packet: an IPv6 AddPeer.
pub const MAX_PACKET_LEN: usize = 1 + 1 + size_of::<Ipv6PeerBody>();

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Wall-clock instant as nanoseconds since the Unix epoch.
///
/// This is the unit carried by ChangeState and the ordering key of the
/// last-writer-wins register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch. Initial timestamp of a fresh register.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current wall-clock time. Clocks before the epoch read as the epoch.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(nanos)
    }
}

// ── Fixed layouts ─────────────────────────────────────────────────────────────

/// Connect-time preamble: the dialing node's listen port.
///
/// Sent exactly once, by the dialer, before any tagged packet.
/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PortPreamble {
    pub port: U16<LittleEndian>,
}

assert_eq_size!(PortPreamble, [u8; 2]);

impl PortPreamble {
    pub fn new(port: u16) -> Self {
        Self {
            port: U16::new(port),
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        let mut out = [0u8; 2];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// AddPeer body after the family byte, IPv4 variant.
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Ipv4PeerBody {
    pub address: [u8; IPV4_LEN],
    pub port: U16<LittleEndian>,
}

assert_eq_size!(Ipv4PeerBody, [u8; 6]);

/// AddPeer body after the family byte, IPv6 variant.
/// Wire size: 18 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Ipv6PeerBody {
    pub address: [u8; IPV6_LEN],
    pub port: U16<LittleEndian>,
}

assert_eq_size!(Ipv6PeerBody, [u8; 18]);

/// ChangeState body after the tag.
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChangeStateBody {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: U64<LittleEndian>,
    /// 0x00 = false, 0x01 = true. Anything else is a protocol violation.
    pub state: u8,
}

assert_eq_size!(ChangeStateBody, [u8; 9]);

// ── Packets ───────────────────────────────────────────────────────────────────

/// Announcement of a peer the sender is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPeer {
    pub peer: Peer,
}

/// A value of the replicated register and when it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeState {
    pub state: bool,
    /// `None` is stamped with the current time at encode.
    pub timestamp: Option<Timestamp>,
}

impl ChangeState {
    pub fn new(state: bool, timestamp: Timestamp) -> Self {
        Self {
            state,
            timestamp: Some(timestamp),
        }
    }

    /// A change with no timestamp yet. Stamped when encoded.
    pub fn unstamped(state: bool) -> Self {
        Self {
            state,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    AddPeer(AddPeer),
    ChangeState(ChangeState),
}

impl Packet {
    pub fn tag(&self) -> PacketTag {
        match self {
            Packet::AddPeer(_) => PacketTag::AddPeer,
            Packet::ChangeState(_) => PacketTag::ChangeState,
        }
    }

    /// Encode into a fresh buffer. Never fails.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Packet::AddPeer(p) => p.encode_into(buf),
            Packet::ChangeState(s) => s.encode_into(buf),
        }
    }
}

impl From<AddPeer> for Packet {
    fn from(p: AddPeer) -> Self {
        Packet::AddPeer(p)
    }
}

impl From<ChangeState> for Packet {
    fn from(s: ChangeState) -> Self {
        Packet::ChangeState(s)
    }
}

impl AddPeer {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketTag::AddPeer.into());
        buf.put_u8(self.peer.family().into());
        let port = U16::new(self.peer.port());
        match self.peer.ip() {
            IpAddr::V4(v4) => {
                let body = Ipv4PeerBody {
                    address: v4.octets(),
                    port,
                };
                buf.put_slice(body.as_bytes());
            }
            IpAddr::V6(v6) => {
                let body = Ipv6PeerBody {
                    address: v6.octets(),
                    port,
                };
                buf.put_slice(body.as_bytes());
            }
        }
    }

    /// Decode the body that follows an AddPeer tag.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let family = reader.read_u8().await?;
        let peer = match family {
            FAMILY_IPV4 => {
                let mut body = Ipv4PeerBody::new_zeroed();
                reader.read_exact(body.as_bytes_mut()).await?;
                Peer::new(IpAddr::V4(Ipv4Addr::from(body.address)), body.port.get())
            }
            FAMILY_IPV6 => {
                let mut body = Ipv6PeerBody::new_zeroed();
                reader.read_exact(body.as_bytes_mut()).await?;
                Peer::new(IpAddr::V6(Ipv6Addr::from(body.address)), body.port.get())
            }
            other => return Err(WireError::InvalidAddressFamily(other)),
        };
        Ok(Self { peer })
    }
}

impl ChangeState {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let timestamp = self.timestamp.unwrap_or_else(Timestamp::now);
        let body = ChangeStateBody {
            timestamp: U64::new(timestamp.as_nanos()),
            state: if self.state { STATE_TRUE } else { STATE_FALSE },
        };
        buf.put_u8(PacketTag::ChangeState.into());
        buf.put_slice(body.as_bytes());
    }

    /// Decode the body that follows a ChangeState tag.
    ///
    /// The decoded value always carries a timestamp.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let mut body = ChangeStateBody::new_zeroed();
        reader.read_exact(body.as_bytes_mut()).await?;
        let state = match body.state {
            STATE_FALSE => false,
            STATE_TRUE => true,
            other => return Err(WireError::InvalidState(other)),
        };
        Ok(Self::new(state, Timestamp::from_nanos(body.timestamp.get())))
    }
}

// ── Readers ───────────────────────────────────────────────────────────────────

/// Read one tag byte.
pub async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PacketTag, WireError> {
    let tag = reader.read_u8().await?;
    PacketTag::try_from(tag)
}

/// Decode the body for an already-read tag.
pub async fn read_body<R: AsyncRead + Unpin>(
    tag: PacketTag,
    reader: &mut R,
) -> Result<Packet, WireError> {
    match tag {
        PacketTag::AddPeer => AddPeer::read_from(reader).await.map(Packet::AddPeer),
        PacketTag::ChangeState => ChangeState::read_from(reader).await.map(Packet::ChangeState),
    }
}

/// Read a tag and its body.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, WireError> {
    let tag = read_tag(reader).await?;
    read_body(tag, reader).await
}

/// Read the connect-time port preamble.
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16, WireError> {
    let mut preamble = PortPreamble::new_zeroed();
    reader.read_exact(preamble.as_bytes_mut()).await?;
    Ok(preamble.port.get())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("stream ended before the field was complete")]
    ShortRead,

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid address family: 0x{0:02x}")]
    InvalidAddressFamily(u8),

    #[error("invalid state byte: 0x{0:02x}")]
    InvalidState(u8),

    #[error("read failed: {0}")]
    Io(io::Error),
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::ShortRead
        } else {
            WireError::Io(e)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
