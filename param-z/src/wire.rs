//! Packet and entry layouts of the parameter, list and vmem services.

use std::io::{Cursor, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const PORT_PARAM: u8 = 10;
pub const PORT_LIST: u8 = 12;
pub const PORT_VMEM: u8 = 14;

/// Latest protocol version spoken by this crate.
pub const VERSION_LATEST: u8 = 2;

pub const FLAG_END: u8 = 0x80;
pub const FLAG_NOACK: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum PacketType {
    PullRequest = 0,
    PullResponse = 1,
    PushRequest = 2,
    PushResponse = 3,
    PullAllRequest = 4,
    PullRequestV2 = 5,
    PullResponseV2 = 6,
    PushRequestV2 = 7,
    PushResponseV2 = 8,
    PullAllRequestV2 = 9,
    PushRequestV2Hwid = 10,
}

/// Version-independent meaning of a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    PullRequest,
    PullResponse,
    PushRequest,
    PushResponse,
    PullAllRequest,
    PushRequestHwid,
}

impl PacketType {
    pub fn new(kind: PacketKind, version: u8) -> Self {
        use PacketKind as K;
        match (kind, version >= 2) {
            (K::PullRequest, false) => Self::PullRequest,
            (K::PullResponse, false) => Self::PullResponse,
            (K::PushRequest, false) => Self::PushRequest,
            (K::PushResponse, false) => Self::PushResponse,
            (K::PullAllRequest, false) => Self::PullAllRequest,
            (K::PullRequest, true) => Self::PullRequestV2,
            (K::PullResponse, true) => Self::PullResponseV2,
            (K::PushRequest, true) => Self::PushRequestV2,
            (K::PushResponse, true) => Self::PushResponseV2,
            (K::PullAllRequest, true) => Self::PullAllRequestV2,
            (K::PushRequestHwid, _) => Self::PushRequestV2Hwid,
        }
    }

    pub fn kind(self) -> PacketKind {
        use PacketKind as K;
        match self {
            Self::PullRequest | Self::PullRequestV2 => K::PullRequest,
            Self::PullResponse | Self::PullResponseV2 => K::PullResponse,
            Self::PushRequest | Self::PushRequestV2 => K::PushRequest,
            Self::PushResponse | Self::PushResponseV2 => K::PushResponse,
            Self::PullAllRequest | Self::PullAllRequestV2 => K::PullAllRequest,
            Self::PushRequestV2Hwid => K::PushRequestHwid,
        }
    }

    pub fn version(self) -> u8 {
        if (self as u8) < Self::PullRequestV2 as u8 { 1 } else { 2 }
    }
}

/// `u8 type, u8 flags` prefix of every parameter packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ty: PacketType,
    pub flags: u8,
}

impl Header {
    pub fn new(kind: PacketKind, version: u8) -> Self {
        Self {
            ty: PacketType::new(kind, version),
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.ty as u8);
        out.push(self.flags);
    }

    /// Split a packet into its header and body.
    pub fn parse(packet: &[u8]) -> Result<(Header, &[u8])> {
        let [ty, flags, body @ ..] = packet else {
            return Err(Error::malformed(format!("packet of {} bytes", packet.len())));
        };
        let ty = PacketType::from_repr(*ty)
            .ok_or_else(|| Error::malformed(format!("unknown packet type {ty}")))?;
        Ok((Header { ty, flags: *flags }, body))
    }

    /// Reject a packet of another kind or protocol version than expected.
    pub fn expect(&self, kind: PacketKind, version: u8) -> Result<()> {
        let actual = self.ty.version();
        let expected = if version >= 2 { 2 } else { 1 };
        if actual != expected {
            return Err(Error::ProtocolVersionMismatch { expected, actual });
        }
        if self.ty.kind() != kind {
            return Err(Error::malformed(format!("unexpected {} packet", self.ty)));
        }
        Ok(())
    }
}

const ENTRY_ARRAY: u8 = 0x01;
const ENTRY_NODE: u8 = 0x02;
const ENTRY_TIMESTAMP: u8 = 0x04;

/// Address part of a queue entry.
///
/// `node` is absolute. It is elided on the wire when it equals the peer the
/// packet is exchanged with, and restored from the peer on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub id: u16,
    pub node: u16,
    pub offset: Option<u16>,
    pub timestamp: Option<SystemTime>,
}

impl EntryHeader {
    /// Worst-case encoded size, used for capacity accounting before the peer is known.
    pub fn max_len(version: u8, has_node: bool, has_timestamp: bool, has_offset: bool) -> usize {
        if version >= 2 {
            3 + if has_node { 2 } else { 0 } + if has_timestamp { 8 } else { 0 } + if has_offset { 2 } else { 0 }
        } else {
            2 + usize::from(has_offset)
        }
    }

    /// Check that the entry can be expressed in `version`.
    ///
    /// Version 1 carries 15-bit ids and 8-bit offsets.
    pub fn check_version(&self, version: u8) -> Result<()> {
        if version < 2 && (self.id > 0x7FFF || self.offset.is_some_and(|o| o > u16::from(u8::MAX))) {
            return Err(Error::ProtocolVersionMismatch {
                expected: 2,
                actual: version,
            });
        }
        Ok(())
    }

    pub fn write(&self, version: u8, peer: u16, out: &mut Vec<u8>) -> Result<()> {
        if version >= 2 {
            let mut flags = 0;
            if self.offset.is_some() {
                flags |= ENTRY_ARRAY;
            }
            if self.node != peer {
                flags |= ENTRY_NODE;
            }
            if self.timestamp.is_some() {
                flags |= ENTRY_TIMESTAMP;
            }
            out.write_u16::<BigEndian>(self.id)?;
            out.write_u8(flags)?;
            if self.node != peer {
                out.write_u16::<BigEndian>(self.node)?;
            }
            if let Some(ts) = self.timestamp {
                let nanos = ts.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
                out.write_u64::<BigEndian>(nanos as u64)?;
            }
            if let Some(offset) = self.offset {
                out.write_u16::<BigEndian>(offset)?;
            }
        } else {
            if self.id > 0x7FFF {
                return Err(Error::ProtocolVersionMismatch {
                    expected: 2,
                    actual: version,
                });
            }
            let array = if self.offset.is_some() { 0x8000 } else { 0 };
            out.write_u16::<BigEndian>(array | self.id)?;
            if let Some(offset) = self.offset {
                let offset = u8::try_from(offset).map_err(|_| Error::ProtocolVersionMismatch {
                    expected: 2,
                    actual: version,
                })?;
                out.write_u8(offset)?;
            }
        }
        Ok(())
    }

    pub fn read(version: u8, peer: u16, cur: &mut Cursor<&[u8]>) -> Result<Self> {
        if version >= 2 {
            let id = cur.read_u16::<BigEndian>()?;
            let flags = cur.read_u8()?;
            let node = if flags & ENTRY_NODE != 0 {
                cur.read_u16::<BigEndian>()?
            } else {
                peer
            };
            let timestamp = if flags & ENTRY_TIMESTAMP != 0 {
                let nanos = cur.read_u64::<BigEndian>()?;
                Some(UNIX_EPOCH + Duration::from_nanos(nanos))
            } else {
                None
            };
            let offset = if flags & ENTRY_ARRAY != 0 {
                Some(cur.read_u16::<BigEndian>()?)
            } else {
                None
            };
            Ok(Self {
                id,
                node,
                offset,
                timestamp,
            })
        } else {
            let raw = cur.read_u16::<BigEndian>()?;
            let offset = if raw & 0x8000 != 0 {
                Some(cur.read_u8()? as u16)
            } else {
                None
            };
            Ok(Self {
                id: raw & 0x7FFF,
                node: peer,
                offset,
                timestamp: None,
            })
        }
    }
}

/// One decoded entry of a parameter packet body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    pub header: EntryHeader,
    pub value: Option<Vec<u8>>,
}

pub fn write_value(bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::malformed(format!("value of {} bytes", bytes.len())))?;
    out.write_u16::<BigEndian>(len)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn truncated(e: Error) -> Error {
    match e {
        Error::Io(e) => Error::malformed(format!("truncated packet: {e}")),
        e => e,
    }
}

/// Decode every entry of a packet body.
pub fn read_entries(version: u8, peer: u16, body: &[u8], with_values: bool) -> Result<Vec<WireEntry>> {
    read_entries_inner(version, peer, body, with_values).map_err(truncated)
}

fn read_entries_inner(version: u8, peer: u16, body: &[u8], with_values: bool) -> Result<Vec<WireEntry>> {
    let mut cur = Cursor::new(body);
    let mut entries = Vec::new();
    while (cur.position() as usize) < body.len() {
        let header = EntryHeader::read(version, peer, &mut cur)?;
        let value = if with_values {
            let len = cur.read_u16::<BigEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            cur.read_exact(&mut bytes)?;
            Some(bytes)
        } else {
            None
        };
        entries.push(WireEntry { header, value });
    }
    Ok(entries)
}

/// Body of a pull-all request.
pub fn pull_all_masks(body: &[u8]) -> Result<(u32, u32)> {
    let mut cur = Cursor::new(body);
    let include = cur.read_u32::<BigEndian>().map_err(|e| truncated(e.into()))?;
    let exclude = cur.read_u32::<BigEndian>().map_err(|e| truncated(e.into()))?;
    Ok((include, exclude))
}

/// Trailing hardware id of a HWID push. Returns the entries part and the id.
pub fn split_hwid(body: &[u8]) -> Result<(&[u8], u32)> {
    let at = body
        .len()
        .checked_sub(4)
        .ok_or_else(|| Error::malformed("hwid push without hwid"))?;
    let (entries, hwid) = body.split_at(at);
    let hwid = Cursor::new(hwid)
        .read_u32::<BigEndian>()
        .map_err(|e| truncated(e.into()))?;
    Ok((entries, hwid))
}

pub const LIST_REQUEST: u8 = 0;
pub const LIST_RESPONSE: u8 = 1;
pub const LIST_REQUEST_V2: u8 = 2;
pub const LIST_RESPONSE_V2: u8 = 3;

pub const VMEM_READ: u8 = 1;
pub const VMEM_WRITE: u8 = 2;
pub const VMEM_LIST: u8 = 3;
pub const VMEM_UNLOCK: u8 = 6;

/// First code of the unlock handshake.
pub const VMEM_UNLOCK_CODE: u32 = 0x2814_0360;
