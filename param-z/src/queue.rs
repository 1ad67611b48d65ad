//! Bounded staging buffer batching parameter operations for one exchange.

use std::fmt::{self, Display};
use std::time::SystemTime;

use crate::codec;
use crate::error::{Error, Result};
use crate::param::ParamMeta;
use crate::registry::RawWrite;
use crate::types::{ParamKey, ParamType, QueueDirection};
use crate::value::Value;
use crate::wire::{self, EntryHeader};

/// Default capacity in bytes, one transport MTU worth of entries.
pub const DEFAULT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub key: ParamKey,
    pub name: String,
    pub ty: ParamType,
    pub array_len: u16,
    pub offset: Option<u16>,
    /// Encoded value of a SET entry; `None` for GET entries.
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<SystemTime>,
    size: usize,
}

impl QueueEntry {
    fn header(&self) -> EntryHeader {
        EntryHeader {
            id: self.key.id,
            node: self.key.node,
            offset: self.offset,
            timestamp: self.timestamp,
        }
    }
}

/// Ordered batch of GET or SET entries.
///
/// The size accounting assumes the worst-case entry layout so that the
/// serialized body never exceeds `capacity`, whichever peer it is sent to.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    direction: QueueDirection,
    version: u8,
    capacity: usize,
    used: usize,
    entries: Vec<QueueEntry>,
}

impl Queue {
    pub fn new(direction: QueueDirection, version: u8, capacity: usize) -> Self {
        Self {
            name: String::new(),
            direction,
            version,
            capacity,
            used: 0,
            entries: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> QueueDirection {
        self.direction
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes accounted so far.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.capacity - self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used = 0;
    }

    /// Stage an entry. SET queues require a value, GET queues ignore it.
    ///
    /// A full queue reports [`Error::QueueFull`] and is left unchanged.
    pub fn add(&mut self, meta: &ParamMeta, offset: Option<u16>, value: Option<&Value>) -> Result<()> {
        let bytes = match (self.direction, value) {
            (QueueDirection::Set, Some(value)) => Some(meta.encode(value, offset)?),
            (QueueDirection::Set, None) => {
                return Err(Error::TypeMismatch {
                    expected: meta.ty,
                    value: "nothing".into(),
                });
            }
            (QueueDirection::Get, _) => None,
        };
        self.add_raw(meta, offset, bytes)
    }

    pub(crate) fn add_raw(&mut self, meta: &ParamMeta, offset: Option<u16>, value: Option<Vec<u8>>) -> Result<()> {
        let entry = QueueEntry {
            key: meta.key(),
            name: meta.name.clone(),
            ty: meta.ty,
            array_len: meta.array_len,
            offset,
            value,
            timestamp: None,
            size: 0,
        };
        entry.header().check_version(self.version)?;
        // The peer is unknown until the exchange, so always count the node field.
        let size = EntryHeader::max_len(self.version, true, entry.timestamp.is_some(), offset.is_some())
            + entry.value.as_ref().map_or(0, |v| 2 + v.len());
        if size > self.free() {
            return Err(Error::QueueFull {
                needed: size,
                free: self.free(),
            });
        }
        self.entries.push(QueueEntry { size, ..entry });
        self.used += size;
        Ok(())
    }

    /// Append every entry of `other`, or none of them if they do not fit.
    pub fn append(&mut self, other: Queue) -> Result<()> {
        if other.direction != self.direction {
            return Err(Error::Config(format!(
                "cannot append a {} queue to a {} queue",
                other.direction, self.direction
            )));
        }
        if other.used > self.free() {
            return Err(Error::QueueFull {
                needed: other.used,
                free: self.free(),
            });
        }
        self.used += other.used;
        self.entries.extend(other.entries);
        Ok(())
    }

    /// Drop the `n` oldest entries, e.g. those a completed exchange carried.
    pub fn drain_front(&mut self, n: usize) {
        let n = n.min(self.entries.len());
        let freed: usize = self.entries.drain(..n).map(|e| e.size).sum();
        self.used -= freed;
    }

    /// Serialized entry list for an exchange with `peer`.
    pub fn body(&self, peer: u16) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.used);
        for entry in &self.entries {
            entry.header().write(self.version, peer, &mut out)?;
            if let Some(value) = &entry.value {
                wire::write_value(value, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Staged SET entries as registry writes, for applying locally.
    pub(crate) fn to_writes(&self) -> Vec<RawWrite> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.value.as_ref().map(|v| RawWrite {
                    key: e.key,
                    offset: e.offset,
                    bytes: v.clone(),
                    timestamp: e.timestamp,
                })
            })
            .collect()
    }
}

impl Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() { "<anonymous>" } else { &self.name };
        writeln!(
            f,
            "Queue {name} ({}, v{}, {}/{} bytes, {} entries)",
            self.direction,
            self.version,
            self.used,
            self.capacity,
            self.entries.len()
        )?;
        for entry in &self.entries {
            write!(f, "  {}:{}", entry.key.node, entry.name)?;
            if let Some(offset) = entry.offset {
                write!(f, "[{offset}]")?;
            }
            if let Some(raw) = &entry.value {
                match codec::decode(entry.ty, entry.array_len, raw, entry.offset) {
                    Ok(value) => write!(f, " = {}", codec::format_value(entry.ty, &value))?,
                    Err(_) => write!(f, " = <{} bytes>", raw.len())?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
