//! Parameter metadata and registry-owned parameter state.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::types::{ParamKey, ParamMask, ParamType, Storage};
use crate::value::Value;

/// Static description of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamMeta {
    pub id: u16,
    pub node: u16,
    pub name: String,
    pub ty: ParamType,
    /// 1 for scalars. Byte length for strings and data.
    pub array_len: u16,
    pub mask: ParamMask,
    pub unit: String,
    pub docstr: String,
    pub storage: Storage,
}

impl ParamMeta {
    pub fn new(id: u16, name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            id,
            node: 0,
            name: name.into(),
            ty,
            array_len: 1,
            mask: ParamMask::empty(),
            unit: String::new(),
            docstr: String::new(),
            storage: Storage::Ram,
        }
    }

    pub fn with_node(mut self, node: u16) -> Self {
        self.node = node;
        self
    }

    pub fn with_array_len(mut self, len: u16) -> Self {
        self.array_len = len.max(1);
        self
    }

    pub fn with_mask(mut self, mask: ParamMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_doc(mut self, docstr: impl Into<String>) -> Self {
        self.docstr = docstr.into();
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn key(&self) -> ParamKey {
        ParamKey::new(self.node, self.id)
    }

    /// Array-ness as seen by callers. Strings and data are single values.
    pub fn is_array(&self) -> bool {
        self.array_len > 1 && !self.ty.is_bytes()
    }

    pub fn is_vmem(&self) -> bool {
        matches!(self.storage, Storage::Vmem { .. })
    }

    pub fn byte_len(&self) -> usize {
        codec::region_len(self.ty, self.array_len, None)
    }

    /// Resolve a caller offset against this parameter's array length.
    pub fn resolve_offset(&self, offset: Option<i32>) -> Result<Option<u16>> {
        offset
            .map(|o| codec::resolve_offset(o, self.array_len.max(1)))
            .transpose()
    }

    pub fn encode(&self, value: &Value, offset: Option<u16>) -> Result<Vec<u8>> {
        codec::encode(self.ty, self.array_len, value, offset)
    }

    pub fn decode(&self, raw: &[u8], offset: Option<u16>) -> Result<Value> {
        codec::decode(self.ty, self.array_len, raw, offset)
    }

    /// Byte range of the addressed region inside the raw buffer.
    pub fn byte_range(&self, offset: Option<u16>) -> std::ops::Range<usize> {
        match offset {
            Some(i) => {
                let size = self.ty.element_size();
                i as usize * size..(i as usize + 1) * size
            }
            None => 0..self.byte_len(),
        }
    }
}

/// A parameter as held by the registry: metadata plus its current raw value.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub meta: ParamMeta,
    raw: Vec<u8>,
    timestamp: Option<SystemTime>,
}

impl Parameter {
    pub fn new(meta: ParamMeta) -> Self {
        let raw = vec![0u8; meta.byte_len()];
        Self {
            meta,
            raw,
            timestamp: None,
        }
    }

    pub fn with_value(meta: ParamMeta, value: &Value) -> Result<Self> {
        let mut param = Self::new(meta);
        let raw = param.meta.encode(value, None)?;
        param.raw = raw;
        Ok(param)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_at(&self, offset: Option<u16>) -> Result<&[u8]> {
        self.raw
            .get(self.meta.byte_range(offset))
            .ok_or(Error::IndexOutOfRange {
                offset: offset.map_or(0, i32::from),
                len: self.meta.array_len,
            })
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    pub fn value(&self, offset: Option<u16>) -> Result<Value> {
        self.meta.decode(self.raw_at(offset)?, offset)
    }

    /// Overwrite the addressed region with already-encoded bytes.
    pub fn write_raw(&mut self, offset: Option<u16>, bytes: &[u8], at: Option<SystemTime>) -> Result<()> {
        let range = self.meta.byte_range(offset);
        if range.end > self.raw.len() || bytes.len() != range.len() {
            return Err(Error::malformed(format!(
                "{} expects {} bytes at {:?}, got {}",
                self.meta.name,
                range.len(),
                offset,
                bytes.len()
            )));
        }
        self.raw[range].copy_from_slice(bytes);
        self.timestamp = Some(at.unwrap_or_else(SystemTime::now));
        Ok(())
    }
}

/// Parameter descriptor exchanged by list download (v1 layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntryV1 {
    pub id: u16,
    pub node: u16,
    pub ty: u8,
    pub size: u16,
    pub mask: u32,
    pub name: String,
}

/// Parameter descriptor exchanged by list download (v2 layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntryV2 {
    pub id: u16,
    pub node: u16,
    pub ty: u8,
    pub size: u16,
    pub mask: u32,
    pub name: String,
    pub unit: String,
    pub docstr: String,
}

impl From<&ParamMeta> for ListEntryV2 {
    fn from(meta: &ParamMeta) -> Self {
        Self {
            id: meta.id,
            node: meta.node,
            ty: meta.ty.code(),
            size: meta.array_len,
            mask: meta.mask.bits(),
            name: meta.name.clone(),
            unit: meta.unit.clone(),
            docstr: meta.docstr.clone(),
        }
    }
}

impl From<&ParamMeta> for ListEntryV1 {
    fn from(meta: &ParamMeta) -> Self {
        Self {
            id: meta.id,
            node: meta.node,
            ty: meta.ty.code(),
            size: meta.array_len,
            mask: meta.mask.bits(),
            name: meta.name.clone(),
        }
    }
}

impl From<ListEntryV1> for ListEntryV2 {
    fn from(v1: ListEntryV1) -> Self {
        Self {
            id: v1.id,
            node: v1.node,
            ty: v1.ty,
            size: v1.size,
            mask: v1.mask,
            name: v1.name,
            unit: String::new(),
            docstr: String::new(),
        }
    }
}

impl ListEntryV2 {
    /// Metadata for a remote cache entry. Descriptors for node 0 belong to `peer`.
    pub fn into_meta(self, peer: u16) -> Result<ParamMeta> {
        let node = if self.node == 0 { peer } else { self.node };
        Ok(ParamMeta {
            id: self.id,
            node,
            name: self.name,
            ty: ParamType::from_code(self.ty)?,
            array_len: self.size.max(1),
            mask: ParamMask::from_bits_retain(self.mask),
            unit: self.unit,
            docstr: self.docstr,
            storage: Storage::Remote,
        })
    }
}
