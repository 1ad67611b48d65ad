//! Process-wide parameter registry.
//!
//! The registry exclusively owns every parameter's storage. Callers resolve an
//! identifier to a [`ParamKey`] and then read or write through the registry;
//! nothing hands out references into the map. A single coarse lock guards all
//! mutation and is never held across a network round trip.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::ops::{Bound, Range};
use std::sync::Arc;
use std::time::SystemTime;

use globset::Glob;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::param::{ParamMeta, Parameter};
use crate::types::{LOCAL_NODE, ParamIdent, ParamKey, ParamMask, ParamType, Storage};
use crate::value::Value;
use crate::vmem::VmemTable;

/// A decoded write destined for the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWrite {
    pub key: ParamKey,
    pub offset: Option<u16>,
    pub bytes: Vec<u8>,
    pub timestamp: Option<SystemTime>,
}

#[derive(Default)]
struct RegistryData {
    params: BTreeMap<ParamKey, Parameter>,
    names: HashMap<(u16, String), u16>,
}

impl RegistryData {
    fn insert(&mut self, param: Parameter) -> bool {
        let key = param.meta.key();
        let name_key = (key.node, param.meta.name.clone());
        if self.params.contains_key(&key) || self.names.contains_key(&name_key) {
            return false;
        }
        self.names.insert(name_key, key.id);
        self.params.insert(key, param);
        true
    }

    fn remove(&mut self, key: &ParamKey) -> Option<Parameter> {
        let param = self.params.remove(key)?;
        self.names.remove(&(key.node, param.meta.name.clone()));
        Some(param)
    }
}

pub struct Registry {
    data: Mutex<RegistryData>,
    vmem: Arc<VmemTable>,
}

impl Registry {
    pub fn new(vmem: Arc<VmemTable>) -> Self {
        Self {
            data: Mutex::new(RegistryData::default()),
            vmem,
        }
    }

    pub fn vmem(&self) -> &Arc<VmemTable> {
        &self.vmem
    }

    /// Register a parameter. Vmem-backed parameters load their value from the
    /// region; `initial` only seeds RAM and remote parameters.
    pub fn register(&self, meta: ParamMeta, initial: Option<&Value>) -> Result<ParamKey> {
        let key = meta.key();
        let param = match (initial, meta.storage) {
            (_, Storage::Vmem { region, address }) => {
                let bytes = self.vmem.read(region, address, meta.byte_len() as u32)?;
                let mut param = Parameter::new(meta);
                param.write_raw(None, &bytes, None)?;
                param
            }
            (Some(value), _) => Parameter::with_value(meta, value)?,
            (None, _) => Parameter::new(meta),
        };
        let name = param.meta.name.clone();
        if !self.data.lock().insert(param) {
            return Err(Error::Config(format!(
                "parameter {key} '{name}' is already registered"
            )));
        }
        debug!("[REG] registered {name} ({key})");
        Ok(key)
    }

    /// Insert a remote cache entry unless its id or name is already known.
    pub fn insert_if_absent(&self, meta: ParamMeta) -> bool {
        self.data.lock().insert(Parameter::new(meta))
    }

    /// Resolve an identifier on `node` to the parameter's metadata.
    pub fn find(&self, ident: &ParamIdent, node: u16) -> Result<ParamMeta> {
        let data = self.data.lock();
        let key = match ident {
            ParamIdent::Name(name) => data
                .names
                .get(&(node, name.clone()))
                .map(|id| ParamKey::new(node, *id)),
            ParamIdent::Id(id) => Some(ParamKey::new(node, *id)),
            ParamIdent::Key(key) => Some(*key),
        };
        key.and_then(|k| data.params.get(&k))
            .map(|p| p.meta.clone())
            .ok_or_else(|| Error::NotFound {
                ident: ident.to_string(),
                node: match ident {
                    ParamIdent::Key(key) => key.node,
                    _ => node,
                },
            })
    }

    pub fn meta(&self, key: ParamKey) -> Result<ParamMeta> {
        self.find(&ParamIdent::Key(key), key.node)
    }

    pub fn contains(&self, key: ParamKey) -> bool {
        self.data.lock().params.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.data.lock().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, key: ParamKey, offset: Option<u16>) -> Result<Value> {
        let data = self.data.lock();
        let param = data.params.get(&key).ok_or_else(|| not_found(key))?;
        param.value(offset)
    }

    pub fn read_raw(&self, key: ParamKey, offset: Option<u16>) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let param = data.params.get(&key).ok_or_else(|| not_found(key))?;
        Ok(param.raw_at(offset)?.to_vec())
    }

    pub fn timestamp(&self, key: ParamKey) -> Option<SystemTime> {
        self.data.lock().params.get(&key).and_then(|p| p.timestamp())
    }

    /// Encode and store a value locally.
    pub fn write_value(&self, key: ParamKey, offset: Option<u16>, value: &Value) -> Result<()> {
        let meta = self.meta(key)?;
        let bytes = meta.encode(value, offset)?;
        self.apply(vec![RawWrite {
            key,
            offset,
            bytes,
            timestamp: None,
        }])
        .map(|_| ())
    }

    /// Apply a batch of writes all-or-nothing.
    ///
    /// Every write is validated before any is stored. Writes to unknown keys are
    /// skipped with a diagnostic. Returns the number of writes applied.
    pub fn apply(&self, writes: Vec<RawWrite>) -> Result<usize> {
        let mut data = self.data.lock();
        let mut known = Vec::with_capacity(writes.len());
        for w in writes {
            let Some(param) = data.params.get(&w.key) else {
                warn!("[REG] skipping value for unknown parameter {}", w.key);
                continue;
            };
            let range = param.meta.byte_range(w.offset);
            if range.end > param.raw().len() || range.len() != w.bytes.len() {
                return Err(Error::malformed(format!(
                    "{} expects {} bytes, got {}",
                    param.meta.name,
                    range.len(),
                    w.bytes.len()
                )));
            }
            if let Storage::Vmem { region, address } = param.meta.storage {
                self.vmem.check(region, address + range.start as u32, range.len())?;
            }
            known.push(w);
        }

        let count = known.len();
        for w in known {
            let Some(param) = data.params.get_mut(&w.key) else {
                continue;
            };
            // The region is written first so a failed write-through leaves the cache as it was.
            if let Storage::Vmem { region, address } = param.meta.storage {
                let at = address + param.meta.byte_range(w.offset).start as u32;
                self.vmem.write(region, at, &w.bytes).inspect_err(|e| {
                    warn!("[REG] write-through of {} failed: {e}", param.meta.name);
                })?;
            }
            param.write_raw(w.offset, &w.bytes, w.timestamp)?;
        }
        Ok(count)
    }

    /// Reload the vmem-backed parameters overlapping `range` of `region`,
    /// after the region was written directly. Returns how many were reloaded.
    pub fn reload_region(&self, region: u16, range: Range<u32>) -> Result<usize> {
        let mut data = self.data.lock();
        let mut reloaded = 0;
        for param in data.params.values_mut() {
            let Storage::Vmem { region: r, address } = param.meta.storage else {
                continue;
            };
            let len = param.meta.byte_len() as u32;
            if r != region || address + len <= range.start || address >= range.end {
                continue;
            }
            let bytes = self.vmem.read(region, address, len)?;
            param.write_raw(None, &bytes, None)?;
            reloaded += 1;
        }
        if reloaded > 0 {
            debug!("[REG] reloaded {reloaded} parameters from region {region}");
        }
        Ok(reloaded)
    }

    /// Lazy, restartable pass over all parameters in (node, id) order.
    pub fn iter(&self) -> RegistryIter<'_> {
        RegistryIter {
            registry: self,
            last: None,
        }
    }

    /// Parameters matching a mask, an optional node and an optional name glob.
    ///
    /// `ParamMask::all()` disables mask filtering so unflagged parameters show.
    pub fn list(&self, mask: ParamMask, node: Option<u16>, glob: Option<&str>) -> Result<Vec<ParamMeta>> {
        let matcher = glob
            .map(|g| Glob::new(g).map(|g| g.compile_matcher()))
            .transpose()
            .map_err(|e| Error::Config(format!("bad name pattern: {e}")))?;
        Ok(self
            .iter()
            .filter(|m| node.is_none_or(|n| m.node == n))
            .filter(|m| mask == ParamMask::all() || m.mask.intersects(mask))
            .filter(|m| matcher.as_ref().is_none_or(|g| g.is_match(&m.name)))
            .collect())
    }

    /// Local parameters selected for a bulk pull.
    pub fn select(&self, include: ParamMask, exclude: ParamMask, node: u16) -> Vec<ParamMeta> {
        self.iter()
            .filter(|m| m.node == node && m.mask.matches(include, exclude))
            .collect()
    }

    /// Remove every entry of `node`, or every remote entry when `node` is `None`.
    pub fn forget(&self, node: Option<u16>, verbose: bool) -> usize {
        let mut data = self.data.lock();
        let keys: Vec<ParamKey> = data
            .params
            .keys()
            .filter(|k| match node {
                Some(n) => k.node == n,
                None => k.node != LOCAL_NODE,
            })
            .copied()
            .collect();
        for key in &keys {
            if let Some(param) = data.remove(key) {
                if verbose {
                    info!("[REG] forgot {} ({key})", param.meta.name);
                }
            }
        }
        keys.len()
    }

    /// Write `list add` lines describing the selected parameters.
    pub fn save_list<W: Write>(&self, out: &mut W, node: Option<u16>, include_node: bool) -> Result<usize> {
        let mut count = 0;
        for meta in self.iter().filter(|m| node.is_none_or(|n| m.node == n)) {
            write!(out, "list add ")?;
            if meta.array_len > 1 {
                write!(out, "-a {} ", meta.array_len)?;
            }
            if !meta.docstr.is_empty() {
                write!(out, "-c \"{}\" ", meta.docstr)?;
            }
            if !meta.unit.is_empty() {
                write!(out, "-u \"{}\" ", meta.unit)?;
            }
            if meta.node != LOCAL_NODE && include_node {
                write!(out, "-n {} ", meta.node)?;
            }
            if !meta.mask.is_empty() {
                write!(out, "-m \"{}\" ", meta.mask)?;
            }
            writeln!(out, "{} {} {}", meta.name, meta.id, meta.ty)?;
            count += 1;
        }
        Ok(count)
    }

    /// Register parameters from `list add` lines. Entries already known are skipped.
    ///
    /// Parameters without `-n` are attributed to `default_node`.
    pub fn load_list<R: BufRead>(&self, input: R, default_node: u16) -> Result<usize> {
        let mut added = 0;
        for (lineno, line) in input.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let meta = parse_list_add(line, default_node)
                .map_err(|e| Error::Config(format!("line {}: {e}", lineno + 1)))?;
            if self.insert_if_absent(meta) {
                added += 1;
            } else {
                debug!("[REG] line {} already known, skipped", lineno + 1);
            }
        }
        Ok(added)
    }
}

fn not_found(key: ParamKey) -> Error {
    Error::NotFound {
        ident: key.to_string(),
        node: key.node,
    }
}

pub struct RegistryIter<'a> {
    registry: &'a Registry,
    last: Option<ParamKey>,
}

impl Iterator for RegistryIter<'_> {
    type Item = ParamMeta;

    fn next(&mut self) -> Option<ParamMeta> {
        let data = self.registry.data.lock();
        let lower = match self.last {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let (key, param) = data.params.range((lower, Bound::Unbounded)).next()?;
        self.last = Some(*key);
        Some(param.meta.clone())
    }
}

fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => token.push(ch),
                    None => return Err("unterminated quote".into()),
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn parse_list_add(line: &str, default_node: u16) -> std::result::Result<ParamMeta, String> {
    let tokens = tokenize(line)?;
    let mut it = tokens.into_iter();
    if it.next().as_deref() != Some("list") || it.next().as_deref() != Some("add") {
        return Err("expected 'list add'".into());
    }

    let (mut array_len, mut doc, mut unit, mut node, mut mask) =
        (1u16, String::new(), String::new(), default_node, ParamMask::empty());
    let mut positional = Vec::new();
    while let Some(tok) = it.next() {
        let mut arg = |flag: &str| it.next().ok_or_else(|| format!("{flag} needs a value"));
        match tok.as_str() {
            "-a" => array_len = arg("-a")?.parse().map_err(|e| format!("-a: {e}"))?,
            "-c" => doc = arg("-c")?,
            "-u" => unit = arg("-u")?,
            "-n" => node = arg("-n")?.parse().map_err(|e| format!("-n: {e}"))?,
            "-m" => mask = arg("-m")?.parse().map_err(|e: Error| e.to_string())?,
            _ => positional.push(tok),
        }
    }
    let [name, id, ty] = <[String; 3]>::try_from(positional)
        .map_err(|_| "expected <name> <id> <type>".to_string())?;
    let id: u16 = id.parse().map_err(|e| format!("id: {e}"))?;
    let ty: ParamType = ty.parse().map_err(|_| format!("unknown type '{ty}'"))?;
    let storage = if node == LOCAL_NODE {
        Storage::Ram
    } else {
        Storage::Remote
    };
    Ok(ParamMeta::new(id, name, ty)
        .with_node(node)
        .with_array_len(array_len)
        .with_doc(doc)
        .with_unit(unit)
        .with_mask(mask)
        .with_storage(storage))
}
