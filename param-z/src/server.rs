//! Parameter and list services answering remote requests against the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cdr::{CdrBe, Infinite};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::param::{ListEntryV1, ListEntryV2, ParamMeta};
use crate::registry::{RawWrite, Registry};
use crate::transport::{Connection, Listener};
use crate::types::{LOCAL_NODE, ParamKey, ParamMask};
use crate::wire::{self, EntryHeader, FLAG_END, FLAG_NOACK, Header, PacketKind};

/// How long a serving loop blocks before checking whether it should stop.
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Push status codes.
pub const STATUS_OK: u8 = 0;
pub const STATUS_UNKNOWN: u8 = 1;
pub const STATUS_READONLY: u8 = 2;
pub const STATUS_INVALID: u8 = 3;

pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve the single request carried by `conn`.
    fn handle(&self, conn: &mut dyn Connection) -> Result<()>;
}

/// Accept and serve requests until `running` is cleared.
pub fn serve(service: Arc<dyn Service>, mut listener: Box<dyn Listener>, running: Arc<AtomicBool>) {
    info!("[SRV] {} server started", service.name());
    while running.load(Ordering::Acquire) {
        let Some(mut conn) = listener.accept(ACCEPT_POLL) else {
            continue;
        };
        if let Err(e) = service.handle(conn.as_mut()) {
            warn!("[SRV] {} request failed: {e}", service.name());
        }
    }
    info!("[SRV] {} server stopped", service.name());
}

pub struct ParamService {
    registry: Arc<Registry>,
    address: u16,
    hwid: Option<u32>,
    capacity: usize,
}

impl ParamService {
    pub fn new(registry: Arc<Registry>, address: u16, hwid: Option<u32>, capacity: usize) -> Self {
        Self {
            registry,
            address,
            hwid,
            capacity,
        }
    }

    /// Entries naming this node's own address refer to local parameters.
    fn local_key(&self, header: &EntryHeader) -> ParamKey {
        let node = if header.node == self.address {
            LOCAL_NODE
        } else {
            header.node
        };
        ParamKey::new(node, header.id)
    }

    fn entry_value(&self, key: ParamKey, offset: Option<u16>) -> Option<(EntryHeader, Vec<u8>)> {
        match self.registry.read_raw(key, offset) {
            Ok(bytes) => Some((
                EntryHeader {
                    id: key.id,
                    node: key.node,
                    offset,
                    timestamp: self.registry.timestamp(key),
                },
                bytes,
            )),
            Err(e) => {
                warn!("[SRV] cannot serve {key}: {e}");
                None
            }
        }
    }

    /// Send values as pull responses no larger than the queue capacity.
    fn send_values(
        &self,
        conn: &mut dyn Connection,
        version: u8,
        values: Vec<(EntryHeader, Vec<u8>)>,
    ) -> Result<()> {
        let header = Header::new(PacketKind::PullResponse, version);
        let mut packet = Vec::new();
        header.write(&mut packet);
        let mut entry = Vec::new();
        for (h, bytes) in values {
            entry.clear();
            h.write(version, LOCAL_NODE, &mut entry)?;
            wire::write_value(&bytes, &mut entry)?;
            if packet.len() > 2 && packet.len() - 2 + entry.len() > self.capacity {
                conn.send(std::mem::take(&mut packet))?;
                header.write(&mut packet);
            }
            packet.extend_from_slice(&entry);
        }
        packet[1] |= FLAG_END;
        conn.send(packet)
    }

    fn serve_pull(&self, conn: &mut dyn Connection, version: u8, body: &[u8]) -> Result<()> {
        let values = wire::read_entries(version, LOCAL_NODE, body, false)?
            .iter()
            .filter_map(|e| self.entry_value(self.local_key(&e.header), e.header.offset))
            .collect();
        self.send_values(conn, version, values)
    }

    fn serve_pull_all(&self, conn: &mut dyn Connection, version: u8, body: &[u8]) -> Result<()> {
        let (include, exclude) = wire::pull_all_masks(body)?;
        let selected = self.registry.select(
            ParamMask::from_bits_retain(include),
            ParamMask::from_bits_retain(exclude),
            LOCAL_NODE,
        );
        debug!("[SRV] pull-all selected {} parameters", selected.len());
        let values = selected
            .iter()
            .filter_map(|m| self.entry_value(m.key(), None))
            .collect();
        self.send_values(conn, version, values)
    }

    /// Validate every entry, then apply all of them or none.
    fn apply_push(&self, version: u8, body: &[u8]) -> Result<u8> {
        let entries = wire::read_entries(version, LOCAL_NODE, body, true)?;
        let mut writes = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = self.local_key(&entry.header);
            let meta = match self.registry.meta(key) {
                Ok(meta) => meta,
                Err(_) => {
                    warn!("[SRV] push for unknown parameter {key}");
                    return Ok(STATUS_UNKNOWN);
                }
            };
            if meta.mask.contains(ParamMask::READONLY) {
                warn!("[SRV] push to read-only {}", meta.name);
                return Ok(STATUS_READONLY);
            }
            writes.push(RawWrite {
                key,
                offset: entry.header.offset,
                bytes: entry.value.unwrap_or_default(),
                timestamp: None,
            });
        }
        match self.registry.apply(writes) {
            Ok(n) => {
                debug!("[SRV] applied {n} pushed values");
                Ok(STATUS_OK)
            }
            Err(e) => {
                warn!("[SRV] rejected push: {e}");
                Ok(STATUS_INVALID)
            }
        }
    }

    fn serve_push(&self, conn: &mut dyn Connection, header: Header, body: &[u8]) -> Result<()> {
        let version = header.ty.version();
        let body = if header.ty.kind() == PacketKind::PushRequestHwid {
            let (entries, hwid) = wire::split_hwid(body)?;
            if self.hwid != Some(hwid) {
                debug!("[SRV] ignoring push for hwid {hwid:#x}");
                return Ok(());
            }
            entries
        } else {
            body
        };
        let status = self.apply_push(version, body)?;
        if header.flags & FLAG_NOACK != 0 {
            return Ok(());
        }
        let mut response = Vec::with_capacity(3);
        Header::new(PacketKind::PushResponse, version).with_flags(FLAG_END).write(&mut response);
        response.push(status);
        conn.send(response)
    }
}

impl Service for ParamService {
    fn name(&self) -> &'static str {
        "param"
    }

    fn handle(&self, conn: &mut dyn Connection) -> Result<()> {
        let request = conn
            .receive(ACCEPT_POLL)
            .ok_or_else(|| Error::malformed("empty request"))?;
        let (header, body) = Header::parse(&request)?;
        let version = header.ty.version();
        debug!("[SRV] {} request, {} bytes", header.ty, body.len());
        match header.ty.kind() {
            PacketKind::PullRequest => self.serve_pull(conn, version, body),
            PacketKind::PullAllRequest => self.serve_pull_all(conn, version, body),
            PacketKind::PushRequest | PacketKind::PushRequestHwid => self.serve_push(conn, header, body),
            PacketKind::PullResponse | PacketKind::PushResponse => {
                Err(Error::malformed(format!("unexpected {} request", header.ty)))
            }
        }
    }
}

pub struct ListService {
    registry: Arc<Registry>,
}

impl ListService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

/// One list response packet carrying `meta`.
pub fn encode_list_entry(meta: &ParamMeta, version: u8, last: bool) -> Result<Vec<u8>> {
    let flags = if last { FLAG_END } else { 0 };
    let (ty, body) = if version >= 2 {
        let entry = ListEntryV2::from(meta);
        (wire::LIST_RESPONSE_V2, cdr::serialize::<_, _, CdrBe>(&entry, Infinite)?)
    } else {
        let entry = ListEntryV1::from(meta);
        (wire::LIST_RESPONSE, cdr::serialize::<_, _, CdrBe>(&entry, Infinite)?)
    };
    let mut packet = vec![ty, flags];
    packet.extend(body);
    Ok(packet)
}

impl Service for ListService {
    fn name(&self) -> &'static str {
        "list"
    }

    fn handle(&self, conn: &mut dyn Connection) -> Result<()> {
        let request = conn
            .receive(ACCEPT_POLL)
            .ok_or_else(|| Error::malformed("empty request"))?;
        let (version, include_remotes) = match request.as_slice() {
            [wire::LIST_REQUEST, rest @ ..] => (1, rest.first().is_some_and(|b| *b != 0)),
            [wire::LIST_REQUEST_V2, rest @ ..] => (2, rest.first().is_some_and(|b| *b != 0)),
            other => return Err(Error::malformed(format!("list request {other:?}"))),
        };
        let metas: Vec<ParamMeta> = self
            .registry
            .iter()
            .filter(|m| include_remotes || m.node == LOCAL_NODE)
            .collect();
        debug!("[SRV] listing {} parameters (v{version})", metas.len());
        if metas.is_empty() {
            let ty = if version >= 2 {
                wire::LIST_RESPONSE_V2
            } else {
                wire::LIST_RESPONSE
            };
            return conn.send(vec![ty, FLAG_END]);
        }
        let last = metas.len() - 1;
        for (i, meta) in metas.iter().enumerate() {
            conn.send(encode_list_entry(meta, version, i == last)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamType;
    use crate::value::Value;
    use crate::vmem::VmemTable;

    /// Records what a service sends back.
    struct Recorder {
        request: Option<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Recorder {
        fn new(request: Vec<u8>) -> Self {
            Self {
                request: Some(request),
                sent: Vec::new(),
            }
        }
    }

    impl Connection for Recorder {
        fn send(&mut self, packet: Vec<u8>) -> Result<()> {
            self.sent.push(packet);
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
            self.request.take()
        }
    }

    fn service(capacity: usize) -> ParamService {
        let registry = Arc::new(Registry::new(Arc::new(VmemTable::new())));
        for id in 1..=20u16 {
            registry
                .register(
                    ParamMeta::new(id, format!("p{id}"), ParamType::Uint32).with_mask(ParamMask::TELEM),
                    Some(&Value::Uint(id as u64)),
                )
                .unwrap();
        }
        registry
            .register(
                ParamMeta::new(30, "locked", ParamType::Uint8).with_mask(ParamMask::READONLY),
                None,
            )
            .unwrap();
        ParamService::new(registry, 5, Some(0xabcd), capacity)
    }

    #[test]
    fn test_pull_all_splits_packets() {
        let svc = service(60);
        let mut request = Vec::new();
        Header::new(PacketKind::PullAllRequest, 2).write(&mut request);
        request.extend_from_slice(&ParamMask::TELEM.bits().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes());
        let mut conn = Recorder::new(request);
        svc.handle(&mut conn).unwrap();

        assert!(conn.sent.len() > 1);
        let mut total = 0;
        for (i, packet) in conn.sent.iter().enumerate() {
            assert!(packet.len() - 2 <= 60);
            let (header, body) = Header::parse(packet).unwrap();
            assert_eq!(header.is_end(), i == conn.sent.len() - 1);
            total += wire::read_entries(2, 5, body, true).unwrap().len();
        }
        assert_eq!(total, 20);
    }

    #[test]
    fn test_push_to_readonly_applies_nothing() {
        let svc = service(200);
        let mut queue = crate::queue::Queue::new(crate::types::QueueDirection::Set, 2, 200);
        let p1 = svc.registry.meta(ParamKey::new(0, 1)).unwrap();
        let locked = svc.registry.meta(ParamKey::new(0, 30)).unwrap();
        queue.add(&p1, None, Some(&Value::Uint(99))).unwrap();
        queue.add(&locked, None, Some(&Value::Uint(1))).unwrap();

        let mut request = Vec::new();
        Header::new(PacketKind::PushRequest, 2).write(&mut request);
        request.extend(queue.body(0).unwrap());
        let mut conn = Recorder::new(request);
        svc.handle(&mut conn).unwrap();

        assert_eq!(conn.sent[0][2], STATUS_READONLY);
        assert_eq!(svc.registry.read(p1.key(), None).unwrap(), Value::Uint(1));
    }

    #[test]
    fn test_hwid_mismatch_is_ignored() {
        let svc = service(200);
        let mut queue = crate::queue::Queue::new(crate::types::QueueDirection::Set, 2, 200);
        let p1 = svc.registry.meta(ParamKey::new(0, 1)).unwrap();
        queue.add(&p1, None, Some(&Value::Uint(7))).unwrap();

        for (hwid, applied) in [(0x1234u32, false), (0xabcd, true)] {
            let mut request = Vec::new();
            Header::new(PacketKind::PushRequestHwid, 2).write(&mut request);
            request.extend(queue.body(0).unwrap());
            request.extend_from_slice(&hwid.to_be_bytes());
            let mut conn = Recorder::new(request);
            svc.handle(&mut conn).unwrap();
            assert_eq!(conn.sent.len(), usize::from(applied));
        }
        assert_eq!(svc.registry.read(p1.key(), None).unwrap(), Value::Uint(7));
    }

    #[test]
    fn test_own_address_means_local() {
        let svc = service(200);
        let header = EntryHeader {
            id: 3,
            node: 5,
            offset: None,
            timestamp: None,
        };
        assert_eq!(svc.local_key(&header), ParamKey::new(0, 3));
    }
}
