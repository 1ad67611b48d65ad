//! Client side of the parameter and list services.
//!
//! Every function performs exactly one request/response exchange and blocks
//! for at most `timeout` per awaited packet. Nothing here touches the
//! registry: results are returned for the caller to apply.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::param::{ListEntryV1, ListEntryV2, ParamMeta};
use crate::queue::Queue;
use crate::registry::RawWrite;
use crate::transport::{ConnOptions, Connection, Priority, Transport};
use crate::types::{ParamKey, ParamMask, QueueDirection};
use crate::wire::{self, FLAG_END, FLAG_NOACK, Header, PacketKind};

pub(crate) fn open(
    transport: &dyn Transport,
    node: u16,
    port: u8,
    timeout: Duration,
) -> Result<Box<dyn Connection>> {
    transport
        .connect(Priority::Norm, node, port, timeout, ConnOptions::empty())
        .ok_or(Error::NoResponse { node })
}

pub(crate) fn receive(conn: &mut dyn Connection, node: u16, timeout: Duration) -> Result<Vec<u8>> {
    conn.receive(timeout).ok_or(Error::NoResponse { node })
}

/// Send a request, treating a send failure like a lost packet.
pub(crate) fn send(conn: &mut dyn Connection, node: u16, packet: Vec<u8>) -> Result<()> {
    conn.send(packet).map_err(|e| {
        warn!("[CLN] send to node {node} failed: {e}");
        Error::NoResponse { node }
    })
}

/// Collect pull responses until the packet flagged END.
fn read_pull_responses(
    conn: &mut dyn Connection,
    node: u16,
    version: u8,
    timeout: Duration,
) -> Result<Vec<RawWrite>> {
    let mut writes = Vec::new();
    loop {
        let packet = receive(conn, node, timeout)?;
        let (header, body) = Header::parse(&packet)?;
        header.expect(PacketKind::PullResponse, version)?;
        for entry in wire::read_entries(version, node, body, true)? {
            writes.push(RawWrite {
                key: ParamKey::new(entry.header.node, entry.header.id),
                offset: entry.header.offset,
                bytes: entry.value.unwrap_or_default(),
                timestamp: entry.header.timestamp,
            });
        }
        if header.is_end() {
            return Ok(writes);
        }
    }
}

/// Request the current values of the entries of a GET queue.
#[tracing::instrument(name = "pull", skip(transport, queue), fields(entries = queue.len()))]
pub fn pull(transport: &dyn Transport, queue: &Queue, node: u16, timeout: Duration) -> Result<Vec<RawWrite>> {
    if queue.direction() != QueueDirection::Get {
        return Err(Error::Config("pull needs a get queue".into()));
    }
    let version = queue.version();
    let mut packet = Vec::with_capacity(2 + queue.used());
    Header::new(PacketKind::PullRequest, version).write(&mut packet);
    packet.extend(queue.body(node)?);

    let mut conn = open(transport, node, wire::PORT_PARAM, timeout)?;
    send(conn.as_mut(), node, packet)?;
    let writes = read_pull_responses(conn.as_mut(), node, version, timeout)?;
    debug!("[CLN] pulled {} values from node {node}", writes.len());
    Ok(writes)
}

/// Request every parameter of `node` selected by the masks.
#[tracing::instrument(name = "pull_all", skip(transport))]
pub fn pull_all(
    transport: &dyn Transport,
    node: u16,
    include: ParamMask,
    exclude: ParamMask,
    timeout: Duration,
    version: u8,
) -> Result<Vec<RawWrite>> {
    let mut packet = Vec::with_capacity(10);
    Header::new(PacketKind::PullAllRequest, version).write(&mut packet);
    packet.extend_from_slice(&include.bits().to_be_bytes());
    packet.extend_from_slice(&exclude.bits().to_be_bytes());

    let mut conn = open(transport, node, wire::PORT_PARAM, timeout)?;
    send(conn.as_mut(), node, packet)?;
    read_pull_responses(conn.as_mut(), node, version, timeout)
}

/// Apply the entries of a SET queue on `node`.
///
/// With `hwid`, only a node carrying that hardware id applies the values.
/// Without `ack`, the request is sent and no answer is awaited.
#[tracing::instrument(name = "push", skip(transport, queue), fields(entries = queue.len()))]
pub fn push(
    transport: &dyn Transport,
    queue: &Queue,
    node: u16,
    timeout: Duration,
    hwid: Option<u32>,
    ack: bool,
) -> Result<()> {
    if queue.direction() != QueueDirection::Set {
        return Err(Error::Config("push needs a set queue".into()));
    }
    let version = queue.version();
    let kind = match hwid {
        Some(_) if version < 2 => {
            return Err(Error::ProtocolVersionMismatch {
                expected: 2,
                actual: version,
            });
        }
        Some(_) => PacketKind::PushRequestHwid,
        None => PacketKind::PushRequest,
    };
    let flags = if ack { 0 } else { FLAG_NOACK };
    let mut packet = Vec::with_capacity(6 + queue.used());
    Header::new(kind, version).with_flags(flags).write(&mut packet);
    packet.extend(queue.body(node)?);
    if let Some(hwid) = hwid {
        packet.extend_from_slice(&hwid.to_be_bytes());
    }

    let mut conn = open(transport, node, wire::PORT_PARAM, timeout)?;
    send(conn.as_mut(), node, packet)?;
    if !ack {
        return Ok(());
    }
    let response = receive(conn.as_mut(), node, timeout)?;
    let (header, body) = Header::parse(&response)?;
    header.expect(PacketKind::PushResponse, version)?;
    match body.first() {
        Some(0) => Ok(()),
        Some(status) => Err(Error::Rejected {
            node,
            status: *status,
        }),
        None => Err(Error::malformed("push response without status")),
    }
}

/// Fetch the parameter descriptors of `node`.
///
/// Descriptors that name node 0 belong to `node`. Returns `NoResponse` if
/// not a single descriptor arrived.
#[tracing::instrument(name = "download", skip(transport))]
pub fn download(
    transport: &dyn Transport,
    node: u16,
    timeout: Duration,
    version: u8,
    include_remotes: bool,
) -> Result<Vec<ParamMeta>> {
    let request = if version >= 2 {
        wire::LIST_REQUEST_V2
    } else {
        wire::LIST_REQUEST
    };
    let mut conn = open(transport, node, wire::PORT_LIST, timeout)?;
    send(conn.as_mut(), node, vec![request, u8::from(include_remotes)])?;

    let mut metas = Vec::new();
    loop {
        let Some(packet) = conn.receive(timeout) else {
            if metas.is_empty() {
                return Err(Error::NoResponse { node });
            }
            warn!("[CLN] list from node {node} timed out after {} entries", metas.len());
            break;
        };
        let [ty, flags, body @ ..] = packet.as_slice() else {
            return Err(Error::malformed("short list response"));
        };
        if !body.is_empty() {
            let entry = match (*ty, version >= 2) {
                (wire::LIST_RESPONSE_V2, true) => cdr::deserialize::<ListEntryV2>(body)?,
                (wire::LIST_RESPONSE, false) => cdr::deserialize::<ListEntryV1>(body)?.into(),
                (wire::LIST_RESPONSE | wire::LIST_RESPONSE_V2, _) => {
                    return Err(Error::ProtocolVersionMismatch {
                        expected: version.min(2),
                        actual: if *ty == wire::LIST_RESPONSE { 1 } else { 2 },
                    });
                }
                (other, _) => return Err(Error::malformed(format!("list response type {other}"))),
            };
            metas.push(entry.into_meta(node)?);
        }
        if flags & FLAG_END != 0 {
            break;
        }
    }
    if metas.is_empty() {
        return Err(Error::NoResponse { node });
    }
    Ok(metas)
}
