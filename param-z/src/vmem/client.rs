//! Remote access to the vmem regions of a node.

use std::fmt::Write as _;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, warn};

use super::RegionInfo;
use super::server::{CHUNK_SIZE, FLAG_ERROR, UNLOCK_DENIED};
use crate::client::{open, receive, send};
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::wire::{self, FLAG_END, VERSION_LATEST};

fn request(version: u8, ty: u8) -> Vec<u8> {
    vec![version, ty]
}

/// Regions exposed by `node`.
#[tracing::instrument(name = "vmem_list", skip(transport))]
pub fn list(transport: &dyn Transport, node: u16, timeout: Duration, version: u8) -> Result<Vec<RegionInfo>> {
    let mut conn = open(transport, node, wire::PORT_VMEM, timeout)?;
    send(conn.as_mut(), node, request(version, wire::VMEM_LIST))?;
    let packet = receive(conn.as_mut(), node, timeout)?;
    RegionInfo::decode_list(&packet, version)
}

/// Read `len` bytes of a region starting at `offset`.
pub fn read(
    transport: &dyn Transport,
    node: u16,
    region: u16,
    offset: u32,
    len: u32,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut packet = request(VERSION_LATEST, wire::VMEM_READ);
    packet.extend_from_slice(&region.to_be_bytes());
    packet.extend_from_slice(&offset.to_be_bytes());
    packet.extend_from_slice(&len.to_be_bytes());

    let mut conn = open(transport, node, wire::PORT_VMEM, timeout)?;
    send(conn.as_mut(), node, packet)?;
    let mut data = vec![0u8; len as usize];
    let mut received = 0usize;
    loop {
        let chunk = receive(conn.as_mut(), node, timeout)?;
        let [flags, rest @ ..] = chunk.as_slice() else {
            return Err(Error::malformed("empty vmem chunk"));
        };
        if flags & FLAG_ERROR != 0 {
            return Err(Error::Rejected { node, status: *flags });
        }
        if rest.len() < 4 {
            return Err(Error::malformed("short vmem chunk"));
        }
        let at = BigEndian::read_u32(&rest[..4]);
        let payload = &rest[4..];
        let start = at.checked_sub(offset).map(|s| s as usize);
        match start {
            Some(start) if start + payload.len() <= data.len() => {
                data[start..start + payload.len()].copy_from_slice(payload);
                received += payload.len();
            }
            _ => return Err(Error::malformed(format!("vmem chunk at {at} outside request"))),
        }
        if flags & FLAG_END != 0 {
            break;
        }
    }
    if received != data.len() {
        return Err(Error::malformed(format!(
            "vmem read returned {received} of {} bytes",
            data.len()
        )));
    }
    Ok(data)
}

/// Write `data` to a region at `offset`, one request per chunk.
pub fn write(
    transport: &dyn Transport,
    node: u16,
    region: u16,
    offset: u32,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut conn = open(transport, node, wire::PORT_VMEM, timeout)?;
    for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
        let mut packet = request(VERSION_LATEST, wire::VMEM_WRITE);
        packet.extend_from_slice(&region.to_be_bytes());
        packet.extend_from_slice(&(offset + (i * CHUNK_SIZE) as u32).to_be_bytes());
        packet.extend_from_slice(chunk);
        send(conn.as_mut(), node, packet)?;
        match receive(conn.as_mut(), node, timeout)?.first() {
            Some(0) => {}
            Some(status) => {
                return Err(Error::Rejected {
                    node,
                    status: *status,
                });
            }
            None => return Err(Error::malformed("vmem write answer without status")),
        }
    }
    Ok(())
}

fn find_region(transport: &dyn Transport, node: u16, region_id: u16, timeout: Duration) -> Result<RegionInfo> {
    list(transport, node, timeout, VERSION_LATEST)?
        .into_iter()
        .find(|r| r.id == region_id)
        .ok_or_else(|| Error::NotFound {
            ident: format!("vmem region {region_id}"),
            node,
        })
}

/// Snapshot of a whole region of `node`.
#[tracing::instrument(name = "backup", skip(transport))]
pub fn backup(transport: &dyn Transport, node: u16, region_id: u16, timeout: Duration) -> Result<Vec<u8>> {
    let region = find_region(transport, node, region_id, timeout)?;
    let data = read(transport, node, region.id, 0, region.size, timeout)?;
    info!("[VMC] backed up {} bytes of '{}' from node {node}", data.len(), region.name);
    Ok(data)
}

/// Write a snapshot back into a region of `node`.
#[tracing::instrument(name = "restore", skip(transport, bytes), fields(len = bytes.len()))]
pub fn restore(
    transport: &dyn Transport,
    node: u16,
    region_id: u16,
    timeout: Duration,
    bytes: &[u8],
) -> Result<()> {
    let region = find_region(transport, node, region_id, timeout)?;
    if bytes.len() > region.size as usize {
        return Err(Error::LengthMismatch {
            expected: region.size as usize,
            actual: bytes.len(),
        });
    }
    write(transport, node, region.id, 0, bytes, timeout)?;
    info!("[VMC] restored {} bytes of '{}' on node {node}", bytes.len(), region.name);
    Ok(())
}

/// Challenge/response handshake permitting writes to protected regions.
#[tracing::instrument(name = "unlock", skip(transport))]
pub fn unlock(transport: &dyn Transport, node: u16, timeout: Duration) -> Result<()> {
    let exchange = |code: u32| -> Result<u32> {
        let mut conn = open(transport, node, wire::PORT_VMEM, timeout)?;
        let mut packet = request(VERSION_LATEST, wire::VMEM_UNLOCK);
        packet.extend_from_slice(&code.to_be_bytes());
        send(conn.as_mut(), node, packet)?;
        let answer = receive(conn.as_mut(), node, timeout)?;
        if answer.len() < 4 {
            return Err(Error::malformed("short unlock answer"));
        }
        Ok(BigEndian::read_u32(&answer))
    };

    let challenge = exchange(wire::VMEM_UNLOCK_CODE)?;
    debug!("[VMC] unlock challenge {challenge:#x} from node {node}");
    match exchange(challenge)? {
        0 => {
            info!("[VMC] node {node} unlocked");
            Ok(())
        }
        UNLOCK_DENIED => {
            warn!("[VMC] node {node} denied unlock");
            Err(Error::Rejected { node, status: 0xFF })
        }
        other => Err(Error::malformed(format!("unexpected unlock answer {other:#x}"))),
    }
}

/// Printable table of regions.
pub fn format_regions(regions: &[RegionInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>3}  {:<5}  {:>18}  {:>8}  type", "id", "name", "address", "size");
    for r in regions {
        let _ = writeln!(
            out,
            "{:>3}  {:<5}  {:#018x}  {:>8}  {}",
            r.id, r.name, r.address, r.size, r.kind
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::VmemKind;

    #[test]
    fn test_format_regions() {
        let table = format_regions(&[RegionInfo {
            id: 2,
            name: "cnf".into(),
            address: 0x1000_0000,
            size: 256,
            kind: VmemKind::Fram,
        }]);
        let row = table.lines().nth(1).unwrap();
        assert!(row.contains("cnf"));
        assert!(row.contains("0x0000000010000000"));
        assert!(row.ends_with("FRAM"));
    }
}
