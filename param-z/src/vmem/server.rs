use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{RegionInfo, VmemTable};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::server::{ACCEPT_POLL, Service};
use crate::transport::Connection;
use crate::wire::{self, FLAG_END};

/// Payload bytes per READ answer packet.
pub const CHUNK_SIZE: usize = 192;

/// READ answer flag: the region could not be read.
pub const FLAG_ERROR: u8 = 0x01;

pub const WRITE_OK: u8 = 0;
pub const WRITE_FAILED: u8 = 1;
pub const WRITE_LOCKED: u8 = 2;

/// Answer to an unlock step that did not match.
pub const UNLOCK_DENIED: u32 = u32::MAX;

/// How long protected regions stay writable after a successful unlock.
pub const UNLOCK_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Locked,
    Challenged(u32),
    Unlocked(Instant),
}

/// Serves backup, restore and listing of the local vmem regions.
///
/// Parameters stored in a region are reloaded from it after every write.
pub struct VmemService {
    registry: Arc<Registry>,
    lock: Mutex<LockState>,
    window: Duration,
}

impl VmemService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            lock: Mutex::new(LockState::Locked),
            window: UNLOCK_WINDOW,
        }
    }

    pub fn with_unlock_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn table(&self) -> &VmemTable {
        self.registry.vmem()
    }

    /// True while an unlock is in effect. An expired unlock locks again.
    pub fn is_unlocked(&self) -> bool {
        let mut state = self.lock.lock();
        match *state {
            LockState::Unlocked(at) if at.elapsed() < self.window => true,
            LockState::Unlocked(_) => {
                info!("[VMS] unlock expired");
                *state = LockState::Locked;
                false
            }
            _ => false,
        }
    }

    fn read(&self, conn: &mut dyn Connection, region: u16, offset: u32, len: u32) -> Result<()> {
        let data = match self.table().read(region, offset, len) {
            Ok(data) => data,
            Err(e) => {
                warn!("[VMS] read of region {region} failed: {e}");
                let mut packet = vec![FLAG_END | FLAG_ERROR];
                packet.extend_from_slice(&offset.to_be_bytes());
                return conn.send(packet);
            }
        };
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(CHUNK_SIZE).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let flags = if i == last { FLAG_END } else { 0 };
            let at = offset + (i * CHUNK_SIZE) as u32;
            let mut packet = Vec::with_capacity(5 + chunk.len());
            packet.push(flags);
            packet.extend_from_slice(&at.to_be_bytes());
            packet.extend_from_slice(chunk);
            conn.send(packet)?;
        }
        Ok(())
    }

    fn write(&self, region: u16, offset: u32, data: &[u8]) -> u8 {
        if self.table().is_protected(region) && !self.is_unlocked() {
            warn!("[VMS] refusing write to locked region {region}");
            return WRITE_LOCKED;
        }
        let written = self.table().write(region, offset, data).and_then(|()| {
            self.registry
                .reload_region(region, offset..offset + data.len() as u32)
        });
        match written {
            Ok(_) => WRITE_OK,
            Err(e) => {
                warn!("[VMS] write to region {region} failed: {e}");
                WRITE_FAILED
            }
        }
    }

    fn unlock_step(&self, code: u32) -> u32 {
        let mut state = self.lock.lock();
        let (next, answer) = match *state {
            _ if code == wire::VMEM_UNLOCK_CODE => {
                let challenge = rand::random::<u32>() & 0x7FFF_FFFF;
                (LockState::Challenged(challenge), challenge)
            }
            LockState::Challenged(challenge) if code == challenge => {
                info!("[VMS] vmem unlocked for {:?}", self.window);
                (LockState::Unlocked(Instant::now()), 0)
            }
            LockState::Unlocked(at) => (LockState::Unlocked(at), UNLOCK_DENIED),
            _ => (LockState::Locked, UNLOCK_DENIED),
        };
        *state = next;
        answer
    }
}

impl Service for VmemService {
    fn name(&self) -> &'static str {
        "vmem"
    }

    fn handle(&self, conn: &mut dyn Connection) -> Result<()> {
        let request = conn
            .receive(ACCEPT_POLL)
            .ok_or_else(|| Error::malformed("empty request"))?;
        let [version, ty, body @ ..] = request.as_slice() else {
            return Err(Error::malformed("short vmem request"));
        };
        let mut cur = Cursor::new(body);
        let truncated = |e: std::io::Error| Error::malformed(format!("vmem request: {e}"));
        match *ty {
            wire::VMEM_LIST => {
                let mut packet = Vec::new();
                for info in self.table().enumerate_regions() {
                    info.encode_into(*version, &mut packet)?;
                }
                debug!(
                    "[VMS] listing {} regions (v{version})",
                    packet.len() / RegionInfo::record_len(*version)
                );
                conn.send(packet)
            }
            wire::VMEM_READ => {
                let region = cur.read_u16::<BigEndian>().map_err(truncated)?;
                let offset = cur.read_u32::<BigEndian>().map_err(truncated)?;
                let len = cur.read_u32::<BigEndian>().map_err(truncated)?;
                debug!("[VMS] read region {region} @{offset} +{len}");
                self.read(conn, region, offset, len)
            }
            wire::VMEM_WRITE => {
                let region = cur.read_u16::<BigEndian>().map_err(truncated)?;
                let offset = cur.read_u32::<BigEndian>().map_err(truncated)?;
                let data = &body[cur.position() as usize..];
                debug!("[VMS] write region {region} @{offset} +{}", data.len());
                conn.send(vec![self.write(region, offset, data)])
            }
            wire::VMEM_UNLOCK => {
                let code = cur.read_u32::<BigEndian>().map_err(truncated)?;
                conn.send(self.unlock_step(code).to_be_bytes().to_vec())
            }
            other => Err(Error::malformed(format!("vmem request type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::RamVmem;

    fn registry() -> Arc<Registry> {
        let table = VmemTable::new();
        table.add(1, "boot", Arc::new(RamVmem::new(8)), true).unwrap();
        Arc::new(Registry::new(Arc::new(table)))
    }

    #[test]
    fn test_unlock_state_machine() {
        let svc = VmemService::new(registry());
        assert_eq!(svc.unlock_step(42), UNLOCK_DENIED);
        let challenge = svc.unlock_step(wire::VMEM_UNLOCK_CODE);
        assert!(!svc.is_unlocked());
        assert_eq!(svc.unlock_step(challenge.wrapping_add(1)), UNLOCK_DENIED);
        assert!(!svc.is_unlocked());

        let challenge = svc.unlock_step(wire::VMEM_UNLOCK_CODE);
        assert_eq!(svc.unlock_step(challenge), 0);
        assert!(svc.is_unlocked());
    }

    #[test]
    fn test_unlock_expires() {
        let svc = VmemService::new(registry()).with_unlock_window(Duration::from_millis(50));
        let challenge = svc.unlock_step(wire::VMEM_UNLOCK_CODE);
        assert_eq!(svc.unlock_step(challenge), 0);
        assert_eq!(svc.write(1, 0, &[1]), WRITE_OK);

        std::thread::sleep(Duration::from_millis(80));
        assert!(!svc.is_unlocked());
        assert_eq!(svc.write(1, 0, &[2]), WRITE_LOCKED);
        assert_eq!(svc.table().read(1, 0, 1).unwrap(), [1]);
    }
}
