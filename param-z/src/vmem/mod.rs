//! Virtual memory regions backing parameter storage.
//!
//! A region is a flat byte array, either volatile ([`RamVmem`]) or backed by a
//! file ([`FileVmem`]). The [`VmemTable`] owns every region of the local node
//! and is what the vmem server exposes for backup and restore.

pub mod client;
pub mod server;

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Base virtual address of the first region.
const VADDR_BASE: u64 = 0x1000_0000;
/// Length of the name field of a region record.
pub const REGION_NAME_LEN: usize = 5;

/// Storage technology of a region, as carried in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum VmemKind {
    #[strum(serialize = "UNKNOWN")]
    Unknown = 0,
    #[strum(serialize = "RAM")]
    Ram = 1,
    #[strum(serialize = "FRAM")]
    Fram = 2,
    #[strum(serialize = "FRAM_SECURE")]
    FramSecure = 3,
    #[strum(serialize = "FLASH")]
    Flash = 4,
    #[strum(serialize = "DRIVER")]
    Driver = 5,
    #[strum(serialize = "FILE")]
    File = 7,
}

/// Listing record of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: u16,
    pub name: String,
    pub address: u64,
    pub size: u32,
    pub kind: VmemKind,
}

impl RegionInfo {
    /// Size of one encoded record for the given protocol version.
    pub fn record_len(version: u8) -> usize {
        2 + REGION_NAME_LEN + if version >= 2 { 8 } else { 4 } + 4 + 1
    }

    pub fn encode_into(&self, version: u8, out: &mut Vec<u8>) -> Result<()> {
        let mut buf = vec![0u8; Self::record_len(version)];
        BigEndian::write_u16(&mut buf[0..2], self.id);
        let name = self.name.as_bytes();
        let n = name.len().min(REGION_NAME_LEN);
        buf[2..2 + n].copy_from_slice(&name[..n]);
        let mut at = 2 + REGION_NAME_LEN;
        if version >= 2 {
            BigEndian::write_u64(&mut buf[at..at + 8], self.address);
            at += 8;
        } else {
            let address = u32::try_from(self.address).map_err(|_| Error::ProtocolVersionMismatch {
                expected: 2,
                actual: version,
            })?;
            BigEndian::write_u32(&mut buf[at..at + 4], address);
            at += 4;
        }
        BigEndian::write_u32(&mut buf[at..at + 4], self.size);
        buf[at + 4] = self.kind as u8;
        out.extend_from_slice(&buf);
        Ok(())
    }

    pub fn decode_list(bytes: &[u8], version: u8) -> Result<Vec<RegionInfo>> {
        let len = Self::record_len(version);
        if bytes.len() % len != 0 {
            return Err(Error::malformed(format!(
                "vmem listing of {} bytes is not a multiple of {len}",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(len)
            .map(|rec| {
                let name_raw = &rec[2..2 + REGION_NAME_LEN];
                let end = name_raw.iter().position(|b| *b == 0).unwrap_or(REGION_NAME_LEN);
                let mut at = 2 + REGION_NAME_LEN;
                let address = if version >= 2 {
                    at += 8;
                    BigEndian::read_u64(&rec[at - 8..at])
                } else {
                    at += 4;
                    BigEndian::read_u32(&rec[at - 4..at]) as u64
                };
                RegionInfo {
                    id: BigEndian::read_u16(&rec[0..2]),
                    name: String::from_utf8_lossy(&name_raw[..end]).into_owned(),
                    address,
                    size: BigEndian::read_u32(&rec[at..at + 4]),
                    kind: VmemKind::from_repr(rec[at + 4]).unwrap_or(VmemKind::Unknown),
                }
            })
            .collect())
    }
}

/// Byte-addressable backing store.
pub trait Vmem: Send + Sync {
    fn size(&self) -> u32;
    fn kind(&self) -> VmemKind;
    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>>;
    fn write(&self, offset: u32, data: &[u8]) -> Result<()>;

    /// Persist pending writes. Volatile stores have nothing to do.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn check_bounds(size: u32, offset: u32, len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset as usize + len;
    if end > size as usize {
        return Err(Error::OutOfBounds { offset, len, size });
    }
    Ok(offset as usize..end)
}

pub struct RamVmem {
    data: Mutex<Vec<u8>>,
}

impl RamVmem {
    pub fn new(size: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }
}

impl Vmem for RamVmem {
    fn size(&self) -> u32 {
        self.data.lock().len() as u32
    }

    fn kind(&self) -> VmemKind {
        VmemKind::Ram
    }

    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let range = check_bounds(data.len() as u32, offset, len as usize)?;
        Ok(data[range].to_vec())
    }

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let range = check_bounds(data.len() as u32, offset, bytes.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// File-backed region. Writes land in memory and reach the file on [`Vmem::flush`].
pub struct FileVmem {
    path: PathBuf,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl FileVmem {
    /// Open (or create) the backing file, zero-extending it to `size` bytes.
    pub fn open(path: impl Into<PathBuf>, size: u32) -> Result<Self> {
        let path = path.into();
        let mut data = Vec::with_capacity(size as usize);
        match OpenOptions::new().read(true).open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[VMEM] creating {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        data.resize(size as usize, 0);
        let vmem = Self {
            path,
            data: Mutex::new(data),
            dirty: AtomicBool::new(true),
        };
        vmem.flush()?;
        Ok(vmem)
    }
}

impl Vmem for FileVmem {
    fn size(&self) -> u32 {
        self.data.lock().len() as u32
    }

    fn kind(&self) -> VmemKind {
        VmemKind::File
    }

    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let range = check_bounds(data.len() as u32, offset, len as usize)?;
        Ok(data[range].to_vec())
    }

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let range = check_bounds(data.len() as u32, offset, bytes.len())?;
        data[range].copy_from_slice(bytes);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let data = self.data.lock();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&data)?;
        file.sync_data()?;
        Ok(())
    }
}

struct Region {
    info: RegionInfo,
    protected: bool,
    store: Arc<dyn Vmem>,
}

/// All regions of the local node.
#[derive(Default)]
pub struct VmemTable {
    regions: RwLock<Vec<Region>>,
}

impl VmemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region. Protected regions refuse remote writes until unlocked.
    pub fn add(&self, id: u16, name: &str, store: Arc<dyn Vmem>, protected: bool) -> Result<()> {
        let mut regions = self.regions.write();
        if regions.iter().any(|r| r.info.id == id || r.info.name == name) {
            return Err(Error::Config(format!("vmem region {id} '{name}' already exists")));
        }
        if name.len() > REGION_NAME_LEN {
            warn!("[VMEM] region name '{name}' truncated to {REGION_NAME_LEN} bytes on the wire");
        }
        let address = regions
            .last()
            .map(|r| (r.info.address + r.info.size as u64 + 0xFFF) & !0xFFF)
            .unwrap_or(VADDR_BASE);
        regions.push(Region {
            info: RegionInfo {
                id,
                name: name.to_owned(),
                address,
                size: store.size(),
                kind: store.kind(),
            },
            protected,
            store,
        });
        Ok(())
    }

    pub fn enumerate_regions(&self) -> Vec<RegionInfo> {
        self.regions.read().iter().map(|r| r.info.clone()).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<RegionInfo> {
        self.regions
            .read()
            .iter()
            .find(|r| r.info.name == name)
            .map(|r| r.info.clone())
    }

    pub fn is_protected(&self, id: u16) -> bool {
        self.regions
            .read()
            .iter()
            .any(|r| r.info.id == id && r.protected)
    }

    fn store(&self, id: u16) -> Result<Arc<dyn Vmem>> {
        self.regions
            .read()
            .iter()
            .find(|r| r.info.id == id)
            .map(|r| r.store.clone())
            .ok_or_else(|| Error::NotFound {
                ident: format!("vmem region {id}"),
                node: 0,
            })
    }

    pub fn read_region(&self, id: u16) -> Result<Vec<u8>> {
        let store = self.store(id)?;
        store.read(0, store.size())
    }

    pub fn read(&self, id: u16, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.store(id)?.read(offset, len)
    }

    /// Check that a write of `len` bytes at `offset` would land inside region `id`.
    pub fn check(&self, id: u16, offset: u32, len: usize) -> Result<()> {
        check_bounds(self.store(id)?.size(), offset, len).map(|_| ())
    }

    pub fn write_region(&self, id: u16, bytes: &[u8]) -> Result<()> {
        self.write(id, 0, bytes)
    }

    pub fn write(&self, id: u16, offset: u32, bytes: &[u8]) -> Result<()> {
        self.store(id)?.write(offset, bytes)
    }

    /// Flush every region, logging failures instead of stopping at the first.
    pub fn flush_all(&self) -> usize {
        let stores: Vec<_> = self
            .regions
            .read()
            .iter()
            .map(|r| (r.info.name.clone(), r.store.clone()))
            .collect();
        let mut failed = 0;
        for (name, store) in stores {
            if let Err(e) = store.flush() {
                warn!("[VMEM] flush of '{name}' failed: {e}");
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_v1_v2() {
        let info = RegionInfo {
            id: 3,
            name: "config".into(),
            address: 0x1000_2000,
            size: 120,
            kind: VmemKind::File,
        };
        for version in [1u8, 2] {
            let mut buf = Vec::new();
            info.encode_into(version, &mut buf).unwrap();
            assert_eq!(buf.len(), RegionInfo::record_len(version));
            let decoded = RegionInfo::decode_list(&buf, version).unwrap();
            assert_eq!(decoded[0].name, "confi");
            assert_eq!(decoded[0].address, 0x1000_2000);
            assert_eq!(decoded[0].size, 120);
        }
        assert_eq!(RegionInfo::record_len(1), 16);
        assert_eq!(RegionInfo::record_len(2), 20);
    }

    #[test]
    fn test_wide_address_needs_v2() {
        let info = RegionInfo {
            id: 1,
            name: "big".into(),
            address: 0x1_0000_0000,
            size: 1,
            kind: VmemKind::Ram,
        };
        let mut buf = Vec::new();
        assert!(info.encode_into(1, &mut buf).is_err());
        assert!(info.encode_into(2, &mut buf).is_ok());
    }

    #[test]
    fn test_ram_bounds() {
        let ram = RamVmem::new(4);
        ram.write(2, &[9, 9]).unwrap();
        assert_eq!(ram.read(0, 4).unwrap(), [0, 0, 9, 9]);
        assert!(matches!(
            ram.write(3, &[1, 1]),
            Err(Error::OutOfBounds { offset: 3, len: 2, size: 4 })
        ));

        let big = RamVmem::new(100_000);
        assert!(matches!(
            big.read(99_999, 2),
            Err(Error::OutOfBounds { offset: 99_999, len: 2, size: 100_000 })
        ));
    }

    #[test]
    fn test_table_addresses_do_not_overlap() {
        let table = VmemTable::new();
        table.add(1, "a", Arc::new(RamVmem::new(100)), false).unwrap();
        table.add(2, "b", Arc::new(RamVmem::new(100)), false).unwrap();
        let regions = table.enumerate_regions();
        assert!(regions[1].address >= regions[0].address + 100);
        assert!(table.add(3, "a", Arc::new(RamVmem::new(1)), false).is_err());
    }

    #[test]
    fn test_file_vmem_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.vmem");
        {
            let vmem = FileVmem::open(&path, 8).unwrap();
            vmem.write(0, b"abc").unwrap();
            vmem.flush().unwrap();
        }
        let vmem = FileVmem::open(&path, 8).unwrap();
        assert_eq!(vmem.read(0, 3).unwrap(), b"abc");
    }
}
