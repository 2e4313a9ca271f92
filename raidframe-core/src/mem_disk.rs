// vim: tw=80
//! A `DiskQueue` backed by memory.  Useful for testing and for ramdisk-style
//! arrays.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicBool, Ordering}
};

use futures::future;

use crate::{
    disk::{BoxDiskFut, DiskQueue},
    types::*,
};

/// The kind of an operation recorded in an [`OpLog`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Read,
    Write,
}

/// One operation that reached a `MemDisk`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskOp {
    /// Identifies the disk, as given to [`MemDisk::with_log`]
    pub disk: usize,
    pub kind: OpKind,
    pub sector: SectorT,
    pub nsectors: u64,
}

/// Ordered record of operations issued to a group of `MemDisk`s
pub type OpLog = Arc<Mutex<Vec<DiskOp>>>;

pub struct MemDisk {
    bytes_per_sector: usize,
    data: Mutex<Vec<u8>>,
    failed: AtomicBool,
    log: Option<(usize, OpLog)>,
}

impl MemDisk {
    pub fn new(sectors: SectorT, bytes_per_sector: usize) -> Self {
        MemDisk {
            bytes_per_sector,
            data: Mutex::new(vec![0u8; sectors as usize * bytes_per_sector]),
            failed: AtomicBool::new(false),
            log: None,
        }
    }

    /// Like `new`, but record every operation in `log`, tagged with `id`.
    pub fn with_log(sectors: SectorT, bytes_per_sector: usize, id: usize,
                    log: OpLog) -> Self
    {
        let mut md = Self::new(sectors, bytes_per_sector);
        md.log = Some((id, log));
        md
    }

    /// Copy out the contents of some sectors, bypassing failure injection.
    pub fn peek(&self, sector: SectorT, nsectors: u64) -> Vec<u8> {
        let (start, end) = self.byte_range(sector, nsectors);
        self.data.lock().unwrap()[start..end].to_vec()
    }

    /// Overwrite some sectors, bypassing failure injection.
    pub fn poke(&self, sector: SectorT, buf: &[u8]) {
        let start = sector as usize * self.bytes_per_sector;
        self.data.lock().unwrap()[start..start + buf.len()]
            .copy_from_slice(buf);
    }

    /// Make all subsequent operations fail with `EIO`, or stop doing so.
    pub fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Relaxed);
    }

    fn byte_range(&self, sector: SectorT, nsectors: u64) -> (usize, usize) {
        let start = sector as usize * self.bytes_per_sector;
        (start, start + nsectors as usize * self.bytes_per_sector)
    }

    fn check(&self, kind: OpKind, sector: SectorT, len: usize) -> Result<()> {
        let nsectors = (len / self.bytes_per_sector) as u64;
        if let Some((disk, log)) = &self.log {
            log.lock().unwrap().push(DiskOp{disk: *disk, kind, sector,
                nsectors});
        }
        if self.failed.load(Ordering::Relaxed) {
            return Err(Error::EIO);
        }
        if len % self.bytes_per_sector != 0 {
            return Err(Error::EINVAL);
        }
        if sector + nsectors > self.sectors() {
            return Err(Error::ENOSPC);
        }
        Ok(())
    }
}

impl DiskQueue for MemDisk {
    fn read_at(&self, mut buf: IoVecMut, sector: SectorT) -> BoxDiskFut {
        let r = self.check(OpKind::Read, sector, buf.len()).map(|_| {
            let start = sector as usize * self.bytes_per_sector;
            let data = self.data.lock().unwrap();
            let len = buf.len();
            buf[..].copy_from_slice(&data[start..start + len]);
        });
        Box::pin(future::ready(r))
    }

    fn sectors(&self) -> SectorT {
        (self.data.lock().unwrap().len() / self.bytes_per_sector) as SectorT
    }

    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut {
        let r = self.check(OpKind::Write, sector, buf.len()).map(|_| {
            self.poke(sector, &buf[..]);
        });
        Box::pin(future::ready(r))
    }
}

// LCOV_EXCL_STOP
