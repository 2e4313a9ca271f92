// vim: tw=80
//! The interface to the disk queues beneath the RAID engine, and the state
//! the engine keeps about each member disk.

use std::{
    fmt,
    pin::Pin,
    sync::Arc
};

use fixedbitset::FixedBitSet;
use futures::{
    Future,
    FutureExt,
    future::BoxFuture
};
#[cfg(test)] use mockall::automock;
use tokio::sync::Semaphore;

use crate::types::*;

/// Future representing an operation on a disk queue.
pub type BoxDiskFut = Pin<Box<dyn Future<Output = Result<()>> + Send + Sync>>;

/// A per-disk I/O queue.
///
/// Operations are enqueued and complete asynchronously.  All addresses are
/// in sectors of the array's configured size.
#[cfg_attr(test, automock)]
pub trait DiskQueue: Send + Sync {
    /// Read `buf.len()` bytes beginning at `sector`
    fn read_at(&self, buf: IoVecMut, sector: SectorT) -> BoxDiskFut;

    /// Size of the disk in sectors
    fn sectors(&self) -> SectorT;

    /// Write `buf` beginning at `sector`
    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut;
}

/// One member or spare disk, with its queue slots.
///
/// Every operation holds a queue slot until it completes, including
/// operations that were turned into NOPs.
pub struct Disk {
    queue: Arc<dyn DiskQueue>,
    slots: Arc<Semaphore>,
}

impl Disk {
    pub fn new(queue: Arc<dyn DiskQueue>, queue_depth: usize) -> Self {
        Disk {
            queue,
            slots: Arc::new(Semaphore::new(queue_depth)),
        }
    }

    /// Number of queue slots not currently held by any operation
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Hold a queue slot but perform no I/O.
    pub fn nop(&self) -> BoxFuture<'static, Result<()>> {
        let slots = self.slots.clone();
        async move {
            slots.acquire_owned().await
                .map(drop)
                .map_err(|_| Error::ESHUTDOWN)
        }.boxed()
    }

    pub fn read_at(&self, buf: IoVecMut, sector: SectorT)
        -> BoxFuture<'static, Result<()>>
    {
        let slots = self.slots.clone();
        let queue = self.queue.clone();
        async move {
            let _permit = slots.acquire_owned().await
                .map_err(|_| Error::ESHUTDOWN)?;
            queue.read_at(buf, sector).await
        }.boxed()
    }

    pub fn sectors(&self) -> SectorT {
        self.queue.sectors()
    }

    pub fn write_at(&self, buf: IoVec, sector: SectorT)
        -> BoxFuture<'static, Result<()>>
    {
        let slots = self.slots.clone();
        let queue = self.queue.clone();
        async move {
            let _permit = slots.acquire_owned().await
                .map_err(|_| Error::ESHUTDOWN)?;
            queue.write_at(buf, sector).await
        }.boxed()
    }
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("sectors", &self.queue.sectors())
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

/// All of the disks of one array.  Members come first, followed by spares.
#[derive(Debug)]
pub struct DiskSet {
    disks: Vec<Disk>,
}

impl DiskSet {
    pub fn new(queues: Vec<Arc<dyn DiskQueue>>, queue_depth: usize) -> Self {
        let disks = queues.into_iter()
            .map(|q| Disk::new(q, queue_depth))
            .collect();
        DiskSet { disks }
    }

    pub fn get(&self, disk: usize) -> Result<&Disk> {
        self.disks.get(disk).ok_or(Error::ENXIO)
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }
}

/// Status of one column of the array
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskStatus {
    /// Perfectly healthy
    Optimal,
    /// Failed.  No I/O is possible
    Failed,
    /// Being rebuilt onto a spare disk.  Reconstruction units that are
    /// already rebuilt are served by the spare.
    Reconstructing { spare: usize },
    /// Fully rebuilt.  All I/O goes to the spare.
    Spared { spare: usize },
}

impl DiskStatus {
    /// Has this column permanently lost its original disk?
    pub fn is_failed(self) -> bool {
        !matches!(self, DiskStatus::Optimal | DiskStatus::Spared{..})
    }
}

#[derive(Clone, Debug)]
struct ColumnState {
    status: DiskStatus,
    /// Which reconstruction units have been rebuilt onto the spare.
    rebuilt: FixedBitSet,
}

/// Per-column status of the array, consulted when mapping accesses.
#[derive(Clone, Debug)]
pub struct ArrayStatus {
    cols: Vec<ColumnState>,
    sectors_per_ru: u64,
}

impl ArrayStatus {
    pub fn new(ncols: usize, sectors_per_ru: u64) -> Self {
        let cols = vec![ColumnState {
            status: DiskStatus::Optimal,
            rebuilt: FixedBitSet::with_capacity(0)
        }; ncols];
        ArrayStatus { cols, sectors_per_ru }
    }

    /// Begin reconstructing `col` onto `spare`
    pub fn begin_reconstruction(&mut self, col: ColT, spare: usize,
                                num_rus: usize)
    {
        self.cols[col].status = DiskStatus::Reconstructing { spare };
        self.cols[col].rebuilt = FixedBitSet::with_capacity(num_rus);
    }

    pub fn finish_reconstruction(&mut self, col: ColT) {
        if let DiskStatus::Reconstructing{spare} = self.cols[col].status {
            self.cols[col].status = DiskStatus::Spared{spare};
            self.cols[col].rebuilt = FixedBitSet::with_capacity(0);
        }
    }

    /// Mark a column failed.  Returns its previous status.
    pub fn fail(&mut self, col: ColT) -> DiskStatus {
        let old = self.cols[col].status;
        self.cols[col].status = DiskStatus::Failed;
        self.cols[col].rebuilt.clear();
        old
    }

    /// Does any column have a failed disk?
    pub fn is_degraded(&self) -> bool {
        self.cols.iter().any(|c| c.status.is_failed())
    }

    /// Are all of the given sectors of `col` rebuilt onto its spare?
    pub fn is_rebuilt(&self, col: ColT, start: SectorT, nsectors: u64)
        -> bool
    {
        let first = (start / self.sectors_per_ru) as usize;
        let last = ((start + nsectors - 1) / self.sectors_per_ru) as usize;
        let rebuilt = &self.cols[col].rebuilt;
        (first..=last).all(|ru| ru < rebuilt.len() && rebuilt.contains(ru))
    }

    pub fn mark_rebuilt(&mut self, col: ColT, ru: usize) {
        self.cols[col].rebuilt.insert(ru);
    }

    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    pub fn status(&self, col: ColT) -> DiskStatus {
        self.cols[col].status
    }
}

// LCOV_EXCL_STOP
