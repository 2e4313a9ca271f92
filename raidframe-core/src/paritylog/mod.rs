// vim: tw=80
//! Parity logging.
//!
//! Instead of updating parity in place, parity writes are appended to an
//! in-core log for their region of the parity space.  Full logs are written
//! to the region's on-disk log, and when that fills up the whole region is
//! reintegrated: its logged updates are folded into parity.
//!
//! Appending never waits.  When no log buffer is free, or the region is being
//! reintegrated, the pending work is queued and resumed once the resource
//! becomes available.
//!
//! Lock order: a region's `state` before its `reint`.  The pool and the disk
//! manager's queues are leaves.

use std::{
    collections::VecDeque,
    mem,
    ops::Range,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering}
    }
};

use divbuf::DivBufShared;
use futures::channel::oneshot;
use tokio::sync::Notify;

use crate::{
    config::ParityLogConfig,
    layout::{Geometry, Layout},
    stripe_map::PhysDiskAddr,
    types::*,
};

pub mod disk_mgr;

/// How a logged sector combines with existing parity
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogOp {
    /// XOR into parity
    Update,
    /// Replace parity
    Overwrite,
}

/// Describes one sector of a parity log
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogRecord {
    pub parity_sector: SectorT,
    pub op: LogOp,
}

/// Completion state shared by every item of one parity write
#[derive(Debug)]
struct LogCommon {
    /// Items not yet completely logged
    cnt: AtomicUsize,
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl LogCommon {
    fn complete(&self, r: Result<()>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            // The receiver may have been dropped; that's fine.
            let _ = tx.send(r);
        }
    }

    fn fail(&self, e: Error) {
        self.complete(Err(e))
    }

    /// One item is fully logged
    fn item_done(&self) {
        if self.cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete(Ok(()))
        }
    }
}

/// A pending parity update for a contiguous run of sectors in one region
#[derive(Debug)]
pub struct ParityLogData {
    op: LogOp,
    region: RegionIdT,
    /// Next parity sector to log
    parity_sector: SectorT,
    /// Sectors remaining
    num_sector: u64,
    /// Data for the remaining sectors
    buf: IoVec,
    common: Arc<LogCommon>,
}

impl ParityLogData {
    pub fn region(&self) -> RegionIdT {
        self.region
    }

    pub fn num_sector(&self) -> u64 {
        self.num_sector
    }
}

/// A fixed-capacity buffer of log records
#[derive(Debug)]
pub struct ParityLog {
    records: Vec<LogRecord>,
    buf: DivBufShared,
    region: RegionIdT,
    /// Offset of this log within its region's on-disk log, once dumped
    disk_offset: u64,
}

impl ParityLog {
    fn new(nsectors: usize, bytes_per_sector: usize) -> Self {
        ParityLog {
            records: Vec::with_capacity(nsectors),
            buf: DivBufShared::from(vec![0u8; nsectors * bytes_per_sector]),
            region: 0,
            disk_offset: 0
        }
    }

    fn reset(mut self) -> Self {
        self.records.clear();
        self.disk_offset = 0;
        self
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }
}

#[derive(Debug)]
struct RegionState {
    /// The log currently being filled
    core_log: Option<ParityLog>,
    /// Sectors of the on-disk log in use
    disk_count: u64,
    /// What each used sector of the on-disk log holds
    disk_map: Vec<(u64, LogRecord)>,
    reint_blocked: VecDeque<ParityLogData>,
    logging_enabled: bool,
    /// Reintegration failed.  The region can no longer log.
    failed: bool,
}

#[derive(Debug, Default)]
struct ReintState {
    in_progress: bool,
}

#[derive(Debug)]
struct RegionInfo {
    state: Mutex<RegionState>,
    reint: Mutex<ReintState>,
    /// Size of the on-disk log, in sectors
    capacity: u64,
    /// First parity sector covered by this region
    parity_start: SectorT,
    num_parity: u64,
    /// First sector of this region's log on the log column
    log_start: SectorT,
}

#[derive(Debug, Default)]
struct LogPool {
    free: Vec<ParityLog>,
    /// Work waiting for a free log, oldest first
    blocked: VecDeque<ParityLogData>,
}

/// A request to fold every region's log into parity
#[derive(Debug)]
struct FoldRequest {
    /// Also disable logging for good
    disable: bool,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
struct MgrQueues {
    flush: VecDeque<ParityLog>,
    reint: VecDeque<(RegionIdT, Option<ParityLog>)>,
    folds: Vec<FoldRequest>,
    shutdown: bool,
}

/// Work swapped out of the disk manager's queues
#[derive(Debug, Default)]
struct Work {
    flush: VecDeque<ParityLog>,
    reint: VecDeque<(RegionIdT, Option<ParityLog>)>,
}

impl Work {
    fn is_empty(&self) -> bool {
        self.flush.is_empty() && self.reint.is_empty()
    }
}

enum Acquired {
    Log(ParityLog, ParityLogData),
    Queued,
}

/// All parity logging state of one array
#[derive(Debug)]
pub struct ParityLogContext {
    num_sectors_per_log: usize,
    bytes_per_sector: usize,
    parity_col: ColT,
    log_col: ColT,
    region_parity_sectors: u64,
    regions: Vec<RegionInfo>,
    pool: Mutex<LogPool>,
    queues: Mutex<MgrQueues>,
    wakeup: Notify,
    enabled: AtomicBool,
}

impl ParityLogContext {
    pub fn new(geom: &Geometry, config: &ParityLogConfig) -> Result<Self> {
        let (Some(parity_col), Some(log_col)) = (geom.parity_col(0),
                                                 geom.log_col())
        else {
            return Err(Error::EINVAL);
        };
        if geom.layout != Layout::ParityLogging || config.num_regions == 0 {
            return Err(Error::EINVAL);
        }
        let bps = geom.bytes_per_sector;
        let nspl = config.num_sectors_per_log;
        let rps = geom.rows() * geom.sectors_per_su / config.num_regions as u64;
        let regions = (0..config.num_regions).map(|r| {
            RegionInfo {
                state: Mutex::new(RegionState {
                    core_log: None,
                    disk_count: 0,
                    disk_map: Vec::new(),
                    reint_blocked: VecDeque::new(),
                    logging_enabled: true,
                    failed: false,
                }),
                reint: Mutex::new(ReintState::default()),
                capacity: config.region_log_capacity,
                parity_start: r as u64 * rps,
                num_parity: rps,
                log_start: r as u64 * config.region_log_capacity,
            }
        }).collect();
        let free = (0..config.num_pool_logs)
            .map(|_| ParityLog::new(nspl, bps))
            .collect();
        Ok(ParityLogContext {
            num_sectors_per_log: nspl,
            bytes_per_sector: bps,
            parity_col,
            log_col,
            region_parity_sectors: rps,
            regions,
            pool: Mutex::new(LogPool { free, blocked: VecDeque::new() }),
            queues: Mutex::new(MgrQueues::default()),
            wakeup: Notify::new(),
            enabled: AtomicBool::new(true),
        })
    }

    /// Region covering a parity sector
    pub fn region_of(&self, parity_sector: SectorT) -> RegionIdT {
        (parity_sector / self.region_parity_sectors) as RegionIdT
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Should parity writes go through the log?
    pub fn logging_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Split a parity write into log items, one per region touched.
    ///
    /// Returns the items and a channel that completes once every item has
    /// been logged.
    pub fn create_parity_log_data(&self, op: LogOp, pda: &PhysDiskAddr,
                                  buf: IoVec)
        -> Result<(Vec<ParityLogData>, oneshot::Receiver<Result<()>>)>
    {
        let bps = self.bytes_per_sector;
        let end = pda.end_sector();
        if buf.len() != pda.num_sector as usize * bps || pda.num_sector == 0 ||
            end > self.region_parity_sectors * self.regions.len() as u64
        {
            return Err(Error::EINVAL);
        }
        let mut runs = Vec::new();
        let mut sector = pda.start_sector;
        while sector < end {
            let region = self.region_of(sector);
            let rend = end.min((region as u64 + 1) * self.region_parity_sectors);
            runs.push((region, sector, rend - sector));
            sector = rend;
        }
        let (tx, rx) = oneshot::channel();
        let common = Arc::new(LogCommon {
            cnt: AtomicUsize::new(runs.len()),
            tx: Mutex::new(Some(tx))
        });
        let items = runs.into_iter().map(|(region, sector, n)| {
            let off = (sector - pda.start_sector) as usize * bps;
            ParityLogData {
                op,
                region,
                parity_sector: sector,
                num_sector: n,
                buf: buf.slice(off, off + n as usize * bps),
                common: common.clone()
            }
        }).collect();
        Ok((items, rx))
    }

    /// Log a parity write.  The returned channel completes once every sector
    /// is in a log.
    pub fn append_parity(&self, op: LogOp, pda: &PhysDiskAddr, buf: IoVec)
        -> Result<oneshot::Receiver<Result<()>>>
    {
        let (items, rx) = self.create_parity_log_data(op, pda, buf)?;
        self.parity_log_append(items, &mut None, None, false);
        Ok(rx)
    }

    /// Append log items to their regions' core logs, one sector at a time.
    ///
    /// Never blocks.  An item that can't get a log buffer, or whose region is
    /// being reintegrated, is queued and resumed later.
    ///
    /// # Parameters
    ///
    /// - `incoming`:    A log buffer to use before trying the pool
    /// - `clear_reint`: Reintegration of this region just finished.  Reopen
    ///                  it, and resume the work that was waiting on it ahead
    ///                  of `items`.
    /// - `draining`:    `items` were waiting for a log buffer, and may take
    ///                  one ahead of other waiters.
    pub fn parity_log_append<I>(&self, items: I,
                                incoming: &mut Option<ParityLog>,
                                clear_reint: Option<RegionIdT>,
                                draining: bool)
        where I: IntoIterator<Item=ParityLogData>
    {
        let mut items = items.into_iter().collect::<VecDeque<_>>();
        let mut cur: Option<(RegionIdT, MutexGuard<'_, RegionState>)> = None;
        if let Some(r) = clear_reint {
            let region = &self.regions[r];
            let mut state = region.state.lock().unwrap();
            {
                let mut reint = region.reint.lock().unwrap();
                reint.in_progress = false;
                state.disk_count = 0;
                state.disk_map.clear();
            }
            let blocked = mem::take(&mut state.reint_blocked);
            for item in blocked.into_iter().rev() {
                items.push_front(item);
            }
            tracing::debug!(region = r, nitems = items.len(),
                "Reintegration complete");
            cur = Some((r, state));
        }

        while let Some(mut item) = items.pop_front() {
            let r = item.region;
            // Keep the region locked while consecutive items share it
            if cur.as_ref().map(|(cr, _)| *cr) != Some(r) {
                cur = None;
                cur = Some((r, self.regions[r].state.lock().unwrap()));
            }
            let Some((_, state)) = cur.as_mut() else { continue };
            let region = &self.regions[r];
            if state.failed {
                item.common.fail(Error::EIO);
                continue;
            }
            if !state.logging_enabled {
                item.common.fail(Error::ESHUTDOWN);
                continue;
            }
            if region.reint.lock().unwrap().in_progress {
                state.reint_blocked.push_back(item);
                continue;
            }
            loop {
                if item.num_sector == 0 {
                    item.common.item_done();
                    break;
                }
                if state.core_log.is_none() {
                    match self.acquire_parity_log(item, incoming, draining) {
                        Acquired::Log(mut log, it) => {
                            log.region = r;
                            state.core_log = Some(log);
                            item = it;
                        },
                        Acquired::Queued => break
                    }
                }
                let full = state.core_log.as_ref()
                    .map(|log| log.records.len() >= self.num_sectors_per_log)
                    .unwrap_or(false);
                if full {
                    if self.dump_parity_log(r, state) {
                        state.reint_blocked.push_back(item);
                        break;
                    }
                    continue;
                }
                if let Err(e) = self.log_one_sector(state, &mut item) {
                    item.common.fail(e);
                    break;
                }
            }
        }
    }

    fn log_one_sector(&self, state: &mut RegionState, item: &mut ParityLogData)
        -> Result<()>
    {
        let bps = self.bytes_per_sector;
        let log = state.core_log.as_mut().ok_or(Error::EFAULT)?;
        let off = log.records.len() * bps;
        let mut dbm = log.buf.try_mut().map_err(|_| Error::EFAULT)?;
        dbm[off..off + bps].copy_from_slice(&item.buf[..bps]);
        log.records.push(LogRecord {
            parity_sector: item.parity_sector,
            op: item.op
        });
        item.parity_sector += 1;
        item.num_sector -= 1;
        item.buf = item.buf.slice_from(bps);
        Ok(())
    }

    /// Get a log buffer for `item`, or queue it until one is released.
    ///
    /// Free buffers go to waiters in FIFO order, so a newcomer may not take
    /// one while others are waiting.
    fn acquire_parity_log(&self, item: ParityLogData,
                          incoming: &mut Option<ParityLog>, draining: bool)
        -> Acquired
    {
        if let Some(log) = incoming.take() {
            return Acquired::Log(log, item);
        }
        let mut pool = self.pool.lock().unwrap();
        if draining || pool.blocked.is_empty() {
            if let Some(log) = pool.free.pop() {
                return Acquired::Log(log, item);
            }
        }
        tracing::debug!(region = item.region, "No free parity log");
        if draining {
            pool.blocked.push_front(item);
        } else {
            pool.blocked.push_back(item);
        }
        Acquired::Queued
    }

    /// Move a region's full core log to disk.
    ///
    /// If the region's on-disk log has no room, start reintegration instead
    /// and return `true`: the caller's work must wait for it.
    fn dump_parity_log(&self, r: RegionIdT, state: &mut RegionState) -> bool {
        let region = &self.regions[r];
        let Some(mut log) = state.core_log.take() else {
            return false;
        };
        let nspl = self.num_sectors_per_log as u64;
        let mut reint = region.reint.lock().unwrap();
        if reint.in_progress {
            state.core_log = Some(log);
            return true;
        }
        if state.disk_count + nspl > region.capacity {
            reint.in_progress = true;
            drop(reint);
            tracing::debug!(region = r, "Region log full; reintegrating");
            let mut queues = self.queues.lock().unwrap();
            queues.reint.push_back((r, Some(log)));
            drop(queues);
            self.wakeup.notify_one();
            return true;
        }
        drop(reint);
        log.region = r;
        log.disk_offset = state.disk_count;
        for (i, rec) in log.records.iter().enumerate() {
            state.disk_map.push((state.disk_count + i as u64, *rec));
        }
        state.disk_count += nspl;
        self.queues.lock().unwrap().flush.push_back(log);
        self.wakeup.notify_one();
        false
    }

    /// Return log buffers to the pool.  Work waiting for a buffer gets it
    /// first.
    pub fn release_parity_logs<I>(&self, logs: I)
        where I: IntoIterator<Item=ParityLog>
    {
        let mut logs = logs.into_iter().map(ParityLog::reset)
            .collect::<Vec<_>>();
        while let Some(log) = logs.pop() {
            let item = {
                let mut pool = self.pool.lock().unwrap();
                match pool.blocked.pop_front() {
                    Some(item) => item,
                    None => {
                        pool.free.push(log);
                        continue;
                    }
                }
            };
            let mut incoming = Some(log);
            self.parity_log_append(std::iter::once(item), &mut incoming, None,
                                   true);
            logs.extend(incoming.map(ParityLog::reset));
        }
    }

    /// Reintegration of region `r` failed.  Fail everything waiting on it,
    /// and everything that tries to use it later.
    fn fail_region(&self, r: RegionIdT) {
        let region = &self.regions[r];
        let (blocked, core) = {
            let mut state = region.state.lock().unwrap();
            state.failed = true;
            region.reint.lock().unwrap().in_progress = false;
            (mem::take(&mut state.reint_blocked), state.core_log.take())
        };
        tracing::error!(region = r, nblocked = blocked.len(),
            "Parity log region failed");
        for item in blocked {
            item.common.fail(Error::EIO);
        }
        self.release_parity_logs(core);
    }

    /// Begin reintegrating `r` unless it already is being reintegrated.
    /// Returns its core log, if any, and whether reintegration was started.
    fn start_reintegration(&self, r: RegionIdT, disable: bool)
        -> (bool, Option<ParityLog>)
    {
        let region = &self.regions[r];
        let mut state = region.state.lock().unwrap();
        if disable {
            state.logging_enabled = false;
        }
        let empty = state.core_log.as_ref()
            .map(|log| log.records.is_empty())
            .unwrap_or(true);
        if state.failed || (empty && state.disk_count == 0) {
            return (false, None);
        }
        let mut reint = region.reint.lock().unwrap();
        if reint.in_progress {
            return (false, None);
        }
        reint.in_progress = true;
        (true, state.core_log.take())
    }

    fn take_work(&self) -> Work {
        let mut queues = self.queues.lock().unwrap();
        Work {
            flush: mem::take(&mut queues.flush),
            reint: mem::take(&mut queues.reint),
        }
    }

    fn take_requests(&self) -> (Vec<FoldRequest>, bool) {
        let mut queues = self.queues.lock().unwrap();
        (mem::take(&mut queues.folds), queues.shutdown)
    }

    /// Ask the disk manager to fold every region's log into parity.
    pub fn request_fold(&self, disable: bool)
        -> oneshot::Receiver<Result<()>>
    {
        let (tx, rx) = oneshot::channel();
        let mut queues = self.queues.lock().unwrap();
        if queues.shutdown {
            // The disk manager may already be gone
            let _ = tx.send(Err(Error::ESHUTDOWN));
            return rx;
        }
        if disable {
            self.enabled.store(false, Ordering::Release);
        }
        queues.folds.push(FoldRequest { disable, tx });
        drop(queues);
        self.wakeup.notify_one();
        rx
    }

    /// Ask the disk manager to fold all logs, disable logging, and exit.
    pub fn request_shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        self.queues.lock().unwrap().shutdown = true;
        self.wakeup.notify_one();
    }

    pub fn reint_in_progress(&self, r: RegionIdT) -> bool {
        self.regions[r].reint.lock().unwrap().in_progress
    }

    /// Sectors of region `r`'s on-disk log in use
    pub fn disk_count(&self, r: RegionIdT) -> u64 {
        self.regions[r].state.lock().unwrap().disk_count
    }

    /// Records in region `r`'s core log
    pub fn core_records(&self, r: RegionIdT) -> usize {
        self.regions[r].state.lock().unwrap().core_log.as_ref()
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    pub fn blocked_on_reint(&self, r: RegionIdT) -> usize {
        self.regions[r].state.lock().unwrap().reint_blocked.len()
    }

    pub fn blocked_on_log(&self) -> usize {
        self.pool.lock().unwrap().blocked.len()
    }

    pub fn free_logs(&self) -> usize {
        self.pool.lock().unwrap().free.len()
    }

    /// Logs waiting to be written to disk
    pub fn pending_flushes(&self) -> usize {
        self.queues.lock().unwrap().flush.len()
    }

    pub fn region_failed(&self, r: RegionIdT) -> bool {
        self.regions[r].state.lock().unwrap().failed
    }

    /// Regions whose logged updates were lost.  Their parity is stale.
    pub fn failed_regions(&self) -> Vec<RegionIdT> {
        (0..self.regions.len()).filter(|r| self.region_failed(*r)).collect()
    }

    /// Parity sectors covered by region `r`
    pub fn parity_range(&self, r: RegionIdT) -> Range<SectorT> {
        let region = &self.regions[r];
        region.parity_start..region.parity_start + region.num_parity
    }

    /// Forget a region's failure, once its parity has been recomputed from
    /// data.  The region never logs again.
    pub fn clear_region_failure(&self, r: RegionIdT) {
        let mut state = self.regions[r].state.lock().unwrap();
        state.logging_enabled = false;
        state.failed = false;
        state.disk_count = 0;
        state.disk_map.clear();
    }
}

#[cfg(test)]
mod tests;
