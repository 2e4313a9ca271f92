// vim: tw=80
//! The parity log disk manager.
//!
//! A single task that writes full logs to their regions' on-disk logs and
//! reintegrates regions whose on-disk logs have filled.  It sleeps whenever
//! it has nothing to do.

use std::sync::{Arc, RwLock};

use futures::future;
use tracing::instrument;

use crate::{
    dag::{
        build::{create_simple_read_dag, create_simple_write_dag},
        xor::xor_into,
        DagEnv,
    },
    disk::{ArrayStatus, DiskSet, DiskStatus},
    layout::Geometry,
    stripe_map::{redirect, AddrType, PhysDiskAddr},
    util::AllocTracker,
};
use super::*;

/// The byte range `[start, start + len)` of data laid out back to back across
/// `pages`.  Comes up short if the pages do.
fn log_range<'a>(pages: &[&'a [u8]], mut start: usize, len: usize)
    -> Vec<&'a [u8]>
{
    let mut out = Vec::new();
    let mut left = len;
    for &page in pages {
        if left == 0 {
            break;
        }
        if start >= page.len() {
            start -= page.len();
            continue;
        }
        let n = (page.len() - start).min(left);
        out.push(&page[start..start + n]);
        left -= n;
        start = 0;
    }
    out
}

/// Apply logged records to a region's parity, in log order.
///
/// `pages` hold the records' data back to back.  Consecutive records of one
/// kind that cover consecutive parity sectors are applied as a single run,
/// whose data may straddle pages.
pub(super) fn apply_log(region: &RegionInfo, bytes_per_sector: usize,
                        parity: &mut [u8], records: &[LogRecord],
                        pages: &[&[u8]]) -> Result<()>
{
    let bps = bytes_per_sector;
    let mut i = 0;
    while i < records.len() {
        let first = records[i];
        let mut j = i + 1;
        while j < records.len() && records[j].op == first.op &&
            records[j].parity_sector == first.parity_sector + (j - i) as u64
        {
            j += 1;
        }
        let n = (j - i) as u64;
        let off = first.parity_sector.checked_sub(region.parity_start)
            .filter(|o| o + n <= region.num_parity)
            .ok_or(Error::EINVAL)? as usize * bps;
        let dst = parity.get_mut(off..off + n as usize * bps)
            .ok_or(Error::EINVAL)?;
        let src = log_range(pages, i * bps, dst.len());
        match first.op {
            LogOp::Update => xor_into(&src, dst)?,
            LogOp::Overwrite => {
                let mut copied = 0;
                for s in src {
                    dst[copied..copied + s.len()].copy_from_slice(s);
                    copied += s.len();
                }
                if copied < dst.len() {
                    return Err(Error::EFAULT);
                }
            }
        }
        i = j;
    }
    Ok(())
}

pub struct DiskManager {
    ctx: Arc<ParityLogContext>,
    disks: Arc<DiskSet>,
    status: Arc<RwLock<ArrayStatus>>,
    geom: Geometry,
    tracker: AllocTracker,
}

impl DiskManager {
    pub fn new(ctx: Arc<ParityLogContext>, disks: Arc<DiskSet>,
               status: Arc<RwLock<ArrayStatus>>, geom: Geometry,
               tracker: AllocTracker) -> Self
    {
        DiskManager { ctx, disks, status, geom, tracker }
    }

    /// Start the manager on the current Tokio runtime.  It exits after
    /// [`ParityLogContext::request_shutdown`].
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        tracing::debug!(nregions = self.ctx.num_regions(),
            "Parity log disk manager starting");
        loop {
            let work = self.ctx.take_work();
            if !work.is_empty() {
                self.process(work).await;
                continue;
            }
            let (folds, shutdown) = self.ctx.take_requests();
            if !folds.is_empty() {
                for fold in folds {
                    let r = self.fold(fold.disable).await;
                    // The requester may have given up
                    let _ = fold.tx.send(r);
                }
                continue;
            }
            if shutdown {
                if let Err(e) = self.fold(true).await {
                    tracing::error!(?e, "Could not fold parity logs");
                }
                tracing::info!("Parity log disk manager exiting");
                return;
            }
            self.ctx.wakeup.notified().await;
        }
    }

    fn env(&self) -> DagEnv<'_> {
        DagEnv {
            disks: &self.disks,
            geom: &self.geom,
            parity_log: None
        }
    }

    /// Mark the columns of failed disks as failed
    fn fail_columns(&self, cols: &[ColT]) {
        let mut status = self.status.write().unwrap();
        for col in cols.iter() {
            if status.fail(*col) != DiskStatus::Failed {
                tracing::warn!(col, "Failing disk");
            }
        }
    }

    fn pda(&self, col: ColT, start: SectorT, nsectors: u64, t: AddrType)
        -> PhysDiskAddr
    {
        let status = self.status.read().unwrap();
        redirect(&status, PhysDiskAddr::new(col, start, nsectors, t))
    }

    async fn process(&self, work: Work) {
        future::join_all(work.flush.into_iter().map(|log| self.flush(log)))
            .await;
        for (r, core) in work.reint {
            self.reintegrate(r, core).await;
        }
    }

    /// Process everything already queued
    async fn drain(&self) {
        loop {
            let work = self.ctx.take_work();
            if work.is_empty() {
                break;
            }
            self.process(work).await;
        }
    }

    /// Write a full log to its region's on-disk log, then recycle it.
    #[instrument(skip_all,
                 fields(region = log.region, offset = log.disk_offset))]
    async fn flush(&self, log: ParityLog) {
        let region = &self.ctx.regions[log.region];
        let nspl = self.ctx.num_sectors_per_log as u64;
        let mut bad = Vec::new();
        let r = match log.buf.try_const() {
            Ok(db) => {
                let pda = self.pda(self.ctx.log_col,
                    region.log_start + log.disk_offset, nspl, AddrType::Data);
                let mut dag = create_simple_write_dag(pda, db, &self.tracker);
                let r = dag.execute(&self.env()).await;
                bad.extend(dag.bad_columns());
                r
            },
            Err(_) => Err(Error::EFAULT)
        };
        if let Err(e) = r {
            tracing::error!(?e, "Could not write parity log");
            self.fail_columns(&bad);
            self.ctx.fail_region(log.region);
        }
        self.ctx.release_parity_logs(std::iter::once(log));
    }

    /// Fold every update logged for region `r` into its parity, then reopen
    /// the region.
    ///
    /// `core` holds the updates not yet written to the on-disk log.
    #[instrument(skip(self, core))]
    async fn reintegrate(&self, r: RegionIdT, core: Option<ParityLog>) {
        let (disk_count, disk_map) = {
            let state = self.ctx.regions[r].state.lock().unwrap();
            (state.disk_count, state.disk_map.clone())
        };
        let mut bad = Vec::new();
        let result = self.merge(r, disk_count, &disk_map, core.as_ref(),
                                &mut bad).await;
        self.ctx.release_parity_logs(core);
        match result {
            Ok(()) => {
                self.ctx.parity_log_append(std::iter::empty(), &mut None,
                                           Some(r), false);
            },
            Err(e) => {
                tracing::error!(?e, "Parity log reintegration failed");
                self.fail_columns(&bad);
                self.ctx.fail_region(r);
            }
        }
    }

    /// Compute a region's new parity: old parity, updated by the on-disk log
    /// and then by the in-core log.
    async fn merge(&self, r: RegionIdT, disk_count: u64,
                   disk_map: &[(u64, LogRecord)], core: Option<&ParityLog>,
                   bad: &mut Vec<ColT>) -> Result<()>
    {
        let region = &self.ctx.regions[r];
        let bps = self.geom.bytes_per_sector;
        let ppda = self.pda(self.ctx.parity_col, region.parity_start,
                            region.num_parity, AddrType::Parity);
        let (mut pdag, pbuf) = create_simple_read_dag(ppda, bps, &self.tracker);
        let mut ldag = (disk_count > 0).then(|| {
            let lpda = self.pda(self.ctx.log_col, region.log_start, disk_count,
                                AddrType::Data);
            create_simple_read_dag(lpda, bps, &self.tracker)
        });
        let env = self.env();
        let (pr, lr) = future::join(pdag.execute(&env), async {
            match ldag.as_mut() {
                Some((dag, _)) => dag.execute(&env).await,
                None => Ok(())
            }
        }).await;
        if pr.is_err() || lr.is_err() {
            bad.extend(pdag.bad_columns());
            if let Some((dag, _)) = &ldag {
                bad.extend(dag.bad_columns());
            }
            return pr.and(lr);
        }

        let parity = pdag.into_buf(pbuf)?;
        let log = match ldag {
            Some((dag, lbuf)) => Some(dag.into_buf(lbuf)?),
            None => None
        };
        {
            let mut dst = parity.try_mut().map_err(|_| Error::EFAULT)?;
            // The disk log, then the core log.  Only full logs are dumped, so
            // the disk log holds no gaps.
            let disk_src = log.as_ref()
                .map(|l| l.try_const())
                .transpose()
                .map_err(|_| Error::EFAULT)?;
            let core_src = core
                .map(|c| c.buf.try_const())
                .transpose()
                .map_err(|_| Error::EFAULT)?;
            let mut pages: Vec<&[u8]> = Vec::with_capacity(2);
            if let Some(db) = disk_src.as_ref() {
                let used = disk_map.len() * bps;
                pages.push(db.get(..used).ok_or(Error::EINVAL)?);
            }
            let mut records = disk_map.iter().map(|(_, rec)| *rec)
                .collect::<Vec<_>>();
            if let (Some(core), Some(db)) = (core, core_src.as_ref()) {
                let used = core.records.len() * bps;
                pages.push(db.get(..used).ok_or(Error::EINVAL)?);
                records.extend_from_slice(&core.records);
            }
            apply_log(region, bps, &mut dst[..], &records, &pages)?;
        }
        tracing::debug!(disk_count,
            core = core.map(|log| log.records.len()).unwrap_or(0),
            "Writing reintegrated parity");
        let db = parity.try_const().map_err(|_| Error::EFAULT)?;
        let mut wdag = create_simple_write_dag(ppda, db, &self.tracker);
        let r = wdag.execute(&env).await;
        bad.extend(wdag.bad_columns());
        r
    }

    /// Reintegrate every region.  With `disable`, also turn logging off for
    /// good.  Fails if any region is unusable afterwards.
    #[instrument(skip(self))]
    async fn fold(&self, disable: bool) -> Result<()> {
        self.drain().await;
        for r in 0..self.ctx.num_regions() {
            let (started, core) = self.ctx.start_reintegration(r, disable);
            if started {
                self.reintegrate(r, core).await;
            }
        }
        self.drain().await;
        if (0..self.ctx.num_regions()).any(|r| self.ctx.region_failed(r)) {
            Err(Error::EIO)
        } else {
            Ok(())
        }
    }
}
