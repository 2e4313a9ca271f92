// vim: tw=80
//! A complete RAID set: its configuration, disks, and the state shared by
//! every access.

use std::sync::{Arc, Mutex, RwLock};

use futures::future;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::{
    aselect::select_algorithm,
    config::RaidConfig,
    dag::{build::BuildCtx, DagEnv, DagList},
    disk::{ArrayStatus, DiskQueue, DiskSet, DiskStatus},
    layout::{AccessFlags, Geometry, IoType},
    paritylog::{disk_mgr::DiskManager, ParityLogContext},
    recon::{self, Progress, ProgressInfo},
    stripe_map::map_access,
    types::*,
    util::{div_roundup, AllocTracker},
};

/// A failed access, with the columns whose disks returned I/O errors
struct AccessError {
    error: Error,
    bad_columns: Vec<ColT>,
}

impl From<Error> for AccessError {
    fn from(error: Error) -> Self {
        AccessError { error, bad_columns: Vec::new() }
    }
}

pub struct RaidSet {
    config: RaidConfig,
    geom: Geometry,
    /// Member disks, followed by any spares
    disks: Arc<DiskSet>,
    status: Arc<RwLock<ArrayStatus>>,
    tracker: AllocTracker,
    plog: Option<Arc<ParityLogContext>>,
    plog_worker: Mutex<Option<JoinHandle<()>>>,
    /// User accesses hold this shared.  Reconstruction and parity rewrite
    /// hold it exclusively while they rewrite a unit, and so does anything
    /// that stops parity logging.
    gate: tokio::sync::RwLock<()>,
    recon: Progress,
    rewrite: Progress,
}

impl RaidSet {
    /// Assemble a RAID set.
    ///
    /// The first `config.num_cols` disks are members, and the rest are
    /// spares.  With parity logging, the disk manager is started on the
    /// current Tokio runtime.
    pub fn create(config: RaidConfig, disks: Vec<Arc<dyn DiskQueue>>)
        -> Result<Self>
    {
        config.validate()?;
        let geom = Geometry::new(&config);
        let needed = geom.disk_sectors(config.parity_log.as_ref());
        if disks.len() < config.num_cols {
            tracing::error!(ndisks = disks.len(), num_cols = config.num_cols,
                "Too few disks");
            return Err(Error::EINVAL);
        }
        if let Some(small) = disks.iter().position(|d| d.sectors() < needed) {
            tracing::error!(disk = small, needed, "Disk too small");
            return Err(Error::ENOSPC);
        }
        let disks = Arc::new(DiskSet::new(disks, config.queue_depth));
        let status = Arc::new(RwLock::new(
            ArrayStatus::new(config.num_cols, geom.sectors_per_ru)));
        let tracker = AllocTracker::new();
        let (plog, plog_worker) = match &config.parity_log {
            Some(plc) => {
                let ctx = Arc::new(ParityLogContext::new(&geom, plc)?);
                let jh = DiskManager::new(ctx.clone(), disks.clone(),
                    status.clone(), geom.clone(), tracker.clone()).spawn();
                (Some(ctx), Some(jh))
            },
            None => (None, None)
        };
        tracing::info!(layout = ?config.layout, num_cols = config.num_cols,
            size = geom.size(), "Created RAID set");
        Ok(RaidSet {
            config,
            geom,
            disks,
            status,
            tracker,
            plog,
            plog_worker: Mutex::new(plog_worker),
            gate: tokio::sync::RwLock::new(()),
            recon: Progress::default(),
            rewrite: Progress::default(),
        })
    }

    pub fn config(&self) -> &RaidConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// Usable size in sectors
    pub fn size(&self) -> RaidAddrT {
        self.geom.size()
    }

    pub fn disk_status(&self, col: ColT) -> DiskStatus {
        self.status.read().unwrap().status(col)
    }

    pub fn parity_log(&self) -> Option<&ParityLogContext> {
        self.plog.as_deref()
    }

    /// Number of stripe maps and DAGs currently alive
    pub fn live_allocations(&self) -> usize {
        self.tracker.live()
    }

    fn nsectors(&self, len: usize) -> Result<u64> {
        let bps = self.geom.bytes_per_sector;
        if len == 0 || len % bps != 0 {
            return Err(Error::EINVAL);
        }
        Ok((len / bps) as u64)
    }

    fn flags(&self, io_type: IoType) -> AccessFlags {
        let parity_logging = self.plog.as_ref()
            .map(|plog| plog.logging_enabled())
            .unwrap_or(false);
        AccessFlags { io_type, parity_logging }
    }

    fn env(&self) -> DagEnv<'_> {
        DagEnv {
            disks: &self.disks,
            geom: &self.geom,
            parity_log: self.plog.as_deref()
        }
    }

    /// Map, select, and execute one access.  Reads are copied into `out`.
    async fn access(&self, io_type: IoType, raid_addr: RaidAddrT,
                    nsectors: u64, data: Option<&IoVec>,
                    out: Option<&mut [u8]>)
        -> std::result::Result<(), AccessError>
    {
        let flags = self.flags(io_type);
        let (_asmh, mut lists) = {
            let status = self.status.read().unwrap();
            let asmh = map_access(&self.geom, &status, raid_addr, nsectors, 0,
                                  &self.tracker)?;
            let ctx = BuildCtx {
                geom: &self.geom,
                status: &status,
                tracker: &self.tracker,
                data
            };
            let lists = select_algorithm(&self.geom, flags, &asmh, &ctx)
                .map_err(Error::from)?;
            (asmh, lists)
        };
        let env = self.env();
        let results = future::join_all(
            lists.iter_mut().map(|list| list.execute(&env))
        ).await;
        if let Some(error) = results.into_iter().find_map(|r| r.err()) {
            let bad_columns = lists.iter()
                .flat_map(|list| list.dags.iter())
                .flat_map(|dag| dag.bad_columns())
                .collect();
            return Err(AccessError { error, bad_columns });
        }
        if let Some(out) = out {
            for dag in lists.iter().flat_map(|l: &DagList| l.dags.iter()) {
                dag.copy_outputs(out)?;
            }
        }
        Ok(())
    }

    /// Run an access.  If a disk fails during it, mark the disk failed and
    /// retry once in degraded mode.
    async fn access_with_retry(&self, io_type: IoType, raid_addr: RaidAddrT,
                               nsectors: u64, data: Option<&IoVec>,
                               mut out: Option<&mut [u8]>) -> Result<()>
    {
        let e = {
            let _guard = self.gate.read().await;
            match self.access(io_type, raid_addr, nsectors, data,
                              out.as_deref_mut()).await
            {
                Ok(()) => return Ok(()),
                Err(e) => e
            }
        };
        // A parity log region that failed can't log anything more
        let lost_log = self.plog.as_ref().is_some_and(|plog| {
            plog.logging_enabled() && !plog.failed_regions().is_empty()
        });
        if e.bad_columns.is_empty() && !lost_log {
            return Err(e.error);
        }
        {
            // Failing a disk may fold the parity logs, which must not race
            // with logged writes.
            let _guard = self.gate.write().await;
            for col in e.bad_columns.iter() {
                self.mark_failed(*col).await?;
            }
            self.disable_parity_logging().await?;
        }
        tracing::info!(raid_addr, nsectors, error = ?e.error,
            "Retrying access in degraded mode");
        let _guard = self.gate.read().await;
        self.access(io_type, raid_addr, nsectors, data, out).await
            .map_err(|e| e.error)
    }

    /// Read `buf.len()` bytes beginning at logical sector `raid_addr`
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn read_at(&self, mut buf: IoVecMut, raid_addr: RaidAddrT)
        -> Result<()>
    {
        let nsectors = self.nsectors(buf.len())?;
        self.access_with_retry(IoType::Read, raid_addr, nsectors, None,
                               Some(&mut buf[..])).await
    }

    /// Write `buf` beginning at logical sector `raid_addr`
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn write_at(&self, buf: IoVec, raid_addr: RaidAddrT)
        -> Result<()>
    {
        let nsectors = self.nsectors(buf.len())?;
        self.access_with_retry(IoType::Write, raid_addr, nsectors, Some(&buf),
                               None).await
    }

    /// Stop parity logging, folding every logged update into parity.
    ///
    /// Regions whose logs can't be folded have stale parity.  It is
    /// recomputed from data, and if even that fails the parity column can't
    /// be trusted and is failed too.  The caller must hold the gate
    /// exclusively.
    async fn disable_parity_logging(&self) -> Result<()> {
        let Some(plog) = &self.plog else {
            return Ok(());
        };
        if !plog.logging_enabled() {
            return Ok(());
        }
        let r = plog.request_fold(true).await
            .unwrap_or(Err(Error::ESHUTDOWN));
        if let Err(e) = r {
            tracing::warn!(?e, "Could not fold parity logs");
        }
        self.repair_failed_regions(plog).await
    }

    /// Recompute the parity of every region whose logged updates were lost
    async fn repair_failed_regions(&self, plog: &ParityLogContext)
        -> Result<()>
    {
        let Some(pcol) = self.geom.parity_col(0) else {
            return Ok(());
        };
        let spsu = self.geom.sectors_per_su;
        let env = self.env();
        for r in plog.failed_regions() {
            if self.status.read().unwrap().status(pcol).is_failed() {
                // Reconstruction will recompute it anyway
                plog.clear_region_failure(r);
                continue;
            }
            let range = plog.parity_range(r);
            let end = div_roundup(range.end, spsu).min(self.geom.stripes);
            for stripe in range.start / spsu..end {
                let res = recon::rewrite_stripe(&env, &self.status,
                                                &self.tracker, stripe).await;
                if let Err(e) = res {
                    tracing::error!(region = r, stripe, ?e,
                        "Could not recompute lost parity");
                    self.status.write().unwrap().fail(pcol);
                    return Err(Error::EIO);
                }
            }
            tracing::info!(region = r, "Recomputed parity of lost log region");
            plog.clear_region_failure(r);
        }
        Ok(())
    }

    /// Mark a column failed.  The caller must hold the gate exclusively.
    async fn mark_failed(&self, col: ColT) -> Result<()> {
        let old = self.status.write().unwrap().fail(col);
        if old != DiskStatus::Failed {
            tracing::warn!(col, ?old, "Disk failed");
        }
        self.disable_parity_logging().await
    }

    /// Declare a member disk failed.  Subsequent accesses run in degraded
    /// mode.
    #[instrument(skip(self))]
    pub async fn fail_disk(&self, col: ColT) -> Result<()> {
        if col >= self.config.num_cols {
            return Err(Error::EINVAL);
        }
        let _guard = self.gate.write().await;
        self.mark_failed(col).await
    }

    /// Rebuild failed column `col` onto spare disk `spare`.  Afterwards the
    /// spare permanently replaces the column's original disk.
    #[instrument(skip(self))]
    pub async fn reconstruct(&self, col: ColT, spare: usize) -> Result<()> {
        if self.geom.layout.faults_tolerated() == 0 {
            return Err(Error::EOPNOTSUPP);
        }
        if col >= self.config.num_cols || spare < self.config.num_cols ||
            spare >= self.disks.len()
        {
            return Err(Error::EINVAL);
        }
        if self.disk_status(col) != DiskStatus::Failed {
            return Err(Error::EINVAL);
        }
        let nrus = self.geom.num_rus();
        self.recon.start(nrus as u64)?;
        {
            let _guard = self.gate.write().await;
            if let Err(e) = self.disable_parity_logging().await {
                self.recon.finish();
                return Err(e);
            }
            self.status.write().unwrap()
                .begin_reconstruction(col, spare, nrus);
        }
        tracing::info!(col, spare, nrus, "Reconstruction starting");
        let env = self.env();
        for ru in 0..nrus {
            let _guard = self.gate.write().await;
            let r = recon::rebuild_unit(&env, &self.status, &self.tracker,
                                        col, spare, ru).await;
            if let Err(e) = r {
                tracing::error!(col, ru, ?e, "Reconstruction failed");
                self.status.write().unwrap().fail(col);
                self.recon.finish();
                return Err(e);
            }
            self.status.write().unwrap().mark_rebuilt(col, ru);
            self.recon.advance();
        }
        self.status.write().unwrap().finish_reconstruction(col);
        self.recon.finish();
        tracing::info!(col, spare, "Reconstruction complete");
        Ok(())
    }

    /// Recompute all parity from data
    #[instrument(skip(self))]
    pub async fn rewrite_parity(&self) -> Result<()> {
        if self.geom.layout.faults_tolerated() == 0 {
            return Err(Error::EOPNOTSUPP);
        }
        if self.status.read().unwrap().is_degraded() {
            return Err(Error::EIO);
        }
        self.rewrite.start(self.geom.stripes)?;
        // Logged updates would be applied on top of the new parity, so
        // fold them first and keep new ones out until the end.
        let whole = match &self.plog {
            Some(plog) if plog.logging_enabled() => {
                let guard = self.gate.write().await;
                let r = plog.request_fold(false).await
                    .unwrap_or(Err(Error::ESHUTDOWN));
                if let Err(e) = r {
                    // Some region's log is lost, so stop logging.
                    tracing::warn!(?e, "Could not fold parity logs");
                    if let Err(e) = self.disable_parity_logging().await {
                        self.rewrite.finish();
                        return Err(e);
                    }
                }
                Some(guard)
            },
            _ => None
        };
        let env = self.env();
        for stripe in 0..self.geom.stripes {
            let _guard = match whole {
                Some(_) => None,
                None => Some(self.gate.write().await)
            };
            let r = recon::rewrite_stripe(&env, &self.status, &self.tracker,
                                          stripe).await;
            if let Err(e) = r {
                tracing::error!(stripe, ?e, "Parity rewrite failed");
                self.rewrite.finish();
                return Err(e);
            }
            self.rewrite.advance();
        }
        self.rewrite.finish();
        Ok(())
    }

    /// Reconstruction progress, as a percentage
    pub fn recon_progress(&self) -> u64 {
        if self.geom.layout.faults_tolerated() == 0 {
            100
        } else {
            self.recon.percent()
        }
    }

    pub fn recon_progress_ext(&self) -> ProgressInfo {
        self.recon.info()
    }

    /// Parity rewrite progress, as a percentage
    pub fn parity_rewrite_progress(&self) -> u64 {
        self.rewrite.percent()
    }

    pub fn parity_rewrite_progress_ext(&self) -> ProgressInfo {
        self.rewrite.info()
    }

    /// Fold all parity logs and stop the parity logging disk manager.
    /// Afterwards, parity is written in place.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.gate.write().await;
        let r = self.disable_parity_logging().await;
        if let Some(plog) = &self.plog {
            plog.request_shutdown();
        }
        let worker = self.plog_worker.lock().unwrap().take();
        if let Some(jh) = worker {
            jh.await.map_err(|e| {
                tracing::error!(?e, "Parity log disk manager died");
                Error::ECANCELED
            })?;
        }
        r
    }
}

impl Drop for RaidSet {
    fn drop(&mut self) {
        if let Some(plog) = &self.plog {
            // Let the disk manager fold and exit on its own
            plog.request_shutdown();
        }
    }
}
