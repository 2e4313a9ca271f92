// vim: tw=80
//! Reconstruction of failed disks onto spares, and parity rewrite.
//!
//! Both operate on one unit at a time: a reconstruction unit of the failed
//! column, or one stripe.  The caller is responsible for excluding user I/O
//! from the unit while it is being rewritten.

use std::sync::{
    RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering}
};

use crate::{
    dag::{build::create_rebuild_dag, DagEnv},
    disk::ArrayStatus,
    layout::{Geometry, Layout},
    stripe_map::{redirect, AddrType, PhysDiskAddr},
    types::*,
    util::AllocTracker,
};

/// Progress of a long-running operation, as a snapshot
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProgressInfo {
    pub total: u64,
    pub completed: u64,
    pub remaining: u64,
}

/// Progress counters of a long-running operation.  Readable while the
/// operation runs.
#[derive(Debug, Default)]
pub struct Progress {
    running: AtomicBool,
    total: AtomicU64,
    completed: AtomicU64,
}

impl Progress {
    /// Begin an operation of `total` units.  Fails if one is already running.
    pub(crate) fn start(&self, total: u64) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::EALREADY);
        }
        self.completed.store(0, Ordering::Release);
        self.total.store(total, Ordering::Release);
        Ok(())
    }

    pub(crate) fn advance(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ProgressInfo {
        let total = self.total.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire).min(total);
        ProgressInfo { total, completed, remaining: total - completed }
    }

    /// Percent complete.  100 when nothing is running.
    pub fn percent(&self) -> u64 {
        if !self.is_running() {
            return 100;
        }
        let info = self.info();
        if info.total == 0 {
            0
        } else {
            info.completed * 100 / info.total
        }
    }
}

/// The stripe stored in `row` of column `col`, if any
fn stripe_at(geom: &Geometry, col: ColT, row: u64) -> Option<StripeNumT> {
    let stripe = match geom.layout {
        Layout::Raid1 => row * (geom.num_cols / 2) as u64 + (col / 2) as u64,
        _ => row
    };
    (stripe < geom.stripes).then_some(stripe)
}

/// Rebuild reconstruction unit `ru` of column `col` onto disk `spare`.
///
/// The lost contents are the XOR of the other columns of the unit's stripe.
/// Parts of the column holding nothing recoverable, like a parity log, are
/// skipped.
pub(crate) async fn rebuild_unit(env: &DagEnv<'_>, status: &RwLock<ArrayStatus>,
                                 tracker: &AllocTracker, col: ColT,
                                 spare: usize, ru: usize) -> Result<()>
{
    let geom = env.geom;
    let start = ru as u64 * geom.sectors_per_ru;
    let row = start / geom.sectors_per_su;
    let Some(stripe) = stripe_at(geom, col, row) else {
        return Ok(());
    };
    let cols = geom.stripe_cols(stripe);
    if !cols.contains(&col) {
        return Ok(());
    }
    let sources = {
        let status = status.read().unwrap();
        cols.iter()
            .filter(|c| **c != col)
            .map(|c| redirect(&status,
                PhysDiskAddr::new(*c, start, geom.sectors_per_ru,
                                  AddrType::Data)))
            .collect::<Vec<_>>()
    };
    if sources.iter().any(|pda| pda.failed) {
        tracing::error!(col, ru, "No redundant data to rebuild from");
        return Err(Error::EIO);
    }
    let mut target = PhysDiskAddr::new(col, start, geom.sectors_per_ru,
                                       AddrType::Data);
    target.disk = spare;
    let mut dag = create_rebuild_dag(&sources, target, geom.bytes_per_sector,
                                     tracker);
    dag.execute(env).await
}

/// Recompute the parity (or mirror copy) of one stripe from its data.
pub(crate) async fn rewrite_stripe(env: &DagEnv<'_>,
                                   status: &RwLock<ArrayStatus>,
                                   tracker: &AllocTracker, stripe: StripeNumT)
    -> Result<()>
{
    let geom = env.geom;
    let pcol = geom.parity_col(stripe).ok_or(Error::EOPNOTSUPP)?;
    let start = geom.stripe_row(stripe) * geom.sectors_per_su;
    let n = geom.sectors_per_su;
    let (sources, target) = {
        let status = status.read().unwrap();
        let sources = geom.data_cols(stripe).into_iter()
            .map(|c| redirect(&status,
                PhysDiskAddr::new(c, start, n, AddrType::Data)))
            .collect::<Vec<_>>();
        let target = redirect(&status,
            PhysDiskAddr::new(pcol, start, n, AddrType::Parity));
        (sources, target)
    };
    if target.failed || sources.iter().any(|pda| pda.failed) {
        return Err(Error::EIO);
    }
    let mut dag = create_rebuild_dag(&sources, target, geom.bytes_per_sector,
                                     tracker);
    dag.execute(env).await
}

// LCOV_EXCL_STOP
