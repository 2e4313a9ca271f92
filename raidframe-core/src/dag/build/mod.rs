// vim: tw=80
//! DAG construction functions.
//!
//! Each function turns one `AccessStripeMap` into a DAG.  Node names follow
//! the usual abbreviations:
//!
//! - `Rod`/`Rop`: read old data/parity
//! - `Wnd`/`Wnp`: write new data/parity
//! - `Rrd`/`Rp`:  read redundant data/parity for recovery
//! - `Lpu`/`Lpo`: log a parity update/overwrite
//! - `Cmt`:       commit point
//! - `Trm`:       terminal node

use crate::{
    disk::ArrayStatus,
    layout::Geometry,
    stripe_map::{map_access, AccessStripeMap, PhysDiskAddr},
    types::*,
    util::AllocTracker,
};
use super::*;

mod read;
mod write;

/// Everything a construction function needs besides the stripe map itself
pub struct BuildCtx<'a> {
    pub geom: &'a Geometry,
    pub status: &'a ArrayStatus,
    pub tracker: &'a AllocTracker,
    /// Data being written, as the whole access's buffer.  `None` for reads.
    pub data: Option<&'a IoVec>,
}

impl BuildCtx<'_> {
    /// Reference the part of the caller's data destined for `pda`
    fn user_buf(&self, dag: &mut Dag, pda: &PhysDiskAddr) -> Result<BufId> {
        let data = self.data.ok_or(Error::EINVAL)?;
        let len = pda.num_sector as usize * self.geom.bytes_per_sector;
        if pda.buf_offset + len > data.len() {
            return Err(Error::EINVAL);
        }
        let iovec = data.slice(pda.buf_offset, pda.buf_offset + len);
        Ok(dag.add_buf(DagBuf::User(iovec)))
    }

    /// Allocate a zeroed buffer the size of `pda`
    fn alloc_for(&self, dag: &mut Dag, pda: &PhysDiskAddr) -> BufId {
        dag.alloc_buf(pda.num_sector as usize * self.geom.bytes_per_sector)
    }

    /// Map sectors `[start, end)` within the `d`th data unit of `stripe`,
    /// which the access itself doesn't cover.  The new stripe map is freed
    /// along with the DAG.
    fn map_unaccessed(&self, dag: &mut Dag, stripe: StripeNumT, d: usize,
                      start: u64, end: u64) -> Result<PhysDiskAddr>
    {
        let addr = stripe * self.geom.stripe_data_sectors() +
            d as u64 * self.geom.sectors_per_su + start;
        let asmh = map_access(self.geom, self.status, addr, end - start, 0,
                              self.tracker)?;
        let pda = asmh.stripe_maps.first()
            .and_then(|asm| asm.phys_info.first())
            .copied()
            .ok_or(Error::EINVAL)?;
        dag.header.asm_list.push(asmh);
        Ok(pda)
    }
}

/// Offsets within its stripe unit covered by a PDA
fn su_range(geom: &Geometry, pda: &PhysDiskAddr) -> (u64, u64) {
    let start = geom.su_offset(pda.start_sector);
    (start, start + pda.num_sector)
}

/// The parts of `[start, end)` not covered by `covered`
fn uncovered(start: u64, end: u64, covered: Option<(u64, u64)>)
    -> Vec<(u64, u64)>
{
    match covered {
        None => vec![(start, end)],
        Some((cs, ce)) => {
            let mut v = Vec::with_capacity(2);
            if start < cs.min(end) {
                v.push((start, cs.min(end)));
            }
            if ce.max(start) < end {
                v.push((ce.max(start), end));
            }
            v
        }
    }
}

/// Every strategy for building a DAG
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DagCreateFn {
    NonredundantRead,
    NonredundantWrite,
    Raid1Read,
    Raid1Write,
    DegradedRead,
    /// Read-modify-write
    SmallWrite,
    /// Reconstruct-write.  Also handles a single failed data unit.
    LargeWrite,
    ParityLogSmallWrite,
    ParityLogLargeWrite,
}

impl DagCreateFn {
    /// Build a DAG for the access described by `asm`
    pub fn build(self, ctx: &BuildCtx<'_>, asm: &AccessStripeMap)
        -> Result<Dag>
    {
        match self {
            DagCreateFn::NonredundantRead => read::nonredundant(ctx, asm),
            DagCreateFn::Raid1Read => read::raid1(ctx, asm),
            DagCreateFn::DegradedRead => read::degraded(ctx, asm),
            DagCreateFn::NonredundantWrite => write::nonredundant(ctx, asm),
            DagCreateFn::Raid1Write => write::raid1(ctx, asm),
            DagCreateFn::SmallWrite => write::small(ctx, asm, false),
            DagCreateFn::LargeWrite => write::large(ctx, asm, false),
            DagCreateFn::ParityLogSmallWrite => write::small(ctx, asm, true),
            DagCreateFn::ParityLogLargeWrite => write::large(ctx, asm, true),
        }
    }
}

/// A DAG that reads one range into a buffer of its own
pub fn create_simple_read_dag(pda: PhysDiskAddr, bytes_per_sector: usize,
                              tracker: &AllocTracker) -> (Dag, BufId)
{
    let mut dag = Dag::new("SimpleRead", tracker);
    let buf = dag.alloc_buf(pda.num_sector as usize * bytes_per_sector);
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    let rd = dag.add_node(NodeKind::DiskRead{pda, buf}, "Rd");
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.add_root(cmt);
    dag.link(cmt, rd);
    dag.link(rd, trm);
    dag.set_terminal(trm);
    (dag, buf)
}

/// A DAG that writes `data` to one range
pub fn create_simple_write_dag(pda: PhysDiskAddr, data: IoVec,
                               tracker: &AllocTracker) -> Dag
{
    let mut dag = Dag::new("SimpleWrite", tracker);
    let buf = dag.add_buf(DagBuf::User(data));
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    let wr = dag.add_node(NodeKind::DiskWrite{pda, buf}, "Wr");
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.add_root(cmt);
    dag.link(cmt, wr);
    dag.link(wr, trm);
    dag.set_terminal(trm);
    dag
}

/// A DAG that writes the XOR of `sources` to `target`.  Used to rebuild a
/// lost unit, to recompute parity, or (with one source) to copy a mirror.
///
/// ```text
///       / R \
/// H - Nil - R - Xor - Cmt - W - Trm
///       \ R /
/// ```
pub fn create_rebuild_dag(sources: &[PhysDiskAddr], target: PhysDiskAddr,
                          bytes_per_sector: usize, tracker: &AllocTracker)
    -> Dag
{
    let mut dag = Dag::new("Rebuild", tracker);
    let len = target.num_sector as usize * bytes_per_sector;
    let result = dag.alloc_buf(len);
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.add_root(nil);
    let inputs = sources.iter().map(|pda| {
        (*pda, dag.alloc_buf(len))
    }).collect::<Vec<_>>();
    let xor = dag.add_node(NodeKind::Xor {
        kind: XorKind::Simple,
        inputs: inputs.clone(),
        result
    }, "Xor");
    for (pda, buf) in inputs {
        let rd = dag.add_node(NodeKind::DiskRead{pda, buf}, "R");
        dag.link(nil, rd);
        dag.link(rd, xor);
    }
    if sources.is_empty() {
        dag.link(nil, xor);
    }
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    let wr = dag.add_node(NodeKind::DiskWrite{pda: target, buf: result}, "W");
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.link(xor, cmt);
    dag.link(cmt, wr);
    dag.link(wr, trm);
    dag.set_terminal(trm);
    dag
}
