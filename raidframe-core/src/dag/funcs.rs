// vim: tw=80
//! The work performed by each kind of DAG node

use futures::FutureExt;

use super::{engine::Fired, xor::bxor, *};

impl Dag {
    /// Perform a node's work.
    ///
    /// When the DAG is no longer `Enable`, nodes still fire but do no work.
    /// Disk nodes still acquire and release their queue slots.
    pub(super) fn do_func(&self, id: NodeId, enabled: bool, env: &DagEnv<'_>)
        -> Fired
    {
        match &self.nodes[id].kind {
            NodeKind::Nil => Fired::Done(Ok(())),
            NodeKind::Terminate => {
                let h = &self.header;
                if h.num_commits == h.num_commit_nodes {
                    Fired::Done(Ok(()))
                } else {
                    tracing::error!(num_commits = h.num_commits,
                        num_commit_nodes = h.num_commit_nodes,
                        "DAG terminated before all commit nodes fired");
                    Fired::Done(Err(Error::EIO))
                }
            },
            NodeKind::DiskRead{pda, buf} => {
                Fired::from(env.disks.get(pda.disk).and_then(|disk| {
                    if !enabled {
                        Ok(disk.nop())
                    } else if pda.failed {
                        Err(Error::EIO)
                    } else {
                        let dbm = self.buf_mut(*buf)?;
                        Ok(disk.read_at(dbm, pda.start_sector))
                    }
                }))
            },
            NodeKind::DiskWrite{pda, buf} => {
                Fired::from(env.disks.get(pda.disk).and_then(|disk| {
                    if !enabled {
                        Ok(disk.nop())
                    } else if pda.failed {
                        Err(Error::EIO)
                    } else {
                        let db = self.buf_const(*buf)?;
                        Ok(disk.write_at(db, pda.start_sector))
                    }
                }))
            },
            NodeKind::Xor{kind, inputs, result} => {
                if enabled {
                    Fired::Done(self.xor(*kind, inputs, *result, env.geom))
                } else {
                    Fired::Done(Ok(()))
                }
            },
            NodeKind::ParityLog{op, pda, buf} => {
                if !enabled {
                    return Fired::Done(Ok(()));
                }
                Fired::from(env.parity_log.ok_or(Error::ENODEV)
                    .and_then(|plog| {
                        let db = self.buf_const(*buf)?;
                        let rx = plog.append_parity(*op, pda, db)?;
                        Ok(rx.map(|r| r.unwrap_or(Err(Error::ECANCELED)))
                           .boxed())
                    }))
            },
        }
    }

    /// Reverse a node's effects during rollback
    pub(super) fn undo_func(&self, id: NodeId) -> Result<()> {
        match &self.nodes[id].kind {
            NodeKind::DiskWrite{..} | NodeKind::ParityLog{..} =>
                Err(Error::EIO),
            _ => Ok(())
        }
    }

    fn xor(&self, kind: XorKind, inputs: &[(PhysDiskAddr, BufId)],
           result: BufId, geom: &Geometry) -> Result<()>
    {
        let bps = geom.bytes_per_sector as u64;
        let mut dst = self.buf_mut(result)?;
        for (pda, buf) in inputs.iter() {
            if *buf == result {
                continue;
            }
            let src = self.buf_const(*buf)?;
            match kind {
                XorKind::Simple => bxor(&src[..], &mut dst[..])?,
                XorKind::Regular => {
                    let off = (geom.su_offset(pda.start_sector) * bps) as usize;
                    let d = dst.get_mut(off..off + src.len())
                        .ok_or(Error::EINVAL)?;
                    bxor(&src[..], d)?;
                },
                XorKind::Recovery{failed} => {
                    let fstart = geom.su_offset(failed.start_sector);
                    let fend = fstart + failed.num_sector;
                    let start = geom.su_offset(pda.start_sector);
                    let end = start + pda.num_sector;
                    let lo = start.max(fstart);
                    let hi = end.min(fend);
                    if lo >= hi {
                        return Err(Error::EINVAL);
                    }
                    let soff = ((lo - start) * bps) as usize;
                    let doff = ((lo - fstart) * bps) as usize;
                    let len = ((hi - lo) * bps) as usize;
                    let s = src.get(soff..soff + len).ok_or(Error::EINVAL)?;
                    let d = dst.get_mut(doff..doff + len)
                        .ok_or(Error::EINVAL)?;
                    bxor(s, d)?;
                }
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
