// vim: tw=80
//! Write DAGs

use crate::paritylog::LogOp;
use super::*;

/// ```text
///            / Wnd \
/// H - Nil(c) - Wnd - Trm
///            \ Wnd /
/// ```
pub(super) fn nonredundant(ctx: &BuildCtx<'_>, asm: &AccessStripeMap)
    -> Result<Dag>
{
    let mut dag = Dag::new("NonredundantWrite", ctx.tracker);
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.commit(nil);
    dag.add_root(nil);
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.set_terminal(trm);
    for pda in asm.phys_info.iter() {
        let buf = ctx.user_buf(&mut dag, pda)?;
        let wnd = dag.add_node(NodeKind::DiskWrite{pda: *pda, buf}, "Wnd");
        dag.link(nil, wnd);
        dag.link(wnd, trm);
    }
    Ok(dag)
}

/// Write both halves of each mirror pair.  A failed half is dropped.
///
/// ```text
///            / Wpd \
/// H - Cmt(c)        Nil - Trm
///            \ Wsd /
/// ```
pub(super) fn raid1(ctx: &BuildCtx<'_>, asm: &AccessStripeMap) -> Result<Dag>
{
    let mut dag = Dag::new("Raid1Write", ctx.tracker);
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    dag.add_root(cmt);
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.set_terminal(trm);
    dag.link(nil, trm);
    let mut any = false;
    for (d, m) in asm.phys_info.iter().zip(asm.parity_info.iter()) {
        let buf = ctx.user_buf(&mut dag, d)?;
        for (pda, name) in [(d, "Wpd"), (m, "Wsd")] {
            if pda.failed {
                continue;
            }
            let w = dag.add_node(NodeKind::DiskWrite{pda: *pda, buf}, name);
            dag.link(cmt, w);
            dag.link(w, nil);
            any = true;
        }
    }
    if !any {
        dag.link(cmt, nil);
    }
    Ok(dag)
}

/// Read-modify-write.  New parity is old parity XOR old data XOR new data.
/// With parity logging, the XOR of old and new data is logged as a parity
/// update instead.
///
/// ```text
///       / Rod \              / Wnd \
/// H - Nil - Rod - Xor - Cmt - Wnd - Trm
///       \ Rop /              \ Wnp /
/// ```
pub(super) fn small(ctx: &BuildCtx<'_>, asm: &AccessStripeMap, logging: bool)
    -> Result<Dag>
{
    let creator = if logging {"ParityLogSmallWrite"} else {"SmallWrite"};
    let mut dag = Dag::new(creator, ctx.tracker);
    let parity = *asm.parity_info.first().ok_or(Error::EINVAL)?;
    let kind = if asm.num_stripe_units_accessed() == 1 {
        XorKind::Simple
    } else {
        XorKind::Regular
    };
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.add_root(nil);

    let mut inputs = Vec::new();
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    for pda in asm.phys_info.iter() {
        let old = ctx.alloc_for(&mut dag, pda);
        let new = ctx.user_buf(&mut dag, pda)?;
        reads.push(dag.add_node(NodeKind::DiskRead{pda: *pda, buf: old},
                                "Rod"));
        writes.push((*pda, new));
        inputs.push((*pda, old));
        inputs.push((*pda, new));
    }
    let result = ctx.alloc_for(&mut dag, &parity);
    if !logging {
        // XOR in place into the old parity
        reads.push(dag.add_node(NodeKind::DiskRead{pda: parity, buf: result},
                                "Rop"));
        inputs.insert(0, (parity, result));
    }
    let xor = dag.add_node(NodeKind::Xor{kind, inputs, result}, "Xor");
    for rd in reads {
        dag.link(nil, rd);
        dag.link(rd, xor);
    }
    finish_write(&mut dag, xor, writes, parity, result,
                 logging.then_some(LogOp::Update));
    Ok(dag)
}

/// Reconstruct-write.  New parity is the XOR of the new data and whatever
/// old data the access doesn't overwrite.  A failed data unit, if any, is
/// never read and its write is dropped.  With parity logging, the new parity
/// is logged as an overwrite.
///
/// ```text
///       / Rod \              / Wnd \
/// H - Nil - Rod - Xor - Cmt - Wnd - Trm
///       \ Rod /              \ Wnp /
/// ```
pub(super) fn large(ctx: &BuildCtx<'_>, asm: &AccessStripeMap, logging: bool)
    -> Result<Dag>
{
    let geom = ctx.geom;
    let creator = if logging {"ParityLogLargeWrite"} else {"LargeWrite"};
    let mut dag = Dag::new(creator, ctx.tracker);
    let parity = *asm.parity_info.first().ok_or(Error::EINVAL)?;
    let (rstart, rend) = su_range(geom, &parity);
    let kind = if rend - rstart == geom.sectors_per_su {
        XorKind::Regular
    } else {
        XorKind::Simple
    };
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.add_root(nil);

    let mut inputs = Vec::new();
    let mut writes = Vec::new();
    for pda in asm.phys_info.iter() {
        let new = ctx.user_buf(&mut dag, pda)?;
        inputs.push((*pda, new));
        if !pda.failed {
            writes.push((*pda, new));
        }
    }
    let mut reads = Vec::new();
    for (d, col) in geom.data_cols(asm.stripe_id).iter().enumerate() {
        let covered = asm.phys_info.iter()
            .find(|pda| pda.col == *col)
            .map(|pda| su_range(geom, pda));
        for (s, e) in uncovered(rstart, rend, covered) {
            let pda = ctx.map_unaccessed(&mut dag, asm.stripe_id, d, s, e)?;
            let buf = ctx.alloc_for(&mut dag, &pda);
            reads.push(dag.add_node(NodeKind::DiskRead{pda, buf}, "Rod"));
            inputs.push((pda, buf));
        }
    }
    let result = ctx.alloc_for(&mut dag, &parity);
    let xor = dag.add_node(NodeKind::Xor{kind, inputs, result}, "Xor");
    if reads.is_empty() {
        dag.link(nil, xor);
    }
    for rd in reads {
        dag.link(nil, rd);
        dag.link(rd, xor);
    }
    finish_write(&mut dag, xor, writes, parity, result,
                 logging.then_some(LogOp::Overwrite));
    Ok(dag)
}

/// Add the commit point, the data and parity writes, and the terminal node.
/// With `log_op`, parity goes to the parity log rather than the disk.
fn finish_write(dag: &mut Dag, xor: NodeId, writes: Vec<(PhysDiskAddr, BufId)>,
                parity: PhysDiskAddr, result: BufId, log_op: Option<LogOp>)
{
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    dag.link(xor, cmt);
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.set_terminal(trm);
    for (pda, buf) in writes {
        let wnd = dag.add_node(NodeKind::DiskWrite{pda, buf}, "Wnd");
        dag.link(cmt, wnd);
        dag.link(wnd, trm);
    }
    let wnp = match log_op {
        Some(op @ LogOp::Update) =>
            dag.add_node(NodeKind::ParityLog{op, pda: parity, buf: result},
                         "Lpu"),
        Some(op @ LogOp::Overwrite) =>
            dag.add_node(NodeKind::ParityLog{op, pda: parity, buf: result},
                         "Lpo"),
        None =>
            dag.add_node(NodeKind::DiskWrite{pda: parity, buf: result}, "Wnp")
    };
    dag.link(cmt, wnp);
    dag.link(wnp, trm);
}
