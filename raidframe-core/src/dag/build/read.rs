// vim: tw=80
//! Read DAGs

use super::*;

/// ```text
///            / Rd \
/// H - Nil(c) - Rd - Trm
///            \ Rd /
/// ```
pub(super) fn nonredundant(ctx: &BuildCtx<'_>, asm: &AccessStripeMap)
    -> Result<Dag>
{
    let mut dag = Dag::new("NonredundantRead", ctx.tracker);
    read_units(ctx, &mut dag, asm.phys_info.iter().copied(), "Rd");
    Ok(dag)
}

/// Read from whichever half of each mirror pair is healthy, alternating
/// between halves by stripe when both are.
pub(super) fn raid1(ctx: &BuildCtx<'_>, asm: &AccessStripeMap) -> Result<Dag>
{
    let mut dag = Dag::new("Raid1Read", ctx.tracker);
    let prefer_data = asm.stripe_id % 2 == 0;
    let pdas = asm.phys_info.iter()
        .zip(asm.parity_info.iter())
        .map(|(d, m)| {
            if d.failed || (!m.failed && !prefer_data) {
                // The mirror holds the same data at the same offsets
                PhysDiskAddr { buf_offset: d.buf_offset, ..*m }
            } else {
                *d
            }
        }).collect::<Vec<_>>();
    read_units(ctx, &mut dag, pdas.into_iter(), "Rd");
    Ok(dag)
}

fn read_units<I>(ctx: &BuildCtx<'_>, dag: &mut Dag, pdas: I,
                 name: &'static str)
    where I: Iterator<Item=PhysDiskAddr>
{
    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.commit(nil);
    dag.add_root(nil);
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.set_terminal(trm);
    let mut any = false;
    for pda in pdas {
        let buf = ctx.alloc_for(dag, &pda);
        let rd = dag.add_node(NodeKind::DiskRead{pda, buf}, name);
        dag.link(nil, rd);
        dag.link(rd, trm);
        dag.add_output(buf, pda.buf_offset);
        any = true;
    }
    if !any {
        dag.link(nil, trm);
    }
}

/// Read a stripe with one failed data unit, reconstructing the missing data
/// from the surviving units and parity.
///
/// ```text
///       / Rd ------------------\
/// H - Nil - Rrd - Xor(recovery) - Cmt - Trm
///       \ Rp  /
/// ```
pub(super) fn degraded(ctx: &BuildCtx<'_>, asm: &AccessStripeMap)
    -> Result<Dag>
{
    let geom = ctx.geom;
    let mut dag = Dag::new("DegradedRead", ctx.tracker);
    let failed = *asm.phys_info.iter()
        .find(|pda| pda.failed)
        .ok_or(Error::EINVAL)?;
    let parity = asm.parity_info.first().ok_or(Error::EINVAL)?
        .restrict(failed.start_sector, failed.end_sector());
    let (fstart, fend) = su_range(geom, &failed);

    let nil = dag.add_node(NodeKind::Nil, "Nil");
    dag.add_root(nil);
    let result = ctx.alloc_for(&mut dag, &failed);
    dag.add_output(result, failed.buf_offset);
    let mut inputs = Vec::new();
    let mut rd_nodes = Vec::new();

    // Plain reads of the healthy accessed units.  Their buffers contribute
    // to the recovery wherever they overlap the lost range.
    for pda in asm.phys_info.iter().filter(|pda| !pda.failed) {
        let buf = ctx.alloc_for(&mut dag, pda);
        let rd = dag.add_node(NodeKind::DiskRead{pda: *pda, buf}, "Rd");
        dag.link(nil, rd);
        dag.add_output(buf, pda.buf_offset);
        let (s, e) = su_range(geom, pda);
        let overlaps = s < fend && e > fstart;
        if overlaps {
            inputs.push((*pda, buf));
        }
        rd_nodes.push((rd, overlaps));
    }

    // Whatever the plain reads didn't cover must be read separately
    let data_cols = geom.data_cols(asm.stripe_id);
    let mut rrd = Vec::new();
    for (d, col) in data_cols.iter().enumerate() {
        if *col == failed.col {
            continue;
        }
        let covered = asm.phys_info.iter()
            .find(|pda| pda.col == *col)
            .map(|pda| su_range(geom, pda));
        for (s, e) in uncovered(fstart, fend, covered) {
            let pda = ctx.map_unaccessed(&mut dag, asm.stripe_id, d, s, e)?;
            let buf = ctx.alloc_for(&mut dag, &pda);
            rrd.push(dag.add_node(NodeKind::DiskRead{pda, buf}, "Rrd"));
            inputs.push((pda, buf));
        }
    }
    let pbuf = ctx.alloc_for(&mut dag, &parity);
    let rp = dag.add_node(NodeKind::DiskRead{pda: parity, buf: pbuf}, "Rp");
    inputs.push((parity, pbuf));

    let xor = dag.add_node(NodeKind::Xor {
        kind: XorKind::Recovery{failed},
        inputs,
        result
    }, "Xor");
    let cmt = dag.add_node(NodeKind::Nil, "Cmt");
    dag.commit(cmt);
    let trm = dag.add_node(NodeKind::Terminate, "Trm");
    dag.set_terminal(trm);
    for (rd, overlaps) in rd_nodes {
        dag.link(rd, if overlaps { xor } else { cmt });
    }
    for r in rrd.into_iter().chain(std::iter::once(rp)) {
        dag.link(nil, r);
        dag.link(r, xor);
    }
    dag.link(xor, cmt);
    dag.link(cmt, trm);
    Ok(dag)
}
