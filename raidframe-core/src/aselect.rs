// vim: tw=80
//! Algorithm selection: choose and build the DAGs for an access.
//!
//! Each stripe preferably gets a single DAG.  When no single DAG can cover
//! a stripe, selection falls back to one DAG per stripe unit, and failing
//! that, one per sector.  If even a single sector can't be covered, the
//! whole access fails and nothing built for it survives.

use num_traits::FromPrimitive;
use thiserror::Error;

use crate::{
    dag::{build::{BuildCtx, DagCreateFn}, DagList},
    layout::{AccessFlags, SelectDag},
    stripe_map::{map_access, AccessStripeMapHeader},
    types::*,
};

/// No DAG construction function exists for some part of the access
pub const NO_DAG_FUNC: i32 = 1;

/// Failure to construct DAGs for an access, as an integer code
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("Cannot construct DAGs for access (code {0})")]
pub struct SelectError(pub i32);

impl From<Error> for SelectError {
    fn from(e: Error) -> Self {
        SelectError(i32::from(e))
    }
}

impl From<SelectError> for Error {
    fn from(e: SelectError) -> Self {
        if e.0 == NO_DAG_FUNC {
            Error::ENODEV
        } else {
            Error::from_i32(e.0).unwrap_or(Error::EUNKNOWN)
        }
    }
}

/// How one stripe will be covered
enum Plan {
    /// One DAG for the whole stripe
    Stripe(DagCreateFn),
    /// Sequential DAGs for pieces of the stripe, each with its own stripe map
    Split(Vec<(DagCreateFn, AccessStripeMapHeader)>),
}

/// Build one `DagList` per stripe of the access.
#[tracing::instrument(skip(sel, asmh, ctx))]
pub fn select_algorithm<S>(sel: &S, flags: AccessFlags,
                           asmh: &AccessStripeMapHeader, ctx: &BuildCtx<'_>)
    -> std::result::Result<Vec<DagList>, SelectError>
    where S: SelectDag + ?Sized
{
    let bps = ctx.geom.bytes_per_sector;
    let mut plans = Vec::with_capacity(asmh.num_stripes());
    for asm in asmh.stripe_maps.iter() {
        if let Some(f) = sel.select_stripe_fn(flags, asm) {
            plans.push(Plan::Stripe(f));
            continue;
        }
        if sel.stripe_is_unrecoverable(asm) {
            tracing::warn!(stripe = asm.stripe_id, "Stripe is unrecoverable");
            return Err(SelectError(NO_DAG_FUNC));
        }
        let mut parts = Vec::new();
        for pda in asm.phys_info.iter() {
            let sub = map_access(ctx.geom, ctx.status, pda.raid_address,
                pda.num_sector, pda.buf_offset, ctx.tracker)?;
            if let Some(f) = sel.select_unit_fn(flags, &sub.stripe_maps[0]) {
                parts.push((f, sub));
                continue;
            }
            for i in 0..pda.num_sector {
                let sub = map_access(ctx.geom, ctx.status,
                    pda.raid_address + i, 1, pda.buf_offset + i as usize * bps,
                    ctx.tracker)?;
                match sel.select_block_fn(flags, &sub.stripe_maps[0]) {
                    Some(f) => parts.push((f, sub)),
                    None => {
                        tracing::warn!(raid_address = pda.raid_address + i,
                            "No DAG for sector");
                        return Err(SelectError(NO_DAG_FUNC));
                    }
                }
            }
        }
        plans.push(Plan::Split(parts));
    }

    let mut lists = Vec::with_capacity(plans.len());
    for (asm, plan) in asmh.stripe_maps.iter().zip(plans) {
        let dags = match plan {
            Plan::Stripe(f) => vec![f.build(ctx, asm)?],
            Plan::Split(parts) => {
                tracing::debug!(stripe = asm.stripe_id, ndags = parts.len(),
                    "Split stripe access");
                let mut dags = Vec::with_capacity(parts.len());
                for (f, sub) in parts {
                    let mut dag = f.build(ctx, &sub.stripe_maps[0])?;
                    dag.header.asm_list.push(sub);
                    dags.push(dag);
                }
                dags
            }
        };
        lists.push(DagList { dags, stripe: asm.stripe_id });
    }
    Ok(lists)
}

// LCOV_EXCL_STOP
