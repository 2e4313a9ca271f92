// vim: tw=80
//! Access stripe maps: which physical sectors an access touches

use fixedbitset::FixedBitSet;

use crate::{
    disk::{ArrayStatus, DiskStatus},
    layout::{Geometry, Layout},
    types::*,
    util::{AllocTracker, Tracked},
};

/// What a `PhysDiskAddr` holds
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrType {
    Data,
    /// Parity, or the mirror copy in a mirrored layout
    Parity,
    /// Second parity of a P+Q layout
    Q,
}

/// A contiguous range of sectors on one disk
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysDiskAddr {
    /// Logical column of the array
    pub col: ColT,
    /// The disk that actually services I/O for this range.  It differs from
    /// `col` once the column has been rebuilt onto a spare.
    pub disk: usize,
    pub start_sector: SectorT,
    pub num_sector: u64,
    pub addr_type: AddrType,
    /// Logical address of the first sector.  For parity, the logical address
    /// of the first data sector at the same stripe unit offset.
    pub raid_address: RaidAddrT,
    /// Byte offset into the access's buffer
    pub buf_offset: usize,
    /// Is the range unavailable?
    pub failed: bool,
}

impl PhysDiskAddr {
    /// A range on a healthy disk, not associated with any user buffer
    pub fn new(col: ColT, start_sector: SectorT, num_sector: u64,
               addr_type: AddrType) -> Self
    {
        PhysDiskAddr {
            col,
            disk: col,
            start_sector,
            num_sector,
            addr_type,
            raid_address: 0,
            buf_offset: 0,
            failed: false
        }
    }

    pub fn end_sector(&self) -> SectorT {
        self.start_sector + self.num_sector
    }

    /// Restrict to `[start, end)`, which must overlap.
    pub fn restrict(&self, start: SectorT, end: SectorT) -> Self {
        debug_assert!(start < self.end_sector() && end > self.start_sector);
        let s = start.max(self.start_sector);
        let e = end.min(self.end_sector());
        let mut pda = *self;
        pda.start_sector = s;
        pda.num_sector = e - s;
        pda.raid_address += s - self.start_sector;
        pda
    }
}

/// One stripe's worth of an access
#[derive(Clone, Debug)]
pub struct AccessStripeMap {
    pub stripe_id: StripeNumT,
    /// First logical sector accessed
    pub raid_address: RaidAddrT,
    /// One past the last logical sector accessed
    pub end_raid_address: RaidAddrT,
    pub total_sectors_accessed: u64,
    pub num_data_failed: usize,
    pub num_parity_failed: usize,
    pub num_q_failed: usize,
    /// One entry per stripe unit accessed
    pub phys_info: Vec<PhysDiskAddr>,
    pub parity_info: Vec<PhysDiskAddr>,
    pub q_info: Vec<PhysDiskAddr>,
    /// Columns of the array that can't serve this access.  For accessed
    /// columns, it reflects the accessed ranges only.
    pub failed_cols: FixedBitSet,
    /// All columns belonging to the stripe
    pub stripe_cols: Vec<ColT>,
}

impl AccessStripeMap {
    /// How many of the stripe's columns can't serve this access?
    pub fn num_failed_in_stripe(&self) -> usize {
        self.stripe_cols.iter()
            .filter(|c| self.failed_cols.contains(**c))
            .count()
    }

    pub fn num_stripe_units_accessed(&self) -> usize {
        self.phys_info.len()
    }
}

/// All stripes' worth of one access
#[derive(Debug)]
pub struct AccessStripeMapHeader {
    pub stripe_maps: Vec<AccessStripeMap>,
    _tracked: Tracked,
}

impl AccessStripeMapHeader {
    pub fn num_stripes(&self) -> usize {
        self.stripe_maps.len()
    }
}

/// Point `pda` at whichever disk currently services it
pub(crate) fn redirect(status: &ArrayStatus, mut pda: PhysDiskAddr)
    -> PhysDiskAddr
{
    match status.status(pda.col) {
        DiskStatus::Optimal => (),
        DiskStatus::Failed => pda.failed = true,
        DiskStatus::Reconstructing{spare} => {
            if status.is_rebuilt(pda.col, pda.start_sector, pda.num_sector) {
                pda.disk = spare;
            } else {
                pda.failed = true;
            }
        },
        DiskStatus::Spared{spare} => pda.disk = spare,
    }
    pda
}

/// Map a logical access onto physical disk ranges, one `AccessStripeMap` per
/// stripe touched.
///
/// # Parameters
///
/// - `raid_addr`:  First logical sector
/// - `nsectors`:   Length of the access in sectors
/// - `buf_offset`: Byte offset of `raid_addr` within the caller's buffer.
///                 Nonzero when mapping part of a larger access.
pub fn map_access(geom: &Geometry, status: &ArrayStatus, raid_addr: RaidAddrT,
                  nsectors: u64, buf_offset: usize, tracker: &AllocTracker)
    -> Result<AccessStripeMapHeader>
{
    if nsectors == 0 || raid_addr + nsectors > geom.size() {
        return Err(Error::EINVAL);
    }
    let spsu = geom.sectors_per_su;
    let bps = geom.bytes_per_sector;
    let ndata = geom.num_data_cols() as u64;
    let end = raid_addr + nsectors;
    let mut stripe_maps = Vec::new();
    let mut addr = raid_addr;
    while addr < end {
        let stripe = geom.stripe_id(addr);
        let asm_end = end.min((stripe + 1) * geom.stripe_data_sectors());
        let row_base = geom.stripe_row(stripe) * spsu;
        let mut phys_info = Vec::new();
        let mut a = addr;
        while a < asm_end {
            let su = a / spsu;
            let pend = asm_end.min((su + 1) * spsu);
            let col = geom.data_col(stripe, (su % ndata) as usize);
            let pda = PhysDiskAddr {
                col,
                disk: col,
                start_sector: row_base + a % spsu,
                num_sector: pend - a,
                addr_type: AddrType::Data,
                raid_address: a,
                buf_offset: buf_offset + (a - raid_addr) as usize * bps,
                failed: false
            };
            phys_info.push(redirect(status, pda));
            a = pend;
        }

        let mut parity_info = Vec::new();
        if let Some(pcol) = geom.parity_col(stripe) {
            if geom.layout == Layout::Raid1 {
                for d in phys_info.iter() {
                    let mut mirror = *d;
                    mirror.col = pcol;
                    mirror.disk = pcol;
                    mirror.failed = false;
                    mirror.addr_type = AddrType::Parity;
                    parity_info.push(redirect(status, mirror));
                }
            } else {
                // A single stripe unit's parity covers the same range.  When
                // several units are accessed, parity covers a whole unit.
                let (start, num_sector) = if phys_info.len() == 1 {
                    (phys_info[0].start_sector, phys_info[0].num_sector)
                } else {
                    (row_base, spsu)
                };
                let first_su_addr = stripe * geom.stripe_data_sectors();
                let pda = PhysDiskAddr {
                    col: pcol,
                    disk: pcol,
                    start_sector: start,
                    num_sector,
                    addr_type: AddrType::Parity,
                    raid_address: first_su_addr + start - row_base,
                    buf_offset: 0,
                    failed: false
                };
                parity_info.push(redirect(status, pda));
            }
        }

        let stripe_cols = geom.stripe_cols(stripe);
        let mut failed_cols = FixedBitSet::with_capacity(geom.num_cols);
        for col in stripe_cols.iter() {
            let accessed = phys_info.iter().chain(parity_info.iter())
                .filter(|pda| pda.col == *col)
                .collect::<Vec<_>>();
            let failed = if accessed.is_empty() {
                status.status(*col).is_failed()
            } else {
                accessed.iter().any(|pda| pda.failed)
            };
            failed_cols.set(*col, failed);
        }
        if let Some(lcol) = geom.log_col() {
            failed_cols.set(lcol, status.status(lcol).is_failed());
        }

        let num_data_failed = phys_info.iter().filter(|p| p.failed).count();
        let num_parity_failed = parity_info.iter().filter(|p| p.failed)
            .count();
        stripe_maps.push(AccessStripeMap {
            stripe_id: stripe,
            raid_address: addr,
            end_raid_address: asm_end,
            total_sectors_accessed: asm_end - addr,
            num_data_failed,
            num_parity_failed,
            num_q_failed: 0,
            phys_info,
            parity_info,
            q_info: Vec::new(),
            failed_cols,
            stripe_cols,
        });
        addr = asm_end;
    }
    Ok(AccessStripeMapHeader {
        stripe_maps,
        _tracked: tracker.track()
    })
}

// LCOV_EXCL_STOP
