// vim: tw=80
//! RAID layouts: how logical addresses map onto columns, and which DAG
//! construction functions apply to an access.

#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};

use crate::{
    config::{ParityLogConfig, RaidConfig},
    dag::build::DagCreateFn,
    stripe_map::AccessStripeMap,
    types::*,
    util::div_roundup,
};

/// Direction of an access
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoType {
    Read,
    Write
}

/// Per-access flags that influence DAG selection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccessFlags {
    pub io_type: IoType,
    /// Parity updates go through the parity log instead of directly to the
    /// parity disk.
    pub parity_logging: bool,
}

impl AccessFlags {
    pub fn read() -> Self {
        AccessFlags { io_type: IoType::Read, parity_logging: false }
    }

    pub fn write() -> Self {
        AccessFlags { io_type: IoType::Write, parity_logging: false }
    }
}

/// Every supported RAID organization
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Layout {
    /// Striping with no redundancy
    Raid0,
    /// Mirrored pairs: columns 2n and 2n + 1 hold identical data
    Raid1,
    /// Dedicated parity on the last column
    Raid4,
    /// Left-symmetric rotating parity
    Raid5,
    /// Dedicated parity column plus a dedicated log column.  Parity updates
    /// are logged and later reintegrated.
    ParityLogging,
}

impl Layout {
    /// How many disks may fail before data is lost?
    pub fn faults_tolerated(self) -> usize {
        match self {
            Layout::Raid0 => 0,
            _ => 1
        }
    }

    pub fn min_cols(self) -> usize {
        match self {
            Layout::Raid0 => 1,
            Layout::Raid1 => 2,
            Layout::Raid4 | Layout::Raid5 | Layout::ParityLogging => 3,
        }
    }
}

/// The DAG selection capability of a layout.
///
/// Each method returns the function that can build a DAG for the given
/// access, or `None` if no single DAG can cover it.  They are consulted from
/// coarsest to finest granularity.
#[cfg_attr(test, automock)]
pub trait SelectDag {
    /// Select a function for an access to some or all of one stripe
    fn select_stripe_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>;

    /// Select a function for an access to part of one stripe unit
    fn select_unit_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>;

    /// Select a function for a single-sector access
    fn select_block_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>;

    /// Can no subdivision of this stripe's access succeed?  If so, finer
    /// grained selection is pointless.
    fn stripe_is_unrecoverable(&self, asm: &AccessStripeMap) -> bool;
}

/// The fixed geometry of one array
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub layout: Layout,
    pub num_cols: usize,
    pub sectors_per_su: u64,
    pub sectors_per_ru: u64,
    pub bytes_per_sector: usize,
    /// Total number of stripes in the array
    pub stripes: StripeNumT,
}

impl Geometry {
    pub fn new(config: &RaidConfig) -> Self {
        Geometry {
            layout: config.layout,
            num_cols: config.num_cols,
            sectors_per_su: config.sectors_per_su,
            sectors_per_ru: config.sectors_per_ru(),
            bytes_per_sector: config.bytes_per_sector,
            stripes: config.stripes,
        }
    }

    /// Bytes in one stripe unit
    pub fn bytes_per_su(&self) -> usize {
        self.sectors_per_su as usize * self.bytes_per_sector
    }

    /// The column holding the `d`th data unit of `stripe`
    pub fn data_col(&self, stripe: StripeNumT, d: usize) -> ColT {
        match self.layout {
            Layout::Raid0 | Layout::Raid4 | Layout::ParityLogging => d,
            Layout::Raid1 => 2 * (stripe % self.npairs()) as usize,
            Layout::Raid5 => {
                let p = self.raid5_parity_col(stripe);
                (p + 1 + d) % self.num_cols
            }
        }
    }

    /// Data columns of `stripe`, in data unit order
    pub fn data_cols(&self, stripe: StripeNumT) -> Vec<ColT> {
        (0..self.num_data_cols()).map(|d| self.data_col(stripe, d)).collect()
    }

    /// Number of sectors each member disk must have
    pub fn disk_sectors(&self, plog: Option<&ParityLogConfig>) -> SectorT {
        let data = self.rows() * self.sectors_per_su;
        match plog {
            Some(pl) => data.max(pl.num_regions as u64 * pl.region_log_capacity),
            None => data
        }
    }

    /// The column holding each parity-logging region's log
    pub fn log_col(&self) -> Option<ColT> {
        match self.layout {
            Layout::ParityLogging => Some(self.num_cols - 1),
            _ => None
        }
    }

    fn npairs(&self) -> u64 {
        (self.num_cols / 2) as u64
    }

    pub fn num_data_cols(&self) -> usize {
        match self.layout {
            Layout::Raid0 => self.num_cols,
            Layout::Raid1 => 1,
            Layout::Raid4 | Layout::Raid5 => self.num_cols - 1,
            Layout::ParityLogging => self.num_cols - 2,
        }
    }

    /// Number of reconstruction units on each disk
    pub fn num_rus(&self) -> usize {
        (self.rows() * self.sectors_per_su / self.sectors_per_ru) as usize
    }

    /// The column holding the parity (or mirror copy) of `stripe`
    pub fn parity_col(&self, stripe: StripeNumT) -> Option<ColT> {
        match self.layout {
            Layout::Raid0 => None,
            Layout::Raid1 => Some(self.data_col(stripe, 0) + 1),
            Layout::Raid4 => Some(self.num_cols - 1),
            Layout::Raid5 => Some(self.raid5_parity_col(stripe)),
            Layout::ParityLogging => Some(self.num_cols - 2),
        }
    }

    fn raid5_parity_col(&self, stripe: StripeNumT) -> ColT {
        self.num_cols - 1 - (stripe % self.num_cols as u64) as usize
    }

    /// Number of stripe units stacked on each disk
    pub fn rows(&self) -> u64 {
        match self.layout {
            Layout::Raid1 => div_roundup(self.stripes, self.npairs()),
            _ => self.stripes
        }
    }

    /// Usable size of the array, in sectors
    pub fn size(&self) -> RaidAddrT {
        self.stripes * self.stripe_data_sectors()
    }

    /// Data sectors in one stripe
    pub fn stripe_data_sectors(&self) -> u64 {
        self.num_data_cols() as u64 * self.sectors_per_su
    }

    /// Every column that holds data or parity for `stripe`
    pub fn stripe_cols(&self, stripe: StripeNumT) -> Vec<ColT> {
        let mut cols = self.data_cols(stripe);
        cols.extend(self.parity_col(stripe));
        cols
    }

    pub fn stripe_id(&self, raid_addr: RaidAddrT) -> StripeNumT {
        raid_addr / self.stripe_data_sectors()
    }

    /// The row of stripe units on each disk occupied by `stripe`
    pub fn stripe_row(&self, stripe: StripeNumT) -> u64 {
        match self.layout {
            Layout::Raid1 => stripe / self.npairs(),
            _ => stripe
        }
    }

    /// Offset of a physical sector within its stripe unit
    pub fn su_offset(&self, sector: SectorT) -> u64 {
        sector % self.sectors_per_su
    }

    fn select(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>
    {
        match self.layout {
            Layout::Raid0 => {
                if asm.num_data_failed > 0 {
                    None
                } else if flags.io_type == IoType::Read {
                    Some(DagCreateFn::NonredundantRead)
                } else {
                    Some(DagCreateFn::NonredundantWrite)
                }
            },
            Layout::Raid1 => {
                let lost = asm.phys_info.iter()
                    .zip(asm.parity_info.iter())
                    .any(|(d, m)| d.failed && m.failed);
                match (lost, flags.io_type) {
                    (true, _) => None,
                    (false, IoType::Read) => Some(DagCreateFn::Raid1Read),
                    (false, IoType::Write) => Some(DagCreateFn::Raid1Write),
                }
            },
            Layout::Raid4 | Layout::Raid5 => self.select_parity(flags, asm),
            Layout::ParityLogging if flags.parity_logging => {
                // Until the logs are folded into parity, the parity disk is
                // stale, so nothing can be reconstructed.
                if asm.num_data_failed > 0 {
                    None
                } else if flags.io_type == IoType::Read {
                    Some(DagCreateFn::NonredundantRead)
                } else if asm.num_parity_failed > 0 {
                    Some(DagCreateFn::NonredundantWrite)
                } else if self.prefer_large_write(asm) {
                    Some(DagCreateFn::ParityLogLargeWrite)
                } else {
                    Some(DagCreateFn::ParityLogSmallWrite)
                }
            },
            Layout::ParityLogging => self.select_parity(flags, asm),
        }
    }

    /// Selection for layouts with a single parity unit per stripe
    fn select_parity(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>
    {
        let stripe_failed = asm.num_failed_in_stripe();
        if flags.io_type == IoType::Read {
            return if asm.num_data_failed == 0 {
                Some(DagCreateFn::NonredundantRead)
            } else if asm.num_data_failed == 1 && stripe_failed == 1 {
                Some(DagCreateFn::DegradedRead)
            } else {
                None
            };
        }
        if asm.num_parity_failed > 0 {
            if asm.num_data_failed == 0 {
                Some(DagCreateFn::NonredundantWrite)
            } else {
                None
            }
        } else if asm.num_data_failed > 1 || stripe_failed > 1 {
            if asm.num_data_failed == 0 {
                // Unaccessed failures don't matter to a read-modify-write
                Some(DagCreateFn::SmallWrite)
            } else {
                None
            }
        } else if asm.num_data_failed == 1 {
            // A reconstruct-write can only recompute parity over the failed
            // unit's whole range if the failed unit is entirely overwritten
            // or is the only unit accessed.
            let failed = asm.phys_info.iter().find(|pda| pda.failed)?;
            if asm.num_stripe_units_accessed() == 1 ||
                failed.num_sector == self.sectors_per_su
            {
                Some(DagCreateFn::LargeWrite)
            } else {
                None
            }
        } else if stripe_failed == 0 && self.prefer_large_write(asm) {
            Some(DagCreateFn::LargeWrite)
        } else {
            Some(DagCreateFn::SmallWrite)
        }
    }

    fn prefer_large_write(&self, asm: &AccessStripeMap) -> bool {
        let ndata = self.num_data_cols();
        !(asm.num_stripe_units_accessed() <= ndata / 2 && ndata != 1)
    }
}

impl SelectDag for Geometry {
    fn select_stripe_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>
    {
        self.select(flags, asm)
    }

    fn select_unit_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>
    {
        self.select(flags, asm)
    }

    fn select_block_fn(&self, flags: AccessFlags, asm: &AccessStripeMap)
        -> Option<DagCreateFn>
    {
        self.select(flags, asm)
    }

    fn stripe_is_unrecoverable(&self, asm: &AccessStripeMap) -> bool {
        match self.layout {
            // Nothing else can serve a failed unit's data
            Layout::Raid0 => asm.num_data_failed > 0,
            // Both halves of a mirror pair are gone.  Every subdivision of the
            // access would map to the same dead pair.
            Layout::Raid1 => {
                let stripe = asm.stripe_id;
                let d = self.data_col(stripe, 0);
                asm.failed_cols.contains(d) && asm.failed_cols.contains(d + 1)
            },
            _ => false
        }
    }
}

// LCOV_EXCL_STOP
