// vim: tw=80
//! Array-wide configuration, fixed when the RAID set is created

use std::{fs, mem, path::Path};

use serde_derive::{Deserialize, Serialize};

use crate::{
    layout::Layout,
    types::*,
};

fn default_bytes_per_sector() -> usize {
    512
}

fn default_queue_depth() -> usize {
    8
}

/// Parity logging parameters.  Only meaningful for
/// [`Layout::ParityLogging`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ParityLogConfig {
    /// Number of regions the parity space is divided into.
    pub num_regions: usize,
    /// Capacity of one in-core log buffer, in sectors
    pub num_sectors_per_log: usize,
    /// Size of each region's on-disk log, in sectors.  Must be a multiple of
    /// `num_sectors_per_log`.
    pub region_log_capacity: u64,
    /// How many log buffers are shared among all regions.
    pub num_pool_logs: usize,
}

/// Configuration of one RAID set
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RaidConfig {
    pub layout: Layout,
    /// Number of member disks, not counting spares
    pub num_cols: usize,
    pub sectors_per_su: u64,
    #[serde(default = "default_bytes_per_sector")]
    pub bytes_per_sector: usize,
    /// Total number of stripes in the array
    pub stripes: u64,
    /// Maximum number of outstanding operations per disk
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Reconstruction unit size, in sectors.  Defaults to one stripe unit.
    #[serde(default)]
    pub sectors_per_ru: Option<u64>,
    #[serde(default)]
    pub parity_log: Option<ParityLogConfig>,
}

impl RaidConfig {
    /// Parse a YAML configuration
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: RaidConfig = serde_yaml_ng::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_yaml(&s)
    }

    pub fn sectors_per_ru(&self) -> u64 {
        self.sectors_per_ru.unwrap_or(self.sectors_per_su)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let word = mem::size_of::<usize>();
        if self.num_cols < self.layout.min_cols() ||
            (self.layout == Layout::Raid1 && self.num_cols % 2 != 0)
        {
            tracing::warn!(layout = ?self.layout, num_cols = self.num_cols,
                "Wrong number of columns for layout");
            return Err(Error::EINVAL);
        }
        if self.sectors_per_su == 0 || self.stripes == 0 ||
            self.queue_depth == 0
        {
            return Err(Error::EINVAL);
        }
        if self.bytes_per_sector == 0 || self.bytes_per_sector % word != 0 {
            return Err(Error::EINVAL);
        }
        let spru = self.sectors_per_ru();
        if spru == 0 || self.sectors_per_su % spru != 0 {
            return Err(Error::EINVAL);
        }
        match (self.layout, &self.parity_log) {
            (Layout::ParityLogging, Some(pl)) => {
                if pl.num_regions == 0 || pl.num_sectors_per_log == 0 ||
                    pl.num_pool_logs == 0 || pl.region_log_capacity == 0 ||
                    pl.region_log_capacity % pl.num_sectors_per_log as u64 != 0
                {
                    return Err(Error::EINVAL);
                }
                if pl.num_pool_logs <= pl.num_regions {
                    tracing::warn!("Too few parity logs for the region count");
                    return Err(Error::EINVAL);
                }
                let parity_sectors = self.stripes * self.sectors_per_su;
                if parity_sectors % pl.num_regions as u64 != 0 {
                    tracing::warn!("Parity space does not divide into regions");
                    return Err(Error::EINVAL);
                }
                Ok(())
            },
            (Layout::ParityLogging, None) => Err(Error::EINVAL),
            (_, Some(_)) => Err(Error::EINVAL),
            (_, None) => Ok(())
        }
    }
}

// LCOV_EXCL_STOP
