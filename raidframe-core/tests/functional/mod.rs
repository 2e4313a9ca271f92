// vim: tw=80
use std::sync::Arc;

use divbuf::DivBufShared;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use raidframe_core::{
    config::RaidConfig,
    dag::xor::bxor,
    disk::{DiskQueue, DiskStatus},
    layout::Geometry,
    mem_disk::MemDisk,
    raid_set::RaidSet,
    types::*,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

const RAID0: &str = r#"
layout: Raid0
num_cols: 3
sectors_per_su: 4
stripes: 8
"#;

const RAID1: &str = r#"
layout: Raid1
num_cols: 4
sectors_per_su: 4
stripes: 8
"#;

const RAID4: &str = r#"
layout: Raid4
num_cols: 4
sectors_per_su: 4
stripes: 8
"#;

const RAID5: &str = r#"
layout: Raid5
num_cols: 4
sectors_per_su: 4
stripes: 8
"#;

const RAID5_3: &str = r#"
layout: Raid5
num_cols: 3
sectors_per_su: 4
stripes: 8
"#;

const PLOG: &str = r#"
layout: ParityLogging
num_cols: 4
sectors_per_su: 4
stripes: 8
parity_log:
  num_regions: 2
  num_sectors_per_log: 4
  region_log_capacity: 8
  num_pool_logs: 3
"#;

/// Helper to generate the runtime used by most tests
fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// A RAID set over in-memory disks
struct Harness {
    rs: RaidSet,
    mds: Vec<Arc<MemDisk>>,
    rng: XorShiftRng,
}

impl Harness {
    /// Create a RAID set with `nspares` spare disks.  Must be called within a
    /// Tokio runtime.
    fn new(yaml: &str, nspares: usize) -> Self {
        let config = t!(RaidConfig::from_yaml(yaml));
        let geom = Geometry::new(&config);
        let sectors = geom.disk_sectors(config.parity_log.as_ref());
        let mds = (0..config.num_cols + nspares)
            .map(|_| Arc::new(MemDisk::new(sectors, config.bytes_per_sector)))
            .collect::<Vec<_>>();
        let queues = mds.iter()
            .map(|md| md.clone() as Arc<dyn DiskQueue>)
            .collect();
        let rs = t!(RaidSet::create(config, queues));
        Harness { rs, mds, rng: XorShiftRng::seed_from_u64(0xbfff) }
    }

    fn bps(&self) -> usize {
        self.rs.geometry().bytes_per_sector
    }

    fn random(&mut self, nsectors: u64) -> Vec<u8> {
        let mut v = vec![0u8; nsectors as usize * self.bps()];
        self.rng.fill(&mut v[..]);
        v
    }

    async fn write(&self, addr: RaidAddrT, data: &[u8]) -> Result<()> {
        let dbs = DivBufShared::from(data.to_vec());
        self.rs.write_at(dbs.try_const().unwrap(), addr).await
    }

    async fn read(&self, addr: RaidAddrT, nsectors: u64) -> Result<Vec<u8>> {
        let dbs = DivBufShared::from(vec![0u8; nsectors as usize * self.bps()]);
        self.rs.read_at(dbs.try_mut().unwrap(), addr).await?;
        Ok(dbs.try_const().unwrap()[..].to_vec())
    }

    /// The disk currently holding column `col`
    fn disk(&self, col: ColT) -> &MemDisk {
        match self.rs.disk_status(col) {
            DiskStatus::Spared{spare} => &self.mds[spare],
            _ => &self.mds[col]
        }
    }

    /// Assert that every stripe's parity (or mirror copy) matches its data
    fn check_parity(&self) {
        let geom = self.rs.geometry();
        let n = geom.sectors_per_su;
        for stripe in 0..geom.stripes {
            let Some(pcol) = geom.parity_col(stripe) else { return };
            let start = geom.stripe_row(stripe) * n;
            let mut expected = vec![0u8; n as usize * geom.bytes_per_sector];
            for col in geom.data_cols(stripe) {
                t!(bxor(&self.disk(col).peek(start, n), &mut expected));
            }
            assert!(self.disk(pcol).peek(start, n) == expected,
                "Parity mismatch in stripe {stripe}");
        }
    }
}

mod degraded;
mod io;
mod parity_log;
mod recon;
