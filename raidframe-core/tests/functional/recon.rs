// vim: tw=80
//! Reconstruction and parity rewrite
use pretty_assertions::assert_eq;
use rstest::rstest;

use raidframe_core::recon::ProgressInfo;

use super::*;

#[rstest]
#[case::raid1(RAID1)]
#[case::raid4(RAID4)]
#[case::raid5(RAID5)]
#[case::plog(PLOG)]
fn reconstruct(#[case] yaml: &str) {
    basic_runtime().block_on(async {
        let mut h = Harness::new(yaml, 1);
        let size = h.rs.size();
        let data = h.random(size);
        t!(h.write(0, &data).await);
        let geom = h.rs.geometry().clone();
        let data_sectors = geom.rows() * geom.sectors_per_su;
        let spare = h.mds.len() - 1;
        t!(h.rs.fail_disk(1).await);
        let lost = h.mds[1].peek(0, data_sectors);
        h.mds[1].poke(0, &vec![0u8; lost.len()]);

        t!(h.rs.reconstruct(1, spare).await);
        assert_eq!(h.rs.disk_status(1), DiskStatus::Spared{spare});
        assert_eq!(h.rs.recon_progress(), 100);
        let nrus = geom.num_rus() as u64;
        assert_eq!(h.rs.recon_progress_ext(),
                   ProgressInfo{total: nrus, completed: nrus, remaining: 0});
        assert!(h.mds[spare].peek(0, data_sectors) == lost);
        assert_eq!(t!(h.read(0, size).await), data);

        // The spare now takes writes
        let new = h.random(size);
        t!(h.write(0, &new).await);
        assert_eq!(t!(h.read(0, size).await), new);
        t!(h.rs.shutdown().await);
        h.check_parity();
    });
}

#[test]
fn reconstruct_healthy_column() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 1);
        assert_eq!(h.rs.reconstruct(1, 4).await, Err(Error::EINVAL));
        assert_eq!(h.rs.disk_status(1), DiskStatus::Optimal);
    });
}

#[test]
fn reconstruct_onto_member() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 1);
        t!(h.rs.fail_disk(1).await);
        assert_eq!(h.rs.reconstruct(1, 2).await, Err(Error::EINVAL));
        assert_eq!(h.rs.reconstruct(1, 5).await, Err(Error::EINVAL));
    });
}

/// With two failed columns there is nothing to rebuild from
#[test]
fn reconstruct_without_redundancy() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 1);
        t!(h.rs.fail_disk(1).await);
        t!(h.rs.fail_disk(2).await);
        assert_eq!(h.rs.reconstruct(1, 4).await, Err(Error::EIO));
        assert_eq!(h.rs.disk_status(1), DiskStatus::Failed);
        assert_eq!(h.rs.recon_progress(), 100);
    });
}

#[test]
fn raid0_unsupported() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID0, 1);
        t!(h.rs.fail_disk(1).await);
        assert_eq!(h.rs.reconstruct(1, 3).await, Err(Error::EOPNOTSUPP));
        assert_eq!(h.rs.rewrite_parity().await, Err(Error::EOPNOTSUPP));
        assert_eq!(h.rs.recon_progress(), 100);
    });
}

#[rstest]
#[case::raid1(RAID1)]
#[case::raid4(RAID4)]
#[case::raid5(RAID5)]
#[case::plog(PLOG)]
fn rewrite_parity(#[case] yaml: &str) {
    basic_runtime().block_on(async {
        let mut h = Harness::new(yaml, 0);
        let size = h.rs.size();
        let data = h.random(size);
        t!(h.write(0, &data).await);
        let geom = h.rs.geometry().clone();
        // Scribble over the parity of stripe 0
        let pcol = geom.parity_col(0).unwrap();
        let junk = h.random(geom.sectors_per_su);
        h.mds[pcol].poke(0, &junk);

        t!(h.rs.rewrite_parity().await);
        assert_eq!(h.rs.parity_rewrite_progress(), 100);
        let stripes = geom.stripes;
        assert_eq!(h.rs.parity_rewrite_progress_ext(),
            ProgressInfo{total: stripes, completed: stripes, remaining: 0});
        h.check_parity();
        if let Some(plog) = h.rs.parity_log() {
            assert!(plog.logging_enabled());
        }
        assert_eq!(t!(h.read(0, size).await), data);
    });
}

#[test]
fn rewrite_parity_degraded() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 0);
        t!(h.rs.fail_disk(0).await);
        assert_eq!(h.rs.rewrite_parity().await, Err(Error::EIO));
        assert_eq!(h.rs.parity_rewrite_progress(), 100);
    });
}
