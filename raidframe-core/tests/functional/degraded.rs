// vim: tw=80
//! Accesses to arrays with failed disks
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::*;

#[rstest]
#[case::raid1(RAID1)]
#[case::raid4(RAID4)]
#[case::raid5(RAID5)]
#[case::plog(PLOG)]
fn read_and_write(#[case] yaml: &str) {
    basic_runtime().block_on(async {
        let mut h = Harness::new(yaml, 0);
        let bps = h.bps();
        let size = h.rs.size();
        let mut model = h.random(size);
        t!(h.write(0, &model).await);
        t!(h.rs.fail_disk(1).await);
        assert_eq!(h.rs.disk_status(1), DiskStatus::Failed);
        assert_eq!(t!(h.read(0, size).await), model);

        for (addr, n) in [(3, 6), (0, 1), (9, 2)] {
            let data = h.random(n);
            t!(h.write(addr, &data).await);
            let s = addr as usize * bps;
            model[s..s + data.len()].copy_from_slice(&data);
        }
        assert_eq!(t!(h.read(0, size).await), model);
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

/// A disk that starts returning errors is marked failed and the access is
/// retried in degraded mode.
#[test_log::test]
fn detect_failure() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(RAID5, 0);
        let size = h.rs.size();
        let data = h.random(size);
        t!(h.write(0, &data).await);
        h.mds[2].set_failed(true);
        assert_eq!(t!(h.read(0, size).await), data);
        assert_eq!(h.rs.disk_status(2), DiskStatus::Failed);
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

/// Like detect_failure, but for writes
#[test]
fn detect_failure_on_write() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(RAID5, 0);
        let size = h.rs.size();
        let mut model = h.random(size);
        t!(h.write(0, &model).await);
        h.mds[0].set_failed(true);
        let data = h.random(4);
        t!(h.write(0, &data).await);
        model[..data.len()].copy_from_slice(&data);
        assert_eq!(h.rs.disk_status(0), DiskStatus::Failed);
        assert_eq!(t!(h.read(0, size).await), model);
    });
}

/// With more failures than the layout tolerates, no DAG can be selected.
#[test]
fn double_failure() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(RAID5_3, 0);
        let data = h.random(8);
        t!(h.write(0, &data).await);
        t!(h.rs.fail_disk(1).await);
        t!(h.rs.fail_disk(2).await);
        assert_eq!(h.read(0, 8).await, Err(Error::ENODEV));
        assert_eq!(h.write(0, &data).await, Err(Error::ENODEV));
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

#[test]
fn raid0() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(RAID0, 0);
        let data = h.random(12);
        t!(h.write(0, &data).await);
        t!(h.rs.fail_disk(1).await);
        let bps = h.bps();
        // Only column 0 is touched
        assert_eq!(t!(h.read(0, 4).await), &data[..4 * bps]);
        assert_eq!(h.read(0, 12).await, Err(Error::ENODEV));
    });
}

#[test]
fn fail_nonexistent_disk() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 0);
        assert_eq!(h.rs.fail_disk(4).await, Err(Error::EINVAL));
    });
}
