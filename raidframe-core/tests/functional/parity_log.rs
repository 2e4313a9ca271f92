// vim: tw=80
//! Parity logging through a whole RAID set
use pretty_assertions::assert_eq;
use rand::Rng;

use super::*;

/// A small write logs its parity update instead of writing parity in place
#[test_log::test]
fn small_write_is_logged() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let data = h.random(1);
        t!(h.write(0, &data).await);
        assert_eq!(h.mds[0].peek(0, 1), data);
        // Parity is stale until the log is folded
        assert!(h.mds[2].peek(0, 1).iter().all(|b| *b == 0));
        let plog = h.rs.parity_log().unwrap();
        assert_eq!(plog.core_records(0), 1);

        t!(h.rs.shutdown().await);
        assert_eq!(h.mds[2].peek(0, 1), data);
        h.check_parity();
        assert!(!h.rs.parity_log().unwrap().logging_enabled());
    });
}

/// Enough small writes to one region fill its log and force reintegration
#[test]
fn many_small_writes() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let bps = h.bps();
        let size = h.rs.size();
        let mut model = vec![0u8; size as usize * bps];
        // Stripes 0 through 3 have their parity in region 0
        for _ in 0..40 {
            let addr = h.rng.gen_range(0..32);
            let data = h.random(1);
            t!(h.write(addr, &data).await);
            let s = addr as usize * bps;
            model[s..s + bps].copy_from_slice(&data);
        }
        assert_eq!(t!(h.read(0, size).await), model);
        let plog = h.rs.parity_log().unwrap();
        assert!(!plog.region_failed(0));
        assert!(plog.disk_count(0) <= 8);

        t!(h.rs.shutdown().await);
        h.check_parity();
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

/// Concurrent writes to both regions, more than the log pool can hold at
/// once
#[test]
fn concurrent_writes() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let bps = h.bps();
        let size = h.rs.size();
        let writes = (0..size).step_by(3)
            .map(|addr| (addr, h.random(1)))
            .collect::<Vec<_>>();
        let mut model = vec![0u8; size as usize * bps];
        for (addr, data) in writes.iter() {
            let s = *addr as usize * bps;
            model[s..s + bps].copy_from_slice(data);
        }
        let futs = writes.iter().map(|(addr, data)| h.write(*addr, data));
        for r in futures::future::join_all(futs).await {
            t!(r);
        }
        assert_eq!(t!(h.read(0, size).await), model);
        t!(h.rs.shutdown().await);
        h.check_parity();
    });
}

/// After shutdown, parity is written in place
#[test]
fn write_after_shutdown() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        t!(h.rs.shutdown().await);
        let data = h.random(3);
        t!(h.write(5, &data).await);
        h.check_parity();
        assert_eq!(t!(h.read(5, 3).await), data);
    });
}

/// Failing a disk folds every log, so degraded reads see correct parity
#[test]
fn fail_disk_folds() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let data = h.random(1);
        t!(h.write(0, &data).await);
        t!(h.rs.fail_disk(0).await);
        let plog = h.rs.parity_log().unwrap();
        assert!(!plog.logging_enabled());
        assert_eq!(plog.core_records(0), 0);
        assert_eq!(h.mds[2].peek(0, 1), data);
        assert_eq!(t!(h.read(0, 1).await), data);
    });
}

/// Losing the log disk disables logging.  Data is still intact.
#[test]
fn fail_log_disk() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let size = h.rs.size();
        let data = h.random(size);
        t!(h.write(0, &data).await);
        h.mds[3].set_failed(true);
        t!(h.rs.fail_disk(3).await);
        assert!(!h.rs.parity_log().unwrap().logging_enabled());
        let more = h.random(2);
        t!(h.write(1, &more).await);
        let mut model = data.clone();
        let bps = h.bps();
        model[bps..3 * bps].copy_from_slice(&more);
        assert_eq!(t!(h.read(0, size).await), model);
        h.check_parity();
    });
}

/// Writes whose logs were lost with the log disk still get correct parity,
/// so a later degraded read returns what was written.
#[test]
fn fail_log_disk_then_data_disk() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let bps = h.bps();
        // Five single sector writes, all logged in region 0
        let data = h.random(5);
        for addr in 0..5 {
            let s = addr as usize * bps;
            t!(h.write(addr, &data[s..s + bps]).await);
        }
        let plog = h.rs.parity_log().unwrap();
        assert_eq!(plog.disk_count(0), 4);

        h.mds[3].set_failed(true);
        t!(h.rs.fail_disk(3).await);
        assert!(!plog.logging_enabled());
        assert!(plog.failed_regions().is_empty());
        h.check_parity();

        t!(h.rs.fail_disk(0).await);
        assert_eq!(t!(h.read(0, 5).await), data);
    });
}

/// A region that fails while logging is still on stops logging, and the
/// write that found it failed is retried without the log.
#[test]
fn failed_region_retries_write() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(PLOG, 0);
        let bps = h.bps();
        let data = h.random(5);
        for addr in 0..5 {
            let s = addr as usize * bps;
            t!(h.write(addr, &data[s..s + bps]).await);
        }
        let more = h.random(1);
        let plog = h.rs.parity_log().unwrap();
        // The full log can't be written
        h.mds[3].set_failed(true);
        assert_eq!(plog.request_fold(false).await.unwrap(), Err(Error::EIO));
        assert!(plog.region_failed(0));
        assert!(plog.logging_enabled());
        assert_eq!(h.rs.disk_status(3), DiskStatus::Failed);

        t!(h.write(2, &more).await);
        assert!(!plog.logging_enabled());
        assert!(!plog.region_failed(0));
        h.check_parity();
        let mut model = data.clone();
        model[2 * bps..3 * bps].copy_from_slice(&more);
        assert_eq!(t!(h.read(0, 5).await), model);
    });
}
