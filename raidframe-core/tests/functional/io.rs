// vim: tw=80
//! Reads and writes of a healthy array
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::*;

#[rstest]
#[case::raid0(RAID0)]
#[case::raid1(RAID1)]
#[case::raid4(RAID4)]
#[case::raid5(RAID5)]
#[case::plog(PLOG)]
fn whole_array(#[case] yaml: &str) {
    basic_runtime().block_on(async {
        let mut h = Harness::new(yaml, 0);
        let size = h.rs.size();
        let data = h.random(size);
        t!(h.write(0, &data).await);
        assert_eq!(t!(h.read(0, size).await), data);
        t!(h.rs.shutdown().await);
        h.check_parity();
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

/// Small and unaligned writes, each read back through the whole array
#[rstest]
#[case::raid0(RAID0)]
#[case::raid1(RAID1)]
#[case::raid4(RAID4)]
#[case::raid5(RAID5)]
#[case::plog(PLOG)]
fn partial_writes(#[case] yaml: &str) {
    basic_runtime().block_on(async {
        let mut h = Harness::new(yaml, 0);
        let bps = h.bps();
        let size = h.rs.size();
        let mut model = h.random(size);
        t!(h.write(0, &model).await);
        for (addr, n) in [(1, 1), (5, 3), (11, 6), (2, 13), (size - 2, 2)] {
            let data = h.random(n);
            t!(h.write(addr, &data).await);
            let s = addr as usize * bps;
            model[s..s + data.len()].copy_from_slice(&data);
            assert_eq!(t!(h.read(0, size).await), model);
        }
        t!(h.rs.shutdown().await);
        h.check_parity();
    });
}

/// Reads that span stripes land at the right offsets of the buffer
#[test]
fn read_spanning_stripes() {
    basic_runtime().block_on(async {
        let mut h = Harness::new(RAID5, 0);
        let data = h.random(h.rs.size());
        t!(h.write(0, &data).await);
        let bps = h.bps();
        let r = t!(h.read(10, 20).await);
        assert_eq!(&r[..], &data[10 * bps..30 * bps]);
    });
}

#[test]
fn misaligned_buffer() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 0);
        let dbs = DivBufShared::from(vec![0u8; 100]);
        let r = h.rs.read_at(dbs.try_mut().unwrap(), 0).await;
        assert_eq!(r, Err(Error::EINVAL));
    });
}

#[test]
fn past_end() {
    basic_runtime().block_on(async {
        let h = Harness::new(RAID5, 0);
        let size = h.rs.size();
        assert_eq!(h.read(size - 1, 2).await, Err(Error::EINVAL));
        assert_eq!(h.rs.live_allocations(), 0);
    });
}

#[test]
fn disks_too_small() {
    let config = t!(RaidConfig::from_yaml(RAID5));
    let queues = (0..4)
        .map(|_| Arc::new(MemDisk::new(8, 512)) as Arc<dyn DiskQueue>)
        .collect();
    assert_eq!(RaidSet::create(config, queues).err(), Some(Error::ENOSPC));
}

#[test]
fn too_few_disks() {
    let config = t!(RaidConfig::from_yaml(RAID5));
    let queues = (0..3)
        .map(|_| Arc::new(MemDisk::new(32, 512)) as Arc<dyn DiskQueue>)
        .collect();
    assert_eq!(RaidSet::create(config, queues).err(), Some(Error::EINVAL));
}
