// vim: tw=80
// LCOV_EXCL_START
use std::sync::RwLock;

use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest::{fixture, rstest};

use super::{*, disk_mgr::DiskManager};
use crate::{
    dag::xor::bxor,
    disk::{ArrayStatus, DiskQueue, DiskSet, DiskStatus},
    mem_disk::MemDisk,
    stripe_map::AddrType,
    util::AllocTracker,
};

const BPS: usize = 512;
const PARITY_COL: ColT = 2;

/// Two data columns, then parity, then the log.  16 parity sectors in two
/// regions.
fn geom() -> Geometry {
    Geometry {
        layout: Layout::ParityLogging,
        num_cols: 4,
        sectors_per_su: 4,
        sectors_per_ru: 4,
        bytes_per_sector: BPS,
        stripes: 4
    }
}

fn config(nspl: usize, capacity: u64, pool: usize) -> ParityLogConfig {
    ParityLogConfig {
        num_regions: 2,
        num_sectors_per_log: nspl,
        region_log_capacity: capacity,
        num_pool_logs: pool
    }
}

fn pda(start: SectorT, n: u64) -> PhysDiskAddr {
    PhysDiskAddr::new(PARITY_COL, start, n, AddrType::Parity)
}

fn random(rng: &mut XorShiftRng, nsectors: u64) -> Vec<u8> {
    let mut v = vec![0u8; nsectors as usize * BPS];
    rng.fill(&mut v[..]);
    v
}

/// Log `data` at parity sector `start`
fn append(ctx: &ParityLogContext, op: LogOp, start: SectorT, data: &[u8])
    -> oneshot::Receiver<Result<()>>
{
    let dbs = DivBufShared::from(data.to_vec());
    let n = (data.len() / BPS) as u64;
    ctx.append_parity(op, &pda(start, n), dbs.try_const().unwrap()).unwrap()
}

fn pending(rx: &mut oneshot::Receiver<Result<()>>) -> bool {
    rx.try_recv().unwrap().is_none()
}

fn done(rx: &mut oneshot::Receiver<Result<()>>) -> Option<Result<()>> {
    rx.try_recv().unwrap()
}

mod append {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Five sectors with four-sector logs: one full log goes to disk and one
    /// sector stays in core.
    #[test]
    fn one_dump() {
        let ctx = ParityLogContext::new(&geom(), &config(4, 8, 3)).unwrap();
        let mut rx = append(&ctx, LogOp::Update, 0, &vec![1u8; 5 * BPS]);
        assert_eq!(done(&mut rx), Some(Ok(())));
        assert_eq!(ctx.pending_flushes(), 1);
        assert_eq!(ctx.disk_count(0), 4);
        assert_eq!(ctx.core_records(0), 1);
        assert_eq!(ctx.free_logs(), 1);
    }

    /// The third dump of a region whose disk log holds two logs must
    /// reintegrate it, and the remaining work waits.
    #[test]
    fn full_region_reintegrates() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let mut rx = append(&ctx, LogOp::Update, 0, &vec![1u8; 7 * BPS]);
        assert!(pending(&mut rx));
        assert_eq!(ctx.pending_flushes(), 2);
        assert_eq!(ctx.disk_count(0), 4);
        assert!(ctx.reint_in_progress(0));
        assert_eq!(ctx.blocked_on_reint(0), 1);
        assert_eq!(ctx.queues.lock().unwrap().reint.len(), 1);

        // Later work for that region waits too
        let mut rx2 = append(&ctx, LogOp::Overwrite, 7, &vec![2u8; BPS]);
        assert!(pending(&mut rx2));
        assert_eq!(ctx.blocked_on_reint(0), 2);

        // Other regions only wait for a free log
        let mut rx3 = append(&ctx, LogOp::Update, 8, &vec![3u8; BPS]);
        assert!(pending(&mut rx3));
        assert_eq!(ctx.blocked_on_log(), 1);
        assert_eq!(ctx.blocked_on_reint(1), 0);
    }

    #[test]
    fn split_at_region_boundary() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let dbs = DivBufShared::from(vec![0u8; 4 * BPS]);
        let (items, _rx) = ctx.create_parity_log_data(LogOp::Update,
            &pda(6, 4), dbs.try_const().unwrap()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].region(), 0);
        assert_eq!(items[0].num_sector(), 2);
        assert_eq!(items[1].region(), 1);
        assert_eq!(items[1].num_sector(), 2);
        assert_eq!(items[0].common.cnt.load(Ordering::Relaxed), 2);
        assert!(Arc::ptr_eq(&items[0].common, &items[1].common));
    }

    #[test]
    fn bad_length() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let dbs = DivBufShared::from(vec![0u8; 3 * BPS]);
        let r = ctx.append_parity(LogOp::Update, &pda(0, 4),
                                  dbs.try_const().unwrap());
        assert_eq!(r.unwrap_err(), Error::EINVAL);
    }

    #[test]
    fn past_end() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let dbs = DivBufShared::from(vec![0u8; 2 * BPS]);
        let r = ctx.append_parity(LogOp::Update, &pda(15, 2),
                                  dbs.try_const().unwrap());
        assert_eq!(r.unwrap_err(), Error::EINVAL);
    }

    /// The completion fires once, after the last region's item is logged
    #[test]
    fn completion_waits_for_every_item() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 1)).unwrap();
        let mut rx = append(&ctx, LogOp::Update, 6, &vec![1u8; 4 * BPS]);
        // Region 0 took the only log
        assert!(pending(&mut rx));
        assert_eq!(ctx.core_records(0), 2);
        assert_eq!(ctx.blocked_on_log(), 1);

        ctx.release_parity_logs(std::iter::once(ParityLog::new(2, BPS)));
        assert_eq!(done(&mut rx), Some(Ok(())));
        assert_eq!(ctx.core_records(1), 2);
        assert_eq!(ctx.blocked_on_log(), 0);
    }

    /// Work waiting for a log gets one in arrival order
    #[test]
    fn fifo() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 2)).unwrap();
        let mut rx0 = append(&ctx, LogOp::Update, 0, &vec![1u8; 2 * BPS]);
        let mut rx1 = append(&ctx, LogOp::Update, 8, &vec![1u8; 2 * BPS]);
        assert_eq!(done(&mut rx0), Some(Ok(())));
        assert_eq!(done(&mut rx1), Some(Ok(())));
        assert_eq!(ctx.free_logs(), 0);

        // Both core logs are full.  Each append dumps one, then waits.
        let mut rxa = append(&ctx, LogOp::Update, 10, &vec![2u8; BPS]);
        let mut rxb = append(&ctx, LogOp::Update, 2, &vec![3u8; BPS]);
        assert!(pending(&mut rxa));
        assert!(pending(&mut rxb));
        assert_eq!(ctx.pending_flushes(), 2);
        assert_eq!(ctx.blocked_on_log(), 2);

        let flushed = mem::take(&mut ctx.queues.lock().unwrap().flush);
        let mut flushed = flushed.into_iter();
        ctx.release_parity_logs(flushed.next());
        assert_eq!(done(&mut rxa), Some(Ok(())));
        assert!(pending(&mut rxb));
        ctx.release_parity_logs(flushed);
        assert_eq!(done(&mut rxb), Some(Ok(())));
        assert_eq!(ctx.free_logs(), 0);
    }

    /// A newcomer can't take a free log while others are waiting for one
    #[test]
    fn no_queue_jumping() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 1)).unwrap();
        let _rx0 = append(&ctx, LogOp::Update, 0, &vec![1u8; 2 * BPS]);
        let mut rx1 = append(&ctx, LogOp::Update, 8, &vec![1u8; BPS]);
        assert_eq!(ctx.blocked_on_log(), 1);
        ctx.pool.lock().unwrap().free.push(ParityLog::new(2, BPS));
        let mut rx2 = append(&ctx, LogOp::Update, 12, &vec![1u8; BPS]);
        assert!(pending(&mut rx1));
        assert!(pending(&mut rx2));
        assert_eq!(ctx.blocked_on_log(), 2);
    }

    #[test]
    fn failed_region() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        ctx.fail_region(1);
        let mut rx = append(&ctx, LogOp::Update, 8, &vec![1u8; BPS]);
        assert_eq!(done(&mut rx), Some(Err(Error::EIO)));
        let mut rx = append(&ctx, LogOp::Update, 0, &vec![1u8; BPS]);
        assert_eq!(done(&mut rx), Some(Ok(())));
    }

    /// Once reintegration finishes, the work that waited on it is logged
    /// before anything that arrived with the reopening.
    #[test]
    fn reint_waiters_go_first() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let mut rx0 = append(&ctx, LogOp::Update, 0, &vec![1u8; 7 * BPS]);
        let mut rx1 = append(&ctx, LogOp::Overwrite, 7, &vec![2u8; BPS]);
        assert_eq!(ctx.blocked_on_reint(0), 2);

        // Pretend the disk manager wrote and reintegrated everything
        let work = ctx.take_work();
        ctx.release_parity_logs(work.flush);
        ctx.release_parity_logs(work.reint.into_iter()
            .filter_map(|(_, log)| log));
        assert_eq!(ctx.free_logs(), 3);

        let dbs = DivBufShared::from(vec![3u8; BPS]);
        let (items, mut rx2) = ctx.create_parity_log_data(LogOp::Update,
            &pda(5, 1), dbs.try_const().unwrap()).unwrap();
        ctx.parity_log_append(items, &mut None, Some(0), false);

        assert_eq!(done(&mut rx0), Some(Ok(())));
        assert_eq!(done(&mut rx1), Some(Ok(())));
        assert_eq!(done(&mut rx2), Some(Ok(())));
        assert!(!ctx.reint_in_progress(0));
        assert_eq!(ctx.blocked_on_reint(0), 0);
        let state = ctx.regions[0].state.lock().unwrap();
        let logged = state.disk_map.iter()
            .map(|(_, rec)| *rec)
            .chain(state.core_log.as_ref().unwrap().records().iter().copied())
            .map(|rec| (rec.parity_sector, rec.op))
            .collect::<Vec<_>>();
        assert_eq!(logged, vec![
            (6, LogOp::Update),
            (7, LogOp::Overwrite),
            (5, LogOp::Update),
        ]);
    }

    /// A failed region whose parity was recomputed is usable again, but
    /// doesn't log.
    #[test]
    fn clear_region_failure() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        assert!(ctx.failed_regions().is_empty());
        ctx.fail_region(1);
        assert_eq!(ctx.failed_regions(), vec![1]);
        assert_eq!(ctx.parity_range(1), 8..16);

        ctx.clear_region_failure(1);
        assert!(ctx.failed_regions().is_empty());
        assert_eq!(ctx.disk_count(1), 0);
        let mut rx = append(&ctx, LogOp::Update, 8, &vec![1u8; BPS]);
        assert_eq!(done(&mut rx), Some(Err(Error::ESHUTDOWN)));
    }

    #[test]
    fn disabled() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        let mut rx = append(&ctx, LogOp::Update, 0, &vec![1u8; BPS]);
        assert_eq!(done(&mut rx), Some(Ok(())));
        assert!(ctx.start_reintegration(0, true).0);
        ctx.parity_log_append(std::iter::empty(), &mut None, Some(0), false);
        let mut rx = append(&ctx, LogOp::Update, 0, &vec![1u8; BPS]);
        assert_eq!(done(&mut rx), Some(Err(Error::ESHUTDOWN)));
    }

    #[test]
    fn fold_after_shutdown() {
        let ctx = ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap();
        ctx.request_shutdown();
        assert!(!ctx.logging_enabled());
        let mut rx = ctx.request_fold(false);
        assert_eq!(done(&mut rx), Some(Err(Error::ESHUTDOWN)));
    }

    #[test]
    fn wrong_layout() {
        let mut g = geom();
        g.layout = Layout::Raid5;
        let r = ParityLogContext::new(&g, &config(2, 4, 3));
        assert_eq!(r.unwrap_err(), Error::EINVAL);
    }
}

mod disk_mgr {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Harness {
        ctx: Arc<ParityLogContext>,
        mds: Vec<Arc<MemDisk>>,
        status: Arc<RwLock<ArrayStatus>>,
        /// Original parity contents
        parity: Vec<u8>,
        rng: XorShiftRng,
    }

    impl Harness {
        fn new(config: ParityLogConfig) -> Self {
            let geom = geom();
            let mut rng = XorShiftRng::seed_from_u64(0x1234);
            let sectors = geom.disk_sectors(Some(&config));
            let mds = (0..4)
                .map(|_| Arc::new(MemDisk::new(sectors, BPS)))
                .collect::<Vec<_>>();
            let parity = random(&mut rng, 16);
            mds[PARITY_COL].poke(0, &parity);
            let status = Arc::new(RwLock::new(ArrayStatus::new(4, 4)));
            let ctx = Arc::new(ParityLogContext::new(&geom, &config).unwrap());
            Harness { ctx, mds, status, parity, rng }
        }

        fn spawn(&self) -> tokio::task::JoinHandle<()> {
            let disks = Arc::new(DiskSet::new(self.mds.iter()
                .map(|md| md.clone() as Arc<dyn DiskQueue>)
                .collect(), 4));
            DiskManager::new(self.ctx.clone(), disks, self.status.clone(),
                             geom(), AllocTracker::new()).spawn()
        }

        fn parity(&self, start: SectorT, n: u64) -> Vec<u8> {
            self.mds[PARITY_COL].peek(start, n)
        }

        fn orig_parity(&self, start: SectorT, n: u64) -> Vec<u8> {
            let s = start as usize * BPS;
            self.parity[s..s + n as usize * BPS].to_vec()
        }
    }

    #[fixture]
    fn harness() -> Harness {
        Harness::new(config(2, 4, 3))
    }

    #[rstest]
    #[tokio::test]
    async fn fold(harness: Harness) {
        let mut h = harness;
        let _jh = h.spawn();
        let update = random(&mut h.rng, 2);
        let overwrite = random(&mut h.rng, 1);
        append(&h.ctx, LogOp::Update, 0, &update).await.unwrap().unwrap();
        // Fills the core log, so the update goes to the disk log
        append(&h.ctx, LogOp::Overwrite, 3, &overwrite).await.unwrap()
            .unwrap();
        assert_eq!(h.ctx.disk_count(0), 2);
        assert_eq!(h.ctx.core_records(0), 1);

        h.ctx.request_fold(false).await.unwrap().unwrap();

        let mut expected = h.orig_parity(0, 8);
        bxor(&update, &mut expected[..2 * BPS]).unwrap();
        expected[3 * BPS..4 * BPS].copy_from_slice(&overwrite);
        assert_eq!(h.parity(0, 8), expected);
        assert_eq!(h.parity(8, 8), h.orig_parity(8, 8));
        assert_eq!(h.ctx.disk_count(0), 0);
        assert_eq!(h.ctx.core_records(0), 0);
        assert!(!h.ctx.reint_in_progress(0));
        assert_eq!(h.ctx.free_logs(), 3);
        assert!(h.ctx.logging_enabled());
    }

    /// A run of updates that begins in the disk log and ends in the core log
    #[rstest]
    #[tokio::test]
    async fn fold_straddling_run(harness: Harness) {
        let mut h = harness;
        let _jh = h.spawn();
        let update = random(&mut h.rng, 3);
        append(&h.ctx, LogOp::Update, 4, &update).await.unwrap().unwrap();
        assert_eq!(h.ctx.disk_count(0), 2);
        assert_eq!(h.ctx.core_records(0), 1);

        h.ctx.request_fold(false).await.unwrap().unwrap();

        let mut expected = h.orig_parity(4, 3);
        bxor(&update, &mut expected).unwrap();
        assert_eq!(h.parity(4, 3), expected);
        assert_eq!(h.parity(0, 4), h.orig_parity(0, 4));
        assert_eq!(h.parity(7, 9), h.orig_parity(7, 9));
    }

    /// Filling a region's disk log triggers reintegration, after which the
    /// waiting work completes.
    #[rstest]
    #[tokio::test]
    async fn reintegrate(harness: Harness) {
        let mut h = harness;
        let _jh = h.spawn();
        let update = random(&mut h.rng, 7);
        let rx = append(&h.ctx, LogOp::Update, 0, &update);
        assert!(h.ctx.reint_in_progress(0));

        rx.await.unwrap().unwrap();
        assert!(!h.ctx.reint_in_progress(0));
        assert_eq!(h.ctx.disk_count(0), 0);
        assert_eq!(h.ctx.core_records(0), 1);
        let mut expected = h.orig_parity(0, 8);
        bxor(&update[..6 * BPS], &mut expected[..6 * BPS]).unwrap();
        assert_eq!(h.parity(0, 8), expected);

        h.ctx.request_fold(false).await.unwrap().unwrap();
        bxor(&update[6 * BPS..], &mut expected[6 * BPS..7 * BPS]).unwrap();
        assert_eq!(h.parity(0, 8), expected);
    }

    /// A region whose reintegration fails is unusable, but the manager
    /// keeps running.
    #[rstest]
    #[tokio::test]
    async fn reintegration_failure(harness: Harness) {
        let mut h = harness;
        let _jh = h.spawn();
        let update = random(&mut h.rng, 1);
        append(&h.ctx, LogOp::Update, 0, &update).await.unwrap().unwrap();
        h.mds[PARITY_COL].set_failed(true);

        let r = h.ctx.request_fold(false).await.unwrap();
        assert_eq!(r, Err(Error::EIO));
        assert!(h.ctx.region_failed(0));
        assert!(!h.ctx.region_failed(1));
        assert_eq!(h.status.read().unwrap().status(PARITY_COL),
                   DiskStatus::Failed);

        let r = append(&h.ctx, LogOp::Update, 0, &update).await.unwrap();
        assert_eq!(r, Err(Error::EIO));
        let r = h.ctx.request_fold(false).await.unwrap();
        assert_eq!(r, Err(Error::EIO));
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown(harness: Harness) {
        let mut h = harness;
        let jh = h.spawn();
        let update = random(&mut h.rng, 3);
        append(&h.ctx, LogOp::Update, 9, &update).await.unwrap().unwrap();

        h.ctx.request_shutdown();
        jh.await.unwrap();

        let mut expected = h.orig_parity(9, 3);
        bxor(&update, &mut expected).unwrap();
        assert_eq!(h.parity(9, 3), expected);
        assert!(!h.ctx.logging_enabled());
        let r = append(&h.ctx, LogOp::Update, 9, &update).await.unwrap();
        assert_eq!(r, Err(Error::ESHUTDOWN));
    }
}
mod apply {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::paritylog::disk_mgr::apply_log;

    fn rec(parity_sector: SectorT, op: LogOp) -> LogRecord {
        LogRecord { parity_sector, op }
    }

    fn ctx() -> ParityLogContext {
        ParityLogContext::new(&geom(), &config(2, 4, 3)).unwrap()
    }

    /// Consecutive updates are one run, even when their data is split
    /// between pages.
    #[test]
    fn run_across_pages() {
        let ctx = ctx();
        let mut rng = XorShiftRng::seed_from_u64(1);
        let data = random(&mut rng, 3);
        let orig = random(&mut rng, 8);
        let mut parity = orig.clone();
        let records = [9, 10, 11].map(|s| rec(s, LogOp::Update));
        let pages = [&data[..2 * BPS], &data[2 * BPS..]];
        apply_log(&ctx.regions[1], BPS, &mut parity, &records, &pages)
            .unwrap();

        let mut expected = orig;
        bxor(&data, &mut expected[BPS..4 * BPS]).unwrap();
        assert_eq!(parity, expected);
    }

    /// Records apply in log order
    #[test]
    fn overwrite_then_update() {
        let ctx = ctx();
        let mut rng = XorShiftRng::seed_from_u64(2);
        let data = random(&mut rng, 2);
        let mut parity = random(&mut rng, 8);
        let orig = parity.clone();
        let records = [rec(0, LogOp::Overwrite), rec(0, LogOp::Update)];
        let pages = [&data[..]];
        apply_log(&ctx.regions[0], BPS, &mut parity, &records, &pages)
            .unwrap();

        let mut expected = orig;
        expected[..BPS].copy_from_slice(&data[..BPS]);
        bxor(&data[BPS..], &mut expected[..BPS]).unwrap();
        assert_eq!(parity, expected);
    }

    #[test]
    fn short_pages() {
        let ctx = ctx();
        let data = vec![1u8; BPS];
        let mut parity = vec![0u8; 8 * BPS];
        for op in [LogOp::Update, LogOp::Overwrite] {
            let records = [rec(2, op), rec(3, op)];
            let r = apply_log(&ctx.regions[0], BPS, &mut parity, &records,
                              &[&data[..]]);
            assert_eq!(r, Err(Error::EFAULT));
        }
    }

    #[test]
    fn outside_region() {
        let ctx = ctx();
        let data = vec![1u8; BPS];
        let mut parity = vec![0u8; 8 * BPS];
        let r = apply_log(&ctx.regions[1], BPS, &mut parity,
                          &[rec(3, LogOp::Update)], &[&data[..]]);
        assert_eq!(r, Err(Error::EINVAL));
    }
}
// LCOV_EXCL_STOP
