//! Block-change invalidation: staged work dies, in-flight work finishes
//! without submitting, and the submitter suppresses stale shares when the
//! pool does not accept old ones.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stope_core::driver::{DriverBase, DriverKind, LegacyDriver};
use stope_core::error::Result as CoreResult;
use stope_core::queue::Pop;
use stope_core::submit::{submitter_loop, SubmitItem};
use stope_core::{Core, DeviceSpec, Options, PoolConfig, ThreadCtx, Work};

struct InertDriver;

impl DriverBase for InertDriver {
    fn name(&self) -> &'static str {
        "inert"
    }
}

impl LegacyDriver for InertDriver {
    fn scanhash(&self, _thr: &ThreadCtx, _work: &mut Work, max_nonce: u32) -> CoreResult<u64> {
        Ok(max_nonce as u64)
    }
}

fn test_core() -> (tokio::runtime::Runtime, Arc<Core>) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let core = Core::new(Options::default(), rt.handle().clone());
    (rt, core)
}

#[test]
fn new_block_invalidates_staged_and_inflight_work() {
    let (_rt, core) = test_core();
    let pool = core.add_pool(PoolConfig {
        url: "stratum+tcp://pool.example:3333".into(),
        user: "u".into(),
        pass: "x".into(),
        prio: 0,
        quota: 1,
    });
    pool.block_id.store(0xaabbccdd, Ordering::Relaxed);
    let device = core.add_device(DeviceSpec::default(), DriverKind::Legacy(Arc::new(InertDriver)));

    // Ten staged works built on block X.
    for _ in 0..10 {
        let mut w = Work::new(pool.id);
        w.block_id = 0xaabbccdd;
        w.restart_id = pool.work_restart_id.load(Ordering::Relaxed);
        assert!(core.staging.push(w));
    }
    // One in flight on the device.
    let mut inflight = Work::new(pool.id);
    inflight.block_id = 0xaabbccdd;
    let inflight_mid = inflight.midstate;
    device.add_queued(inflight.clone());

    // Block Y arrives.
    pool.block_id.store(0x11223344, Ordering::Relaxed);
    core.note_new_block(&pool, 0x11223344);
    core.invalidate_pool_work(&pool);

    // Every staged work is now flagged stale.
    let mut stale = 0;
    while let Pop::Item(w) = core.staging.pop(Some(Duration::from_millis(10))) {
        assert!(w.stale);
        stale += 1;
    }
    assert_eq!(stale, 10);

    // The in-flight work stays queued (the driver finishes it) but is
    // flagged, so its eventual share is suppressed.
    assert_eq!(device.queued_count(), 1);
    let mut tail = [0u8; 12];
    tail.copy_from_slice(&inflight.data[64..76]);
    let flagged = device
        .find_queued_work_bymidstate(&inflight_mid, &tail)
        .unwrap();
    assert!(flagged.stale);

    // Submitter refuses the stale share outright; no pool round trip.
    let submitter = {
        let core = Arc::clone(&core);
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || submitter_loop(core, pool))
    };
    assert!(pool.submit_q.push(SubmitItem {
        work: flagged,
        nonce: 42,
        attempts: 0,
        created: Instant::now(),
    }));
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stale_shares.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "stale share never accounted");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.accepted.load(Ordering::Relaxed), 0);
    assert_eq!(pool.rejected.load(Ordering::Relaxed), 0);

    core.kill_work();
    submitter.join().unwrap();
}

#[test]
fn submit_old_lets_block_stale_shares_through_validation() {
    use stope_core::work::{stale_work, StaleCtx};

    let mut work = Work::new(stope_core::PoolId(0));
    work.tv_staged = Some(Instant::now());
    work.block_id = 1;
    let ctx = StaleCtx {
        scantime: Duration::from_secs(60),
        expiry: Duration::from_secs(120),
        block_id: 2,
        restart_id: 0,
        submit_old: true,
    };
    assert!(!stale_work(&work, true, &ctx), "submit_old keeps shares alive");
    assert!(stale_work(&work, false, &ctx), "but not unstarted work");
}
