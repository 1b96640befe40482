//! The three miner loop shapes and the staging hand-off.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::after;
use log::{debug, warn};

use crate::device::{DevLife, DevReason, Device, ThreadShared};
use crate::driver::{AsyncDriver, DriverKind, LegacyDriver, QueueDriver};
use crate::queue::Pop;
use crate::run::Core;
use crate::submit::stale_ctx;
use crate::watchdog::WATCHDOG_INTERVAL;
use crate::work::{stale_work, stale_work_future, Work};

/// Everything a driver callback gets to see about its thread.
pub struct ThreadCtx {
    pub core: Arc<Core>,
    pub device: Arc<Device>,
    pub shared: Arc<ThreadShared>,
    pub primary: bool,
}

impl ThreadCtx {
    /// Driver-facing solution path.
    pub fn submit_nonce(&self, work: &Work, nonce: u32) -> bool {
        crate::submit::submit_nonce(&self.core, Some(self), work, nonce)
    }

    pub fn count_hashes(&self, n: u64) {
        self.shared.hashes_done.fetch_add(n, Ordering::Relaxed);
        *self.shared.last_report.lock() = Instant::now();
    }

    pub fn restart_pending(&self) -> bool {
        self.shared.work_restart.load(Ordering::Acquire)
    }
}

/// Takes the next minable work off the staging queue, dropping anything
/// that went stale while staged, and binds it to this thread's device.
pub fn get_queue_work(thr: &ThreadCtx, timeout: Duration) -> Option<Work> {
    let deadline = Instant::now() + timeout;
    loop {
        if thr.core.is_shutdown() {
            return None;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match thr.core.staging.pop(Some(remaining)) {
            Pop::Timeout | Pop::Terminated => return None,
            Pop::Item(mut work) => {
                match thr.core.pools.get(work.pool) {
                    Some(pool) => {
                        let ctx = stale_ctx(&thr.core, &pool);
                        if work.stale || stale_work(&work, false, &ctx) {
                            pool.discarded_work.fetch_add(1, Ordering::Relaxed);
                            thr.core.stats.discarded.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                    // Benchmark work has no pool behind it.
                    None if work.mandatory => {}
                    None => continue,
                }
                work.drv_rolllimit = work.drv_rolllimit.min(thr.device.rolllimit);
                work.thr_id = Some(thr.shared.thr_id);
                work.device_id = Some(thr.device.id);
                work.tv_work_start = Some(Instant::now());
                thr.core.stats.local_work.fetch_add(1, Ordering::Relaxed);
                return Some(work);
            }
        }
    }
}

/// Thread entry: lifecycle bracket around the flavor-specific loop.
pub fn miner_thread(core: Arc<Core>, device: Arc<Device>, shared: Arc<ThreadShared>) {
    let thr = ThreadCtx {
        primary: shared.device_thread == 0,
        core,
        device: Arc::clone(&device),
        shared,
    };
    let driver = device.driver.clone();
    debug!(
        "thread {} on {} {} starting ({} loop)",
        thr.shared.thr_id,
        device.name,
        device.id,
        driver.flavor()
    );

    *device.status.lock() = DevLife::Init2;
    if let Err(e) = driver.base().thread_prepare(&thr) {
        warn!("{} {} failed to prepare: {}", device.name, device.id, e);
        *device.status.lock() = DevLife::NoStart;
        device.report_not_well(DevReason::NoStart);
        return;
    }
    if let Err(e) = driver.base().thread_init(&thr) {
        warn!("{} {} failed to init: {}", device.name, device.id, e);
        *device.status.lock() = DevLife::NoStart;
        device.report_not_well(DevReason::NoStart);
        driver.base().thread_shutdown(&thr);
        return;
    }
    *device.status.lock() = DevLife::Well;

    match &driver {
        DriverKind::Legacy(d) => minerloop_scanhash(&thr, d.as_ref()),
        DriverKind::Async(d) => minerloop_async(&thr, d.as_ref()),
        DriverKind::Queue(d) => minerloop_queue(&thr, d.as_ref()),
    }

    driver.base().thread_shutdown(&thr);
    debug!("thread {} exiting", thr.shared.thr_id);
}

/// Parks a disabled device's thread; returns false on shutdown.
fn pause_while_disabled(thr: &ThreadCtx) -> bool {
    thr.shared.paused.store(true, Ordering::Relaxed);
    thr.shared.notifier.wait(Duration::from_millis(500));
    thr.shared.paused.store(false, Ordering::Relaxed);
    !thr.core.is_shutdown()
}

/// Legacy shape: prepare, then scanhash until the work dies, rolling ntime
/// while the driver's limit allows.
fn minerloop_scanhash(thr: &ThreadCtx, drv: &dyn LegacyDriver) {
    let core = &thr.core;
    while !core.is_shutdown() {
        if !thr.device.is_enabled() {
            if !pause_while_disabled(thr) {
                break;
            }
            continue;
        }
        let Some(mut work) = get_queue_work(thr, Duration::from_millis(500)) else {
            continue;
        };
        if let Err(e) = drv.prepare_work(thr, &mut work) {
            warn!("{} {} prepare_work: {}", thr.device.name, thr.device.id, e);
            thr.device.report_comms_error();
            continue;
        }
        thr.shared.take_restart();

        loop {
            let max_nonce = drv.can_limit_work(thr);
            match drv.scanhash(thr, &mut work, max_nonce) {
                Ok(hashes) => {
                    thr.count_hashes(hashes);
                    thr.device.report_valid_work();
                }
                Err(e) => {
                    warn!("{} {} scanhash: {}", thr.device.name, thr.device.id, e);
                    thr.device.report_comms_error();
                    break;
                }
            }
            if core.is_shutdown() || thr.shared.take_restart() || !thr.device.is_enabled() {
                break;
            }
            let Some(pool) = core.pools.get(work.pool) else {
                break;
            };
            let ctx = stale_ctx(core, &pool);
            if work.stale || stale_work(&work, false, &ctx) {
                break;
            }
            if work.nonce == u32::MAX {
                // Nonce space exhausted: extend via ntime rolling while
                // the device still may, otherwise fetch fresh work.
                if work.can_roll() && !stale_work_future(&work, false, core.opts.scantime, &ctx) {
                    work = work.roll();
                    core.stats.local_work.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusyState {
    Idle,
    GettingResults,
    StartingJob,
}

/// Async shape: one job on silicon, the next one staged, a cooperative
/// event loop in between.
fn minerloop_async(thr: &ThreadCtx, drv: &dyn AsyncDriver) {
    let core = &thr.core;
    let mut busy = BusyState::Idle;
    let mut running: Option<Work> = None;
    let mut next_work: Option<Work> = None;
    let mut results_due: Option<Instant> = None;
    let mut job_transition = false;
    let poll_every = drv.poll_interval();
    let mut next_poll = poll_every.map(|d| Instant::now() + d);
    let mut next_watchdog = Instant::now() + WATCHDOG_INTERVAL;

    while !core.is_shutdown() {
        if !thr.device.is_enabled() {
            if !pause_while_disabled(thr) {
                break;
            }
            continue;
        }

        // Start a job when the silicon is empty.
        if running.is_none() {
            let candidate = next_work
                .take()
                .or_else(|| get_queue_work(thr, Duration::from_millis(250)));
            let Some(work) = candidate else { continue };

            // The state diagram is strict: a job start always begins and
            // ends at Idle.
            debug_assert_eq!(busy, BusyState::Idle);
            busy = BusyState::StartingJob;
            match drv.job_prepare(thr, &work, u32::MAX) {
                Ok(estimate) => {
                    if let Err(e) = drv.job_start(thr) {
                        warn!("{} {} job_start: {}", thr.device.name, thr.device.id, e);
                        thr.device.report_comms_error();
                        busy = BusyState::Idle;
                        continue;
                    }
                    results_due = Some(Instant::now() + estimate);
                    running = Some(work);
                    busy = BusyState::Idle;
                }
                Err(e) => {
                    warn!("{} {} job_prepare: {}", thr.device.name, thr.device.id, e);
                    thr.device.report_comms_error();
                    busy = BusyState::Idle;
                    continue;
                }
            }
        }

        // Keep one work staged ahead unless a restart is being absorbed.
        if next_work.is_none() && !job_transition {
            next_work = get_queue_work(thr, Duration::ZERO);
        }

        // Sleep until the earliest timer or an external wake.
        let now = Instant::now();
        let mut deadline = now + Duration::from_millis(250);
        for t in [results_due, next_poll, Some(next_watchdog)].into_iter().flatten() {
            if t < deadline {
                deadline = t;
            }
        }
        let wait = deadline.saturating_duration_since(now);
        crossbeam::select! {
            recv(thr.shared.notifier.receiver()) -> _ => {}
            recv(thr.shared.work_restart_notifier.receiver()) -> _ => {}
            recv(after(wait)) -> _ => {}
        }
        if core.is_shutdown() {
            break;
        }

        if thr.shared.take_restart() {
            // Finish collecting the running job, then discard the staged
            // one and pull fresh work.
            job_transition = true;
            next_work = None;
        }

        let now = Instant::now();
        if now >= next_watchdog {
            drv.watchdog(&thr.device, now);
            next_watchdog = now + WATCHDOG_INTERVAL;
        }
        if let (Some(every), Some(at)) = (poll_every, next_poll) {
            if now >= at {
                drv.poll(thr);
                next_poll = Some(now + every);
            }
        }

        if results_due.map_or(false, |t| now >= t) {
            let Some(mut done) = running.take() else {
                results_due = None;
                continue;
            };
            debug_assert_eq!(busy, BusyState::Idle);
            busy = BusyState::GettingResults;
            let collected = drv.job_get_results(thr, &done);
            busy = BusyState::Idle;
            match collected {
                Ok(()) => match drv.job_process_results(thr, &mut done, false) {
                    Ok(hashes) => {
                        thr.count_hashes(hashes);
                        thr.device.report_valid_work();
                    }
                    Err(e) => {
                        warn!(
                            "{} {} job_process_results: {}",
                            thr.device.name, thr.device.id, e
                        );
                        thr.device.report_comms_error();
                    }
                },
                Err(e) => {
                    warn!("{} {} job_get_results: {}", thr.device.name, thr.device.id, e);
                    thr.device.report_comms_error();
                }
            }
            results_due = None;
            job_transition = false;
        }
    }

    // Drain the final job so its results are not lost.
    if let Some(mut done) = running.take() {
        if drv.job_get_results(thr, &done).is_ok() {
            if let Ok(hashes) = drv.job_process_results(thr, &mut done, true) {
                thr.count_hashes(hashes);
            }
        }
    }
}

/// Queue shape: keep the driver's internal queue topped up and park on the
/// device condvar while it hashes.
fn minerloop_queue(thr: &ThreadCtx, drv: &dyn QueueDriver) {
    let core = &thr.core;
    while !core.is_shutdown() {
        if !thr.device.is_enabled() {
            if !pause_while_disabled(thr) {
                break;
            }
            continue;
        }

        if thr.shared.take_restart() {
            drv.queue_flush(&thr.device);
        }

        while !drv.queue_full(&thr.device) {
            let staged = thr
                .device
                .get_queued()
                .or_else(|| get_queue_work(thr, Duration::ZERO));
            let Some(work) = staged else { break };
            if drv.queue_append(thr, &work) {
                thr.device.add_queued(work);
                thr.device.report_valid_work();
            } else {
                // Driver is full; hold the work at the device until it
                // drains.
                thr.device.requeue_front(work);
                break;
            }
        }

        thr.device.wait_wake(Duration::from_millis(100));
    }
    drv.queue_flush(&thr.device);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use crate::driver::DriverBase;
    use crate::error::Result as CoreResult;
    use crate::options::Options;
    use crate::pool::PoolConfig;
    use crate::work::PoolId;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;

    fn test_core(opts: Options) -> (tokio::runtime::Runtime, Arc<Core>) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = Core::new(opts, rt.handle().clone());
        (rt, core)
    }

    fn add_live_pool(core: &Arc<Core>) -> Arc<crate::pool::Pool> {
        let pool = core.add_pool(PoolConfig {
            url: "stratum+tcp://pool.example:3333".into(),
            user: "u".into(),
            pass: "x".into(),
            prio: 0,
            quota: 1,
        });
        pool.idle.store(false, Ordering::Relaxed);
        pool
    }

    fn stage_work(core: &Arc<Core>, pool: PoolId, rolllimit: u32) -> Work {
        let mut w = Work::new(pool);
        w.rolltime = rolllimit;
        w.drv_rolllimit = rolllimit;
        w.target = [0xff; 32];
        assert!(core.staging.push(w.clone()));
        w
    }

    struct CountingScanDriver {
        calls: AtomicU64,
        rolled_ntimes: Mutex<Vec<u32>>,
        stop_after: u64,
    }

    impl DriverBase for CountingScanDriver {
        fn name(&self) -> &'static str {
            "countscan"
        }
    }

    impl LegacyDriver for CountingScanDriver {
        fn scanhash(&self, thr: &ThreadCtx, work: &mut Work, _max: u32) -> CoreResult<u64> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.rolled_ntimes.lock().push(work.ntime());
            // Burn the whole nonce space each call to force the roll path.
            work.nonce = u32::MAX;
            if n >= self.stop_after {
                thr.core.kill_work();
            }
            Ok(1000)
        }
    }

    /// Scenario: a work with a roll limit of 2 is mined, rolled twice, and
    /// the third roll is refused so fresh work is fetched.
    #[test]
    fn scanhash_loop_rolls_to_the_limit_then_refetches() {
        let (_rt, core) = test_core(Options::default());
        let pool = add_live_pool(&core);
        let drv = Arc::new(CountingScanDriver {
            calls: AtomicU64::new(0),
            rolled_ntimes: Mutex::new(Vec::new()),
            stop_after: 4,
        });
        let device = core.add_device(
            DeviceSpec {
                rolllimit: 2,
                ..DeviceSpec::default()
            },
            DriverKind::Legacy(drv.clone()),
        );

        let base = stage_work(&core, pool.id, 2);
        // A second staged work proves the loop fetches anew after the
        // roll limit.
        stage_work(&core, pool.id, 2);

        let shared = Arc::new(ThreadShared::new(0, device.id, 0));
        core.devices.register_thread(Arc::clone(&shared));
        let thr = ThreadCtx {
            core: Arc::clone(&core),
            device,
            shared,
            primary: true,
        };
        minerloop_scanhash(&thr, drv.as_ref());

        let ntimes = drv.rolled_ntimes.lock().clone();
        let base_ntime = base.ntime();
        // First work scanned at base, base+1, base+2, then the fresh one.
        assert_eq!(
            &ntimes[..3],
            &[base_ntime, base_ntime + 1, base_ntime + 2],
            "ntime must advance by exactly one per roll"
        );
        assert_eq!(ntimes.len(), 4);
        assert_eq!(ntimes[3], base_ntime, "fresh work, not a third roll");
    }

    struct OneShotAsyncDriver {
        started: AtomicU64,
        prepared: AtomicU64,
        processed: AtomicU64,
    }

    impl DriverBase for OneShotAsyncDriver {
        fn name(&self) -> &'static str {
            "oneshot"
        }
    }

    impl AsyncDriver for OneShotAsyncDriver {
        fn job_prepare(&self, _thr: &ThreadCtx, _work: &Work, _max: u32) -> CoreResult<Duration> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(Duration::from_millis(10))
        }

        fn job_start(&self, _thr: &ThreadCtx) -> CoreResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn job_get_results(&self, _thr: &ThreadCtx, _work: &Work) -> CoreResult<()> {
            Ok(())
        }

        fn job_process_results(
            &self,
            thr: &ThreadCtx,
            _work: &mut Work,
            _stopping: bool,
        ) -> CoreResult<u64> {
            let n = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= 3 {
                thr.core.kill_work();
            }
            Ok(500)
        }
    }

    #[test]
    fn async_loop_pairs_start_and_results() {
        let (_rt, core) = test_core(Options::default());
        let pool = add_live_pool(&core);
        for _ in 0..4 {
            stage_work(&core, pool.id, 0);
        }
        let drv = Arc::new(OneShotAsyncDriver {
            started: AtomicU64::new(0),
            prepared: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        });
        let device = core.add_device(DeviceSpec::default(), DriverKind::Async(drv.clone()));
        let shared = Arc::new(ThreadShared::new(0, device.id, 0));
        core.devices.register_thread(Arc::clone(&shared));
        let thr = ThreadCtx {
            core: Arc::clone(&core),
            device,
            shared,
            primary: true,
        };
        minerloop_async(&thr, drv.as_ref());

        let started = drv.started.load(Ordering::SeqCst);
        let prepared = drv.prepared.load(Ordering::SeqCst);
        let processed = drv.processed.load(Ordering::SeqCst);
        assert_eq!(started, prepared, "every prepared job starts exactly once");
        assert!(processed >= 3);
        // The final in-flight job is drained at shutdown, so processing
        // can exceed starts by at most the drain.
        assert!(processed <= started, "never process a job that was not started");
    }

    struct SmallQueueDriver {
        capacity: usize,
        inner: Mutex<Vec<Work>>,
        appended: AtomicU64,
        flushed: AtomicU64,
    }

    impl DriverBase for SmallQueueDriver {
        fn name(&self) -> &'static str {
            "smallqueue"
        }
    }

    impl QueueDriver for SmallQueueDriver {
        fn queue_append(&self, thr: &ThreadCtx, work: &Work) -> bool {
            let mut inner = self.inner.lock();
            if inner.len() >= self.capacity {
                return false;
            }
            inner.push(work.clone());
            let n = self.appended.fetch_add(1, Ordering::SeqCst) + 1;
            thr.count_hashes(100);
            if n >= 2 {
                thr.core.kill_work();
            }
            true
        }

        fn queue_flush(&self, _dev: &Device) {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            self.inner.lock().clear();
        }

        fn queue_full(&self, _dev: &Device) -> bool {
            self.inner.lock().len() >= self.capacity
        }
    }

    #[test]
    fn queue_loop_fills_driver_and_tracks_queued() {
        let (_rt, core) = test_core(Options::default());
        let pool = add_live_pool(&core);
        for _ in 0..3 {
            stage_work(&core, pool.id, 0);
        }
        let drv = Arc::new(SmallQueueDriver {
            capacity: 2,
            inner: Mutex::new(Vec::new()),
            appended: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        });
        let device = core.add_device(DeviceSpec::default(), DriverKind::Queue(drv.clone()));
        let shared = Arc::new(ThreadShared::new(0, device.id, 0));
        core.devices.register_thread(Arc::clone(&shared));
        let thr = ThreadCtx {
            core: Arc::clone(&core),
            device: Arc::clone(&device),
            shared,
            primary: true,
        };
        minerloop_queue(&thr, drv.as_ref());

        assert_eq!(drv.appended.load(Ordering::SeqCst), 2);
        assert_eq!(device.queued_count(), 2, "appended works become queued");
        // Shutdown flushes the driver queue.
        assert!(drv.flushed.load(Ordering::SeqCst) >= 1);
    }
}
