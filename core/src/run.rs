//! The coordinator context: every former process-global lives here, with
//! explicit construction and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::device::{Device, DeviceSet, DeviceSpec, ThreadShared};
use crate::driver::DriverKind;
use crate::error::{CoreError, Result};
use crate::minerloop;
use crate::options::Options;
use crate::pool::{getwork, stratum, Pool, PoolConfig, PoolProtocol, PoolSet};
use crate::queue::Pop;
use crate::staging::StagingQueue;
use crate::stats::{hashmeter_loop, Stats};
use crate::submit::{stale_ctx, submitter_loop};
use crate::watchdog::watchdog_loop;
use crate::work::{stale_work_future, Work};

pub struct Core {
    pub opts: Options,
    pub pools: PoolSet,
    pub devices: DeviceSet,
    pub staging: StagingQueue,
    pub stats: Stats,
    pub rt: tokio::runtime::Handle,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_watch: watch::Receiver<bool>,
    restart_requested: AtomicBool,
}

impl Core {
    pub fn new(opts: Options, rt: tokio::runtime::Handle) -> Arc<Self> {
        let (shutdown_tx, shutdown_watch) = watch::channel(false);
        let staging = StagingQueue::new(opts.queue_depth.max(1) + 1);
        Arc::new(Self {
            pools: PoolSet::new(opts.clone()),
            devices: DeviceSet::new(),
            staging,
            stats: Stats::new(),
            rt,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            shutdown_watch,
            restart_requested: AtomicBool::new(false),
            opts,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_watch.clone()
    }

    pub fn add_pool(&self, cfg: PoolConfig) -> Arc<Pool> {
        self.pools.add_pool(cfg)
    }

    pub fn add_device(&self, spec: DeviceSpec, driver: DriverKind) -> Arc<Device> {
        self.devices.add_device(spec, driver, self.opts.cutoff_temp)
    }

    pub fn note_new_block(&self, pool: &Pool, block_id: u32) {
        self.stats.new_blocks.fetch_add(1, Ordering::Relaxed);
        *self.stats.block_time.lock() = Some(Instant::now());
        info!(
            "new block {:08x} detected via pool {}",
            block_id, pool.id.0
        );
    }

    /// Throws away everything mined against the pool's previous job or
    /// block: staged work is flagged, in-flight device work is flagged,
    /// unstarted device work is dropped, and every worker restarts.
    pub fn invalidate_pool_work(&self, pool: &Pool) {
        let restart_id = pool.bump_work_restart();
        let block_id = pool.block_id.load(Ordering::Relaxed);
        let pool_id = pool.id;
        let dead = |w: &Work| {
            w.pool == pool_id && (w.restart_id != restart_id || w.block_id != block_id)
        };

        let staged = self.staging.mark_stale_matching(dead);
        self.devices.invalidate_matching(dead);
        *pool.last_work.lock() = None;
        self.devices.signal_restart_all();
        if staged > 0 {
            debug!(
                "pool {} invalidated {} staged works (restart {})",
                pool_id.0, staged, restart_id
            );
        }
    }

    /// Process-wide stop: freeze every queue and wake every sleeper; each
    /// thread exits at its next suspension point.
    pub fn kill_work(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.staging.freeze();
        for pool in self.pools.all() {
            pool.submit_q.freeze();
            pool.getwork_q.freeze();
        }
        self.devices.wake_all();
    }

    /// kill_work plus a request that the binary re-exec itself.
    pub fn app_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.kill_work();
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Spawns the whole thread fleet. Call once, after pools and devices
    /// are registered.
    pub fn start(self: &Arc<Self>) -> CoreHandles {
        let mut threads = Vec::new();
        let mut tasks = Vec::new();

        // Miner threads, one per device-thread.
        let mut thr_id = 0usize;
        for device in self.devices.all() {
            for device_thread in 0..device.threads {
                let shared = Arc::new(ThreadShared::new(thr_id, device.id, device_thread));
                self.devices.register_thread(Arc::clone(&shared));
                let core = Arc::clone(self);
                let dev = Arc::clone(&device);
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("miner-{}-{}", device.id, device_thread))
                        .spawn(move || minerloop::miner_thread(core, dev, shared))
                        .expect("spawn miner thread"),
                );
                thr_id += 1;
            }
        }
        self.staging
            .set_capacity(self.opts.staging_capacity(thr_id));

        // Pool plumbing: stratum task or long-poll thread, plus submitter.
        for pool in self.pools.all() {
            let core = Arc::clone(self);
            let p = Arc::clone(&pool);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("submit-{}", pool.id.0))
                    .spawn(move || submitter_loop(core, p))
                    .expect("spawn submitter"),
            );

            if pool.has_stratum.load(Ordering::Relaxed) {
                let core = Arc::clone(self);
                let p = Arc::clone(&pool);
                tasks.push(self.rt.spawn(stratum::run_pool_stratum(core, p)));
            } else {
                let core = Arc::clone(self);
                let p = Arc::clone(&pool);
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("longpoll-{}", pool.id.0))
                        .spawn(move || getwork::longpoll_loop(core, p))
                        .expect("spawn longpoll"),
                );
            }
        }

        // Generator, watchdog, hashmeter.
        let core = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("work-gen".into())
                .spawn(move || generator_loop(core))
                .expect("spawn generator"),
        );
        let core = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("watchdog".into())
                .spawn(move || watchdog_loop(core))
                .expect("spawn watchdog"),
        );
        let core = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("hashmeter".into())
                .spawn(move || hashmeter_loop(core))
                .expect("spawn hashmeter"),
        );

        CoreHandles { threads, tasks }
    }
}

pub struct CoreHandles {
    threads: Vec<std::thread::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl CoreHandles {
    /// Blocks until every worker thread is done; async tasks are aborted
    /// (they observe the shutdown watch on their own).
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// How often the generator retries an idle HTTP pool to see whether it
/// came back. Stratum pools re-probe themselves through their reconnect
/// loop.
const POOL_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Work generator thread: keeps the staging queue topped up from whichever
/// pool the strategy picks.
pub fn generator_loop(core: Arc<Core>) {
    debug!("work generator running");
    let mut next_probe = Instant::now() + POOL_PROBE_INTERVAL;
    while !core.is_shutdown() {
        if !core.staging.wait_space(Duration::from_millis(500)) {
            break;
        }
        if core.staging.len() >= core.staging.capacity() {
            continue;
        }

        if core.opts.benchmark {
            core.stats.local_work.fetch_add(1, Ordering::Relaxed);
            if !core.staging.push(Work::benchmark()) {
                break;
            }
            continue;
        }

        // Long-poll deliveries preempt normal generation.
        if push_longpoll_work(&core) {
            continue;
        }

        // Periodically knock on the door of a downed HTTP pool; one good
        // reply revives it and failover takes it straight back.
        if Instant::now() >= next_probe {
            next_probe = Instant::now() + POOL_PROBE_INTERVAL;
            if let Some(dead) = idle_http_pool(&core) {
                match generate_from(&core, &dead) {
                    Ok(work) => {
                        dead.work_succeeded();
                        core.staging.push(work);
                        continue;
                    }
                    Err(e) => debug!("pool {} still down: {}", dead.id.0, e),
                }
            }
        }

        let Some(pool) = core.pools.select_for_work() else {
            warn!("no pools usable, waiting");
            std::thread::sleep(Duration::from_secs(1));
            continue;
        };

        match generate_from(&core, &pool) {
            Ok(work) => {
                pool.work_succeeded();
                if !core.staging.push(work) {
                    break;
                }
            }
            Err(e) => {
                debug!("pool {} work fetch failed: {}", pool.id.0, e);
                if pool.work_failed() {
                    core.pools
                        .switch_pools(None, &core.devices, &core.staging);
                }
                std::thread::sleep(core.opts.fail_pause);
            }
        }
    }
    debug!("work generator exiting");
}

fn idle_http_pool(core: &Arc<Core>) -> Option<Arc<Pool>> {
    core.pools
        .all()
        .into_iter()
        .filter(|p| {
            p.idle.load(Ordering::Relaxed)
                && !p.removed.load(Ordering::Relaxed)
                && !p.has_stratum.load(Ordering::Relaxed)
                && p.enabled_state() == crate::pool::PoolEnable::Enabled
        })
        .min_by_key(|p| p.prio.load(Ordering::Relaxed))
}

fn push_longpoll_work(core: &Arc<Core>) -> bool {
    for pool in core.pools.all() {
        if let Pop::Item(work) = pool.getwork_q.pop(Some(Duration::ZERO)) {
            pool.work_succeeded();
            return core.staging.push(work);
        }
    }
    false
}

fn generate_from(core: &Arc<Core>, pool: &Arc<Pool>) -> Result<Work> {
    if pool.has_stratum.load(Ordering::Relaxed) {
        if !pool.stratum_active.load(Ordering::Relaxed) {
            return Err(CoreError::Transient("stratum session not up yet".into()));
        }
        return stratum::gen_stratum_work(pool)
            .ok_or_else(|| CoreError::Transient("no stratum job received yet".into()));
    }

    // Local clone: roll the cached base work instead of asking upstream.
    {
        let ctx = stale_ctx(core, pool);
        let mut cache = pool.last_work.lock();
        if let Some(base) = cache.as_ref() {
            if base.can_roll() && !stale_work_future(base, false, Duration::from_secs(1), &ctx) {
                let rolled = base.roll();
                *cache = Some(rolled.clone());
                core.stats.local_work.fetch_add(1, Ordering::Relaxed);
                return Ok(rolled);
            }
            *cache = None;
        }
    }

    // Probe getblocktemplate once; fall back to getwork forever after.
    let proto = *pool.proto.lock();
    let work = match proto {
        PoolProtocol::Gbt => {
            let tmpl = getwork::fetch_template(pool)?;
            getwork::work_from_template(pool, &tmpl)
        }
        PoolProtocol::Getwork if !pool.probed.load(Ordering::Relaxed) => {
            match getwork::fetch_template(pool) {
                Ok(tmpl) => {
                    *pool.proto.lock() = PoolProtocol::Gbt;
                    info!("pool {} speaks getblocktemplate", pool.id.0);
                    getwork::work_from_template(pool, &tmpl)
                }
                Err(CoreError::Config(e)) => {
                    debug!("pool {} gbt unusable ({}), using getwork", pool.id.0, e);
                    getwork::fetch_getwork(pool)?
                }
                Err(_) => getwork::fetch_getwork(pool)?,
            }
        }
        _ => getwork::fetch_getwork(pool)?,
    };

    // Block-change detection for HTTP pools.
    let old = pool.block_id.swap(work.block_id, Ordering::Relaxed);
    if old != 0 && old != work.block_id {
        core.note_new_block(pool, work.block_id);
        core.invalidate_pool_work(pool);
    }

    core.stats.getworks.fetch_add(1, Ordering::Relaxed);
    if work.can_roll() {
        *pool.last_work.lock() = Some(work.clone());
    }
    Ok(work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolEnable;

    fn test_core() -> (tokio::runtime::Runtime, Arc<Core>) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = Core::new(Options::default(), rt.handle().clone());
        (rt, core)
    }

    fn stratum_pool(core: &Arc<Core>, prio: usize) -> Arc<Pool> {
        core.add_pool(PoolConfig {
            url: format!("stratum+tcp://pool{}.example:3333", prio),
            user: "u".into(),
            pass: "x".into(),
            prio,
            quota: 1,
        })
    }

    #[test]
    fn kill_work_freezes_everything() {
        let (_rt, core) = test_core();
        let pool = stratum_pool(&core, 0);
        assert!(!core.is_shutdown());
        core.kill_work();
        assert!(core.is_shutdown());
        assert!(!core.staging.push(Work::benchmark()));
        assert!(!pool.submit_q.push(crate::submit::SubmitItem {
            work: Work::new(pool.id),
            nonce: 0,
            attempts: 0,
            created: Instant::now(),
        }));
        // Idempotent.
        core.kill_work();
    }

    #[test]
    fn invalidate_marks_stale_and_signals_restart() {
        let (_rt, core) = test_core();
        let pool = stratum_pool(&core, 0);
        pool.idle.store(false, Ordering::Relaxed);

        let mut work = Work::new(pool.id);
        work.restart_id = pool.work_restart_id.load(Ordering::Relaxed);
        work.block_id = pool.block_id.load(Ordering::Relaxed);
        assert!(core.staging.push(work));

        let shared = Arc::new(ThreadShared::new(0, 0, 0));
        core.devices.register_thread(Arc::clone(&shared));

        core.invalidate_pool_work(&pool);
        assert!(shared.take_restart());
        // The staged work is now flagged stale.
        match core.staging.pop(Some(Duration::from_millis(10))) {
            Pop::Item(w) => assert!(w.stale),
            other => panic!("expected work, got {:?}", matches!(other, Pop::Timeout)),
        }
    }

    #[test]
    fn benchmark_generator_fills_staging() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut opts = Options::default();
        opts.benchmark = true;
        let core = Core::new(opts, rt.handle().clone());
        let core2 = Arc::clone(&core);
        let gen = std::thread::spawn(move || generator_loop(core2));
        let work = loop {
            match core.staging.pop(Some(Duration::from_millis(200))) {
                Pop::Item(w) => break w,
                Pop::Timeout => continue,
                Pop::Terminated => panic!("staging frozen early"),
            }
        };
        assert!(work.mandatory);
        core.kill_work();
        gen.join().unwrap();
    }

    #[test]
    fn disabled_pools_do_not_generate() {
        let (_rt, core) = test_core();
        let pool = stratum_pool(&core, 0);
        pool.idle.store(false, Ordering::Relaxed);
        *pool.enabled.lock() = PoolEnable::Disabled;
        assert!(core.pools.select_for_work().is_none());
    }
}
