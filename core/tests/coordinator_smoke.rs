//! Whole-coordinator smoke run in benchmark mode: generator, staging,
//! miner threads, hashmeter, watchdog, and orderly shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stope_core::driver::{DriverBase, DriverKind, LegacyDriver};
use stope_core::error::Result as CoreResult;
use stope_core::{Core, DeviceSpec, Options, ThreadCtx, Work};

struct BurnDriver;

impl DriverBase for BurnDriver {
    fn name(&self) -> &'static str {
        "burn"
    }
}

impl LegacyDriver for BurnDriver {
    fn scanhash(&self, _thr: &ThreadCtx, work: &mut Work, _max: u32) -> CoreResult<u64> {
        // Pretend the whole nonce space was ground through instantly.
        work.nonce = u32::MAX;
        std::thread::sleep(Duration::from_millis(5));
        Ok(1 << 20)
    }
}

#[test]
fn benchmark_run_counts_hashes_and_shuts_down_cleanly() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let mut opts = Options::default();
    opts.benchmark = true;
    opts.log_interval = Duration::from_millis(200);
    let core = Core::new(opts, rt.handle().clone());
    core.add_device(
        DeviceSpec {
            name: "BURN".into(),
            threads: 2,
            ..DeviceSpec::default()
        },
        DriverKind::Legacy(Arc::new(BurnDriver)),
    );

    let handles = core.start();
    assert_eq!(core.devices.mining_threads(), 2);

    // Let the fleet spin for a moment.
    let deadline = Instant::now() + Duration::from_secs(5);
    while core.stats.total_hashes.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "no hashes ever counted");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(core.stats.local_work.load(Ordering::Relaxed) > 0);

    core.kill_work();
    let join_started = Instant::now();
    handles.join();
    // Shutdown must not hang on any suspension point.
    assert!(
        join_started.elapsed() < Duration::from_secs(10),
        "join took {:?}",
        join_started.elapsed()
    );
    assert!(core.is_shutdown());
}
