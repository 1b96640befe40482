//! Hardware-error accounting from the submit path into watchdog recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stope_core::device::{DevEnable, DevReason, ThreadShared};
use stope_core::driver::{DriverBase, DriverKind, LegacyDriver};
use stope_core::error::Result as CoreResult;
use stope_core::submit::submit_nonce;
use stope_core::watchdog::{watchdog_tick, WatchdogState};
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

#[test]
fn bad_nonces_accumulate_and_escalate_to_recover_err() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let core = Core::new(Options::default(), rt.handle().clone());
    let pool = core.add_pool(PoolConfig {
        url: "stratum+tcp://pool.example:3333".into(),
        user: "u".into(),
        pass: "x".into(),
        prio: 0,
        quota: 1,
    });
    // An impossible floor turns every nonce into a hardware error.
    pool.set_min_diff(f64::INFINITY);

    let device = core.add_device(DeviceSpec::default(), DriverKind::Legacy(Arc::new(InertDriver)));
    let shared = Arc::new(ThreadShared::new(0, device.id, 0));
    core.devices.register_thread(Arc::clone(&shared));
    let thr = ThreadCtx {
        core: Arc::clone(&core),
        device: Arc::clone(&device),
        shared,
        primary: true,
    };

    let mut work = Work::new(pool.id);
    work.target = [0u8; 32];
    work.nonce_diff = 1.0;

    for nonce in 0..10u32 {
        assert!(!submit_nonce(&core, Some(&thr), &work, nonce));
    }
    assert_eq!(device.hw_errors.load(Ordering::Relaxed), 10);
    assert_eq!(core.stats.hw_errors.load(Ordering::Relaxed), 10);
    let bad_diff1 = device.diffs.lock().bad_diff1;
    assert!((bad_diff1 - 10.0).abs() < 1e-9, "bad_diff1 {}", bad_diff1);

    // The watchdog sees the burst rate and quarantines the device.
    let mut state = WatchdogState::default();
    let t0 = Instant::now();
    watchdog_tick(&core, &device, &mut state, t0);
    // First tick only primes the baseline when errors predate it; force a
    // fresh burst inside one interval.
    device.hw_errors.fetch_add(10, Ordering::Relaxed);
    watchdog_tick(&core, &device, &mut state, t0 + Duration::from_secs(2));
    assert_eq!(*device.deven.lock(), DevEnable::RecoverErr);
    assert_eq!(
        *device.not_well_reason.lock(),
        Some(DevReason::CommsError)
    );
}

#[test]
fn min_diff_floor_separates_high_from_bad() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let core = Core::new(Options::default(), rt.handle().clone());
    let pool = core.add_pool(PoolConfig {
        url: "stratum+tcp://pool.example:3333".into(),
        user: "u".into(),
        pass: "x".into(),
        prio: 0,
        quota: 1,
    });
    // Permissive floor: a hash that misses the share target is High, not
    // a hardware error.
    pool.set_min_diff(1e-12);

    let mut work = Work::new(pool.id);
    work.target = [0u8; 32];

    let stale_before = core.stats.stale.load(Ordering::Relaxed);
    assert!(!submit_nonce(&core, None, &work, 7));
    assert_eq!(core.stats.hw_errors.load(Ordering::Relaxed), 0);
    assert_eq!(
        core.stats.stale.load(Ordering::Relaxed),
        stale_before + 1,
        "High results are accounted stale-but-not-submitted"
    );
}
