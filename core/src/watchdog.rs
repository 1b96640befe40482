//! Periodic device supervisor: liveness, thermal, and comms recovery.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::device::{DevEnable, DevLife, DevReason, Device};
use crate::run::Core;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// A device idle this long is sick.
const SICK_IDLE: Duration = Duration::from_secs(60);
/// A device idle this long is declared dead and reinitialized.
const DEAD_IDLE: Duration = Duration::from_secs(600);
/// Hardware errors per watchdog tick that imply a comms problem.
const HW_ERROR_RATE: u64 = 10;
const REINIT_BACKOFF_CAP: Duration = Duration::from_secs(300);

#[derive(Default)]
pub struct WatchdogState {
    hw_seen: HashMap<usize, u64>,
}

pub fn watchdog_loop(core: Arc<Core>) {
    let mut state = WatchdogState::default();
    while !core.is_shutdown() {
        std::thread::sleep(WATCHDOG_INTERVAL);
        let now = Instant::now();
        for dev in core.devices.all() {
            watchdog_tick(&core, &dev, &mut state, now);
        }
    }
}

/// One supervision pass over one device.
pub fn watchdog_tick(core: &Arc<Core>, dev: &Arc<Device>, state: &mut WatchdogState, now: Instant) {
    let driver = dev.driver.clone();
    driver.base().watchdog(dev, now);

    if let Some(temp) = driver.base().temperature(dev) {
        *dev.temp.lock() = Some(temp);
    }
    check_thermal(core, dev);
    check_comms(dev, state, now);
    check_liveness(dev, now);
    run_pending_reinit(core, dev, now);
}

fn wake_device_threads(core: &Core, dev: &Device) {
    for thr in core.devices.threads() {
        if thr.device_id == dev.id {
            thr.notifier.wake();
        }
    }
    dev.wake();
}

fn check_thermal(core: &Arc<Core>, dev: &Arc<Device>) {
    let Some(temp) = *dev.temp.lock() else { return };
    let mut deven = dev.deven.lock();
    match *deven {
        DevEnable::Enabled if temp >= dev.cutoff_temp => {
            *deven = DevEnable::Recover;
            drop(deven);
            dev.report_not_well(DevReason::ThermalCutoff);
            warn!(
                "{} {} hit thermal cutoff ({:.0}C >= {:.0}C), pausing",
                dev.name, dev.id, temp, dev.cutoff_temp
            );
        }
        DevEnable::Recover if temp <= dev.cutoff_temp - core.opts.hysteresis => {
            *deven = DevEnable::Enabled;
            drop(deven);
            info!(
                "{} {} cooled to {:.0}C, resuming",
                dev.name, dev.id, temp
            );
            wake_device_threads(core, dev);
        }
        _ => {}
    }
}

fn check_comms(dev: &Arc<Device>, state: &mut WatchdogState, now: Instant) {
    let comms_flagged = dev.comms_error.swap(false, Ordering::Relaxed);
    let hw_now = dev.hw_errors.load(Ordering::Relaxed);
    let hw_before = state.hw_seen.insert(dev.id, hw_now).unwrap_or(hw_now);
    let hw_delta = hw_now.saturating_sub(hw_before);

    if !comms_flagged && hw_delta < HW_ERROR_RATE {
        return;
    }
    let mut deven = dev.deven.lock();
    if *deven != DevEnable::Enabled {
        return;
    }
    *deven = DevEnable::RecoverErr;
    drop(deven);
    dev.report_not_well(DevReason::CommsError);
    let backoff = *dev.reinit_backoff.lock();
    *dev.next_reinit.lock() = Some(now + backoff);
    warn!(
        "{} {} communications trouble ({}), recovering in {:.0}s",
        dev.name,
        dev.id,
        if comms_flagged {
            "driver error".to_string()
        } else {
            format!("{} hardware errors in one interval", hw_delta)
        },
        backoff.as_secs_f64()
    );
}

fn check_liveness(dev: &Arc<Device>, now: Instant) {
    let idle_for = now.saturating_duration_since(*dev.last_valid_work.lock());
    let mut status = dev.status.lock();
    match *status {
        DevLife::Well | DevLife::Sick if idle_for >= DEAD_IDLE => {
            *status = DevLife::Dead;
            drop(status);
            dev.report_not_well(DevReason::DeadIdle600);
            warn!(
                "{} {} declared dead: {}",
                dev.name,
                dev.id,
                DevReason::DeadIdle600.describe()
            );
            let backoff = *dev.reinit_backoff.lock();
            *dev.next_reinit.lock() = Some(now + backoff);
        }
        DevLife::Well if idle_for >= SICK_IDLE => {
            *status = DevLife::Sick;
            drop(status);
            dev.report_not_well(DevReason::SickIdle60);
            warn!(
                "{} {} is sick: {}",
                dev.name,
                dev.id,
                DevReason::SickIdle60.describe()
            );
        }
        DevLife::Sick | DevLife::Dead if idle_for < SICK_IDLE => {
            *status = DevLife::Well;
            drop(status);
            *dev.last_well.lock() = now;
            info!("{} {} reporting in again", dev.name, dev.id);
        }
        _ => {}
    }
}

/// Attempts a driver reinit when one is due, doubling the backoff on
/// failure and decaying it on success.
fn run_pending_reinit(core: &Arc<Core>, dev: &Arc<Device>, now: Instant) {
    let needs_reinit = {
        let deven = dev.deven.lock();
        *deven == DevEnable::RecoverErr || *dev.status.lock() == DevLife::Dead
    };
    if !needs_reinit {
        return;
    }
    let due = { *dev.next_reinit.lock() };
    if due.map_or(false, |t| now < t) {
        return;
    }

    match dev.driver.base().reinit(dev) {
        Ok(()) => {
            {
                let mut deven = dev.deven.lock();
                if *deven == DevEnable::RecoverErr {
                    *deven = DevEnable::Enabled;
                }
            }
            *dev.status.lock() = DevLife::Well;
            *dev.last_valid_work.lock() = now;
            let mut backoff = dev.reinit_backoff.lock();
            *backoff = (*backoff / 2).max(Duration::from_secs(1));
            *dev.next_reinit.lock() = None;
            info!("{} {} reinitialized", dev.name, dev.id);
            wake_device_threads(core, dev);
        }
        Err(e) => {
            let mut backoff = dev.reinit_backoff.lock();
            *backoff = (*backoff * 2).min(REINIT_BACKOFF_CAP);
            *dev.next_reinit.lock() = Some(now + *backoff);
            warn!(
                "{} {} reinit failed ({}), next attempt in {:.0}s",
                dev.name,
                dev.id,
                e,
                backoff.as_secs_f64()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use crate::driver::{tests::NullDriver, DriverKind};
    use crate::options::Options;
    use crate::run::Core;

    fn test_core() -> (tokio::runtime::Runtime, Arc<Core>) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut opts = Options::default();
        opts.cutoff_temp = 85.0;
        opts.hysteresis = 3.0;
        let core = Core::new(opts, rt.handle().clone());
        (rt, core)
    }

    fn device(core: &Arc<Core>) -> Arc<Device> {
        core.add_device(
            DeviceSpec::default(),
            DriverKind::Legacy(Arc::new(NullDriver)),
        )
    }

    /// Scenario: 90C against an 85C cutoff pauses the device; 82C with 3
    /// degrees of hysteresis resumes it.
    #[test]
    fn thermal_cutoff_and_recovery() {
        let (_rt, core) = test_core();
        let dev = device(&core);
        let mut state = WatchdogState::default();

        *dev.temp.lock() = Some(90.0);
        watchdog_tick(&core, &dev, &mut state, Instant::now());
        assert_eq!(*dev.deven.lock(), DevEnable::Recover);
        assert_eq!(*dev.not_well_reason.lock(), Some(DevReason::ThermalCutoff));

        // 84C is inside the hysteresis band: still recovering.
        *dev.temp.lock() = Some(84.0);
        watchdog_tick(&core, &dev, &mut state, Instant::now());
        assert_eq!(*dev.deven.lock(), DevEnable::Recover);

        *dev.temp.lock() = Some(82.0);
        watchdog_tick(&core, &dev, &mut state, Instant::now());
        assert_eq!(*dev.deven.lock(), DevEnable::Enabled);
    }

    #[test]
    fn idle_device_goes_sick_then_dead() {
        let (_rt, core) = test_core();
        let dev = device(&core);
        let mut state = WatchdogState::default();
        let now = Instant::now();
        *dev.status.lock() = DevLife::Well;

        watchdog_tick(&core, &dev, &mut state, now + SICK_IDLE + Duration::from_secs(1));
        assert_eq!(*dev.status.lock(), DevLife::Sick);
        assert_eq!(*dev.not_well_reason.lock(), Some(DevReason::SickIdle60));

        watchdog_tick(&core, &dev, &mut state, now + DEAD_IDLE + Duration::from_secs(1));
        assert_eq!(*dev.status.lock(), DevLife::Dead);
        {
            let counts = dev.reason_counts.lock();
            assert_eq!(counts[DevReason::SickIdle60.index()], 1);
            assert_eq!(counts[DevReason::DeadIdle600.index()], 1);
        }

        // Once the reinit backoff elapses the NullDriver revives it.
        watchdog_tick(&core, &dev, &mut state, now + DEAD_IDLE + Duration::from_secs(5));
        assert_eq!(*dev.status.lock(), DevLife::Well);
    }

    /// Scenario: a burst of hardware errors in one interval sends the
    /// device to RecoverErr with a comms reason and a growing backoff.
    #[test]
    fn hardware_error_burst_triggers_recover_err() {
        let (_rt, core) = test_core();
        let dev = device(&core);
        let mut state = WatchdogState::default();
        let t0 = Instant::now();

        // Prime the baseline.
        watchdog_tick(&core, &dev, &mut state, t0);
        dev.hw_errors.fetch_add(10, Ordering::Relaxed);
        watchdog_tick(&core, &dev, &mut state, t0 + Duration::from_secs(2));
        assert_eq!(*dev.deven.lock(), DevEnable::RecoverErr);
        assert_eq!(*dev.not_well_reason.lock(), Some(DevReason::CommsError));

        // Reinit is deferred until the backoff elapses, then NullDriver
        // succeeds and the device is enabled again.
        watchdog_tick(&core, &dev, &mut state, t0 + Duration::from_secs(10));
        assert_eq!(*dev.deven.lock(), DevEnable::Enabled);
    }

    #[test]
    fn comms_error_flag_is_consumed() {
        let (_rt, core) = test_core();
        let dev = device(&core);
        let mut state = WatchdogState::default();
        dev.report_comms_error();
        watchdog_tick(&core, &dev, &mut state, Instant::now());
        assert_eq!(*dev.deven.lock(), DevEnable::RecoverErr);
        assert!(!dev.comms_error.load(Ordering::Relaxed));
    }
}
