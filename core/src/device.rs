//! Mining devices: registry, enable/liveness state, and the per-device
//! work queues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::driver::DriverKind;
use crate::sync::Notifier;
use crate::work::{Work, WorkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevEnable {
    Enabled,
    /// Disabled by the user.
    Disabled,
    /// Disabled by thermal cutoff; watchdog re-enables below hysteresis.
    Recover,
    /// Disabled by a communications error; reinit with backoff.
    RecoverErr,
    /// Disabled by the driver itself.
    RecoverDrv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevLife {
    Well,
    Sick,
    Dead,
    NoStart,
    Init,
    Wait,
    /// Still initializing, but safe to call into.
    Init2,
    /// Gone for good; never call into the driver again.
    Dead2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevReason {
    SickIdle60,
    DeadIdle600,
    NoStart,
    OverHeat,
    ThermalCutoff,
    CommsError,
    Throttle,
}

pub const DEV_REASON_COUNT: usize = 7;

impl DevReason {
    pub fn index(&self) -> usize {
        match self {
            DevReason::SickIdle60 => 0,
            DevReason::DeadIdle600 => 1,
            DevReason::NoStart => 2,
            DevReason::OverHeat => 3,
            DevReason::ThermalCutoff => 4,
            DevReason::CommsError => 5,
            DevReason::Throttle => 6,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            DevReason::SickIdle60 => "Device idle for 60s",
            DevReason::DeadIdle600 => "Device dead - idle for 600s",
            DevReason::NoStart => "Device failed to start",
            DevReason::OverHeat => "Device over heated",
            DevReason::ThermalCutoff => "Device reached thermal cutoff",
            DevReason::CommsError => "Device comms error",
            DevReason::Throttle => "Device throttle",
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceDiffs {
    pub diff1: f64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub bad_diff1: f64,
}

struct DeviceQueues {
    queued: HashMap<WorkId, Work>,
    unqueued: VecDeque<Work>,
}

/// What to register a device as.
pub struct DeviceSpec {
    pub name: String,
    pub procs: usize,
    pub threads: usize,
    /// Ceiling the device imposes on ntime rolling.
    pub rolllimit: u32,
    pub cutoff_temp: Option<f32>,
    pub target_temp: Option<f32>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            name: "DEV".into(),
            procs: 1,
            threads: 1,
            rolllimit: 0,
            cutoff_temp: None,
            target_temp: None,
        }
    }
}

pub struct Device {
    pub id: usize,
    pub name: String,
    pub driver: DriverKind,
    pub procs: usize,
    pub threads: usize,
    pub rolllimit: u32,
    pub cutoff_temp: f32,
    pub target_temp: f32,

    pub deven: Mutex<DevEnable>,
    pub status: Mutex<DevLife>,

    queues: RwLock<DeviceQueues>,
    queued_count: AtomicUsize,

    wake_lock: Mutex<bool>,
    wake_cond: Condvar,

    pub total_hashes: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub stale_shares: AtomicU64,
    pub hw_errors: AtomicU64,
    pub diffs: Mutex<DeviceDiffs>,
    pub rolling: Mutex<f64>,

    pub temp: Mutex<Option<f32>>,
    pub last_valid_work: Mutex<Instant>,
    pub last_well: Mutex<Instant>,
    pub last_not_well: Mutex<Option<Instant>>,
    pub not_well_reason: Mutex<Option<DevReason>>,
    pub reason_counts: Mutex<[u32; DEV_REASON_COUNT]>,

    pub reinit_backoff: Mutex<Duration>,
    pub next_reinit: Mutex<Option<Instant>>,
    /// Raised by miner loops on driver I/O failure; watchdog consumes it.
    pub comms_error: AtomicBool,

    pub started: Instant,
}

impl Device {
    fn new(id: usize, spec: DeviceSpec, driver: DriverKind, default_cutoff: f32) -> Self {
        let cutoff = spec.cutoff_temp.unwrap_or(default_cutoff);
        Self {
            id,
            name: spec.name,
            driver,
            procs: spec.procs.max(1),
            threads: spec.threads.max(1),
            rolllimit: spec.rolllimit,
            cutoff_temp: cutoff,
            target_temp: spec.target_temp.unwrap_or(cutoff - 15.0),
            deven: Mutex::new(DevEnable::Enabled),
            status: Mutex::new(DevLife::Init),
            queues: RwLock::new(DeviceQueues {
                queued: HashMap::new(),
                unqueued: VecDeque::new(),
            }),
            queued_count: AtomicUsize::new(0),
            wake_lock: Mutex::new(false),
            wake_cond: Condvar::new(),
            total_hashes: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale_shares: AtomicU64::new(0),
            hw_errors: AtomicU64::new(0),
            diffs: Mutex::new(DeviceDiffs::default()),
            rolling: Mutex::new(0.0),
            temp: Mutex::new(None),
            last_valid_work: Mutex::new(Instant::now()),
            last_well: Mutex::new(Instant::now()),
            last_not_well: Mutex::new(None),
            not_well_reason: Mutex::new(None),
            reason_counts: Mutex::new([0; DEV_REASON_COUNT]),
            reinit_backoff: Mutex::new(Duration::from_secs(1)),
            next_reinit: Mutex::new(None),
            comms_error: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Accepted shares per minute over the device's lifetime.
    pub fn utility(&self) -> f64 {
        let mins = self.started.elapsed().as_secs_f64() / 60.0;
        if mins <= 0.0 {
            return 0.0;
        }
        self.accepted.load(Ordering::Relaxed) as f64 / mins
    }

    pub fn is_enabled(&self) -> bool {
        *self.deven.lock() == DevEnable::Enabled
    }

    /// Records a not-well transition with its reason.
    pub fn report_not_well(&self, reason: DevReason) {
        *self.last_not_well.lock() = Some(Instant::now());
        *self.not_well_reason.lock() = Some(reason);
        self.reason_counts.lock()[reason.index()] += 1;
    }

    pub fn report_valid_work(&self) {
        *self.last_valid_work.lock() = Instant::now();
    }

    /// Miner loops report driver I/O failures here; the watchdog decides.
    pub fn report_comms_error(&self) {
        self.comms_error.store(true, Ordering::Relaxed);
    }

    // -- queue bookkeeping, all under the device queue lock ---------------

    /// Admits a work to the device: not yet handed to silicon.
    pub fn admit(&self, work: Work) {
        self.queues.write().unqueued.push_back(work);
    }

    /// Pops the oldest admitted-but-unstarted work.
    pub fn get_queued(&self) -> Option<Work> {
        self.queues.write().unqueued.pop_front()
    }

    /// Puts an unstarted work back at the head (driver queue was full).
    pub fn requeue_front(&self, work: Work) {
        self.queues.write().unqueued.push_front(work);
    }

    /// Registers a work as in flight on silicon.
    pub fn add_queued(&self, work: Work) {
        let mut q = self.queues.write();
        if q.queued.insert(work.id, work).is_none() {
            self.queued_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn queued_count(&self) -> usize {
        self.queued_count.load(Ordering::Relaxed)
    }

    pub fn unqueued_len(&self) -> usize {
        self.queues.read().unqueued.len()
    }

    fn matches(work: &Work, midstate: &[u8; 32], data_tail: &[u8; 12]) -> bool {
        work.midstate == *midstate && work.data[64..76] == data_tail[..]
    }

    /// Finds the in-flight work a result nonce belongs to.
    pub fn find_queued_work_bymidstate(
        &self,
        midstate: &[u8; 32],
        data_tail: &[u8; 12],
    ) -> Option<Work> {
        self.queues
            .read()
            .queued
            .values()
            .find(|w| Self::matches(w, midstate, data_tail))
            .cloned()
    }

    /// Like find, but the returned copy has a fresh identity (template Arc
    /// bumped); the original stays queued for further results.
    pub fn clone_queued_work_bymidstate(
        &self,
        midstate: &[u8; 32],
        data_tail: &[u8; 12],
    ) -> Option<Work> {
        self.find_queued_work_bymidstate(midstate, data_tail)
            .map(|w| w.copy())
    }

    /// Removes and returns the matching in-flight work.
    pub fn take_queued_work_bymidstate(
        &self,
        midstate: &[u8; 32],
        data_tail: &[u8; 12],
    ) -> Option<Work> {
        let mut q = self.queues.write();
        let id = q
            .queued
            .values()
            .find(|w| Self::matches(w, midstate, data_tail))
            .map(|w| w.id)?;
        let work = q.queued.remove(&id);
        if work.is_some() {
            self.queued_count.fetch_sub(1, Ordering::Relaxed);
        }
        work
    }

    /// Drops a finished in-flight work.
    pub fn work_completed(&self, id: WorkId) -> bool {
        let removed = self.queues.write().queued.remove(&id).is_some();
        if removed {
            self.queued_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Marks matching works in both lists stale; in-flight work finishes
    /// but is not submitted, unstarted work is dropped. Returns
    /// (marked in flight, dropped unstarted).
    pub fn invalidate_matching<F: Fn(&Work) -> bool>(&self, pred: F) -> (usize, usize) {
        let mut q = self.queues.write();
        let mut marked = 0;
        for w in q.queued.values_mut() {
            if !w.stale && pred(w) {
                w.stale = true;
                marked += 1;
            }
        }
        let before = q.unqueued.len();
        q.unqueued.retain(|w| !pred(w));
        (marked, before - q.unqueued.len())
    }

    /// Drops unstarted works matching the predicate (pool switch).
    pub fn drain_unqueued_matching<F: Fn(&Work) -> bool>(&self, pred: F) -> usize {
        let mut q = self.queues.write();
        let before = q.unqueued.len();
        q.unqueued.retain(|w| !pred(w));
        before - q.unqueued.len()
    }

    // -- device-private wakeup -------------------------------------------

    pub fn wake(&self) {
        *self.wake_lock.lock() = true;
        self.wake_cond.notify_all();
    }

    /// Queue-loop park spot: returns on wake or timeout.
    pub fn wait_wake(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut woken = self.wake_lock.lock();
        while !*woken {
            if self.wake_cond.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        *woken = false;
    }
}

/// One registry entry per miner thread, shared with the watchdog,
/// hashmeter, and pool switcher.
pub struct ThreadShared {
    pub thr_id: usize,
    pub device_id: usize,
    pub device_thread: usize,
    pub work_restart: AtomicBool,
    pub notifier: Notifier,
    pub work_restart_notifier: Notifier,
    pub hashes_done: AtomicU64,
    pub last_report: Mutex<Instant>,
    pub paused: AtomicBool,
}

impl ThreadShared {
    pub fn new(thr_id: usize, device_id: usize, device_thread: usize) -> Self {
        Self {
            thr_id,
            device_id,
            device_thread,
            work_restart: AtomicBool::new(false),
            notifier: Notifier::new(),
            work_restart_notifier: Notifier::new(),
            hashes_done: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
            paused: AtomicBool::new(false),
        }
    }

    /// Restart signals are sticky until the loop consumes them, so a
    /// consumer always observes the newest generation before producing.
    pub fn signal_restart(&self) {
        self.work_restart.store(true, Ordering::Release);
        self.work_restart_notifier.wake();
        self.notifier.wake();
    }

    pub fn take_restart(&self) -> bool {
        let hit = self.work_restart.swap(false, Ordering::AcqRel);
        if hit {
            self.work_restart_notifier.drain();
        }
        hit
    }
}

/// Ordered device registry plus the miner thread table.
pub struct DeviceSet {
    devices: RwLock<Vec<Arc<Device>>>,
    threads: RwLock<Vec<Arc<ThreadShared>>>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            threads: RwLock::new(Vec::new()),
        }
    }

    pub fn add_device(
        &self,
        spec: DeviceSpec,
        driver: DriverKind,
        default_cutoff: f32,
    ) -> Arc<Device> {
        let mut devices = self.devices.write();
        let id = devices.len();
        let dev = Arc::new(Device::new(id, spec, driver, default_cutoff));
        info!(
            "registered device {} {} ({} procs, {} threads)",
            id, dev.name, dev.procs, dev.threads
        );
        devices.push(Arc::clone(&dev));
        dev
    }

    pub fn register_thread(&self, shared: Arc<ThreadShared>) {
        self.threads.write().push(shared);
    }

    pub fn get(&self, id: usize) -> Option<Arc<Device>> {
        self.devices.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn threads(&self) -> Vec<Arc<ThreadShared>> {
        self.threads.read().clone()
    }

    pub fn mining_threads(&self) -> usize {
        self.threads.read().len()
    }

    pub fn signal_restart_all(&self) {
        for thr in self.threads.read().iter() {
            thr.signal_restart();
        }
        for dev in self.devices.read().iter() {
            dev.wake();
        }
    }

    pub fn drain_unqueued_matching<F: Fn(&Work) -> bool + Copy>(&self, pred: F) -> usize {
        let mut dropped = 0;
        for dev in self.devices.read().iter() {
            dropped += dev.drain_unqueued_matching(pred);
        }
        dropped
    }

    pub fn invalidate_matching<F: Fn(&Work) -> bool + Copy>(&self, pred: F) {
        for dev in self.devices.read().iter() {
            dev.invalidate_matching(pred);
        }
    }

    /// Wakes everything; used by shutdown.
    pub fn wake_all(&self) {
        for thr in self.threads.read().iter() {
            thr.notifier.wake();
            thr.work_restart_notifier.wake();
        }
        for dev in self.devices.read().iter() {
            dev.wake();
        }
    }
}

impl Default for DeviceSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{tests::NullDriver, DriverKind};
    use crate::work::PoolId;

    fn device() -> Arc<Device> {
        let set = DeviceSet::new();
        set.add_device(
            DeviceSpec::default(),
            DriverKind::Legacy(Arc::new(NullDriver)),
            95.0,
        )
    }

    fn work_with_tail(tail_byte: u8) -> Work {
        let mut w = Work::new(PoolId(0));
        w.data[64..76].fill(tail_byte);
        w.midstate = [tail_byte; 32];
        w
    }

    #[test]
    fn queued_count_tracks_map() {
        let dev = device();
        let w1 = work_with_tail(1);
        let w2 = work_with_tail(2);
        let id1 = w1.id;
        dev.add_queued(w1);
        dev.add_queued(w2);
        assert_eq!(dev.queued_count(), 2);
        assert!(dev.work_completed(id1));
        assert_eq!(dev.queued_count(), 1);
        assert!(!dev.work_completed(id1));
        assert_eq!(dev.queued_count(), 1);
    }

    #[test]
    fn unqueued_and_queued_are_disjoint() {
        let dev = device();
        dev.admit(work_with_tail(1));
        assert_eq!(dev.unqueued_len(), 1);
        assert_eq!(dev.queued_count(), 0);
        let w = dev.get_queued().unwrap();
        assert_eq!(dev.unqueued_len(), 0);
        dev.add_queued(w);
        assert_eq!(dev.queued_count(), 1);
        assert_eq!(dev.unqueued_len(), 0);
    }

    #[test]
    fn midstate_lookup_variants() {
        let dev = device();
        let w = work_with_tail(7);
        let midstate = w.midstate;
        let tail = [7u8; 12];
        dev.add_queued(w);

        assert!(dev.find_queued_work_bymidstate(&midstate, &tail).is_some());
        assert!(dev.find_queued_work_bymidstate(&[0u8; 32], &tail).is_none());

        let cloned = dev.clone_queued_work_bymidstate(&midstate, &tail).unwrap();
        assert_eq!(dev.queued_count(), 1, "clone must not consume");
        assert!(cloned.clone_of_staged);

        let taken = dev.take_queued_work_bymidstate(&midstate, &tail).unwrap();
        assert_eq!(dev.queued_count(), 0);
        assert_eq!(taken.midstate, midstate);
        assert!(dev.take_queued_work_bymidstate(&midstate, &tail).is_none());
    }

    #[test]
    fn invalidate_marks_queued_and_drops_unqueued() {
        let dev = device();
        let mut old = work_with_tail(1);
        old.block_id = 1;
        let mut fresh = work_with_tail(2);
        fresh.block_id = 2;
        dev.add_queued(old);
        dev.add_queued(fresh);
        let mut unstarted = work_with_tail(3);
        unstarted.block_id = 1;
        dev.admit(unstarted);

        let (marked, dropped) = dev.invalidate_matching(|w| w.block_id == 1);
        assert_eq!(marked, 1);
        assert_eq!(dropped, 1);
        // In-flight stays queued, only flagged.
        assert_eq!(dev.queued_count(), 2);
    }

    #[test]
    fn utility_follows_accepted_shares() {
        let dev = device();
        assert_eq!(dev.utility(), 0.0);
        dev.accepted.fetch_add(3, Ordering::Relaxed);
        assert!(dev.utility() > 0.0);
    }

    #[test]
    fn restart_signal_is_sticky() {
        let ts = ThreadShared::new(0, 0, 0);
        assert!(!ts.take_restart());
        ts.signal_restart();
        ts.signal_restart();
        assert!(ts.take_restart());
        assert!(!ts.take_restart());
    }
}
