//! Global counters and the hashmeter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use colored::Colorize;
use log::info;
use parking_lot::Mutex;

use crate::run::Core;

/// Exponentially decayed hashrate estimate.
///
/// Stores no sample history: each hashmeter tick folds its measured rate
/// into the running estimate, with old data fading on a time constant of
/// `horizon` seconds. A burst therefore dominates the short meter while
/// barely denting the fifteen-minute one.
struct DecayedRate {
    horizon: f64,
    estimate: f64,
    primed: bool,
}

impl DecayedRate {
    fn new(horizon_secs: u64) -> Self {
        Self {
            horizon: horizon_secs.max(1) as f64,
            estimate: 0.0,
            primed: false,
        }
    }

    /// Folds in `hashes` done over `elapsed`.
    fn sample(&mut self, hashes: u64, elapsed: Duration) {
        let dt = elapsed.as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        let measured = hashes as f64 / dt;
        if !self.primed {
            // Seed with the first measurement instead of ramping from zero.
            self.estimate = measured;
            self.primed = true;
            return;
        }
        let fade = 1.0 - (-dt / self.horizon).exp();
        self.estimate += (measured - self.estimate) * fade;
    }

    fn rate(&self) -> f64 {
        if self.primed {
            self.estimate
        } else {
            0.0
        }
    }
}

#[derive(Default)]
pub struct GlobalDiffs {
    pub diff1: f64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub bad_diff1: f64,
    pub best_share: f64,
}

struct Windows {
    w10s: DecayedRate,
    w60s: DecayedRate,
    w15m: DecayedRate,
    last_tick: Option<Instant>,
}

pub struct Stats {
    pub start: Instant,
    pub total_hashes: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub stale: AtomicU64,
    pub discarded: AtomicU64,
    pub hw_errors: AtomicU64,
    pub getworks: AtomicU64,
    pub local_work: AtomicU64,
    pub found_blocks: AtomicU64,
    pub new_blocks: AtomicU64,
    pub diffs: Mutex<GlobalDiffs>,
    windows: Mutex<Windows>,
    pub block_time: Mutex<Option<Instant>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total_hashes: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            hw_errors: AtomicU64::new(0),
            getworks: AtomicU64::new(0),
            local_work: AtomicU64::new(0),
            found_blocks: AtomicU64::new(0),
            new_blocks: AtomicU64::new(0),
            diffs: Mutex::new(GlobalDiffs::default()),
            windows: Mutex::new(Windows {
                w10s: DecayedRate::new(10),
                w60s: DecayedRate::new(60),
                w15m: DecayedRate::new(900),
                last_tick: None,
            }),
            block_time: Mutex::new(None),
        }
    }

    /// Updates the best-share high-water mark; true when it moved.
    pub fn note_share_diff(&self, diff: f64) -> bool {
        let mut d = self.diffs.lock();
        if diff > d.best_share {
            d.best_share = diff;
            return true;
        }
        false
    }

    pub fn share_accepted_line(&self, device: &str, share_diff: f64, pool_url: &str) {
        let n = self.accepted.load(Ordering::Relaxed);
        info!(
            "{} {} diff {:.3} from {} ({} total)",
            "accepted:".green().bold(),
            device,
            share_diff,
            pool_url,
            n
        );
    }

    pub fn share_rejected_line(&self, device: &str, reason: &str, pool_url: &str) {
        let n = self.rejected.load(Ordering::Relaxed);
        info!(
            "{} {} {} from {} ({} total)",
            "rejected:".red().bold(),
            device,
            reason,
            pool_url,
            n
        );
    }

    pub fn block_found_line(&self, device: &str) {
        info!(
            "{} solved a block! {} found so far",
            device,
            self.found_blocks.load(Ordering::Relaxed)
        );
    }

    fn tick(&self, hashes: u64) -> (f64, f64, f64) {
        let now = Instant::now();
        let mut w = self.windows.lock();
        if let Some(last) = w.last_tick {
            let elapsed = now.saturating_duration_since(last);
            w.w10s.sample(hashes, elapsed);
            w.w60s.sample(hashes, elapsed);
            w.w15m.sample(hashes, elapsed);
        }
        w.last_tick = Some(now);
        (w.w10s.rate(), w.w60s.rate(), w.w15m.rate())
    }

    /// Forgets the best share seen so far.
    pub fn zero_best_share(&self) {
        self.diffs.lock().best_share = 0.0;
    }

    /// Resets every counter, as if the session just started.
    pub fn zero_stats(&self) {
        for counter in [
            &self.total_hashes,
            &self.accepted,
            &self.rejected,
            &self.stale,
            &self.discarded,
            &self.hw_errors,
            &self.getworks,
            &self.local_work,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.diffs.lock() = GlobalDiffs::default();
    }

    pub fn summary(&self) -> String {
        let secs = self.start.elapsed().as_secs_f64();
        let hashes = self.total_hashes.load(Ordering::Relaxed);
        format!(
            "runtime {:.0}s hashes {} avg {} A:{} R:{} S:{} HW:{} blocks {}",
            secs,
            hashes,
            format_rate(hashes as f64 / secs.max(1.0)),
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.stale.load(Ordering::Relaxed),
            self.hw_errors.load(Ordering::Relaxed),
            self.found_blocks.load(Ordering::Relaxed),
        )
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_rate(rate: f64) -> String {
    if rate >= 1e9 {
        format!("{:.2} GH/s", rate / 1e9)
    } else if rate >= 1e6 {
        format!("{:.2} MH/s", rate / 1e6)
    } else if rate >= 1e3 {
        format!("{:.2} kH/s", rate / 1e3)
    } else {
        format!("{:.2} H/s", rate)
    }
}

/// Hashmeter thread: drains per-thread counters every log interval,
/// refreshes device rolling averages, and prints the rate line.
pub fn hashmeter_loop(core: Arc<Core>) {
    let interval = core.opts.log_interval;
    let mut per_device: Vec<u64> = Vec::new();
    while !core.is_shutdown() {
        std::thread::sleep(interval);
        let threads = core.devices.threads();
        per_device.clear();
        per_device.resize(core.devices.count(), 0);
        let mut total = 0u64;
        for thr in &threads {
            let n = thr.hashes_done.swap(0, Ordering::Relaxed);
            total += n;
            if let Some(slot) = per_device.get_mut(thr.device_id) {
                *slot += n;
            }
        }
        core.stats.total_hashes.fetch_add(total, Ordering::Relaxed);

        let secs = interval.as_secs_f64().max(0.001);
        for (dev_id, hashes) in per_device.iter().enumerate() {
            if let Some(dev) = core.devices.get(dev_id) {
                dev.total_hashes.fetch_add(*hashes, Ordering::Relaxed);
                let rate = *hashes as f64 / secs;
                let mut rolling = dev.rolling.lock();
                // Exponentially decayed device average.
                *rolling = *rolling * 0.63 + rate * 0.37;
            }
        }

        let (r10, r60, r15m) = core.stats.tick(total);
        info!(
            "[{}] speed 10s/60s/15m {} {} {} | A:{} R:{} HW:{}",
            Utc::now().format("%H:%M:%S"),
            format_rate(r10),
            format_rate(r60),
            format_rate(r15m),
            core.stats.accepted.load(Ordering::Relaxed),
            core.stats.rejected.load(Ordering::Relaxed),
            core.stats.hw_errors.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_share_moves_monotonically() {
        let stats = Stats::new();
        assert!(stats.note_share_diff(2.0));
        assert!(!stats.note_share_diff(1.0));
        assert!(stats.note_share_diff(5.0));
        assert_eq!(stats.diffs.lock().best_share, 5.0);

        stats.zero_best_share();
        assert!(stats.note_share_diff(1.0));
    }

    #[test]
    fn zero_stats_wipes_counters() {
        let stats = Stats::new();
        stats.accepted.fetch_add(3, Ordering::Relaxed);
        stats.total_hashes.fetch_add(100, Ordering::Relaxed);
        stats.diffs.lock().diff1 = 9.0;
        stats.zero_stats();
        assert_eq!(stats.accepted.load(Ordering::Relaxed), 0);
        assert_eq!(stats.total_hashes.load(Ordering::Relaxed), 0);
        assert_eq!(stats.diffs.lock().diff1, 0.0);
    }

    #[test]
    fn rate_formatting() {
        assert_eq!(format_rate(12.0), "12.00 H/s");
        assert_eq!(format_rate(2_500.0), "2.50 kH/s");
        assert_eq!(format_rate(3_000_000.0), "3.00 MH/s");
        assert_eq!(format_rate(4_200_000_000.0), "4.20 GH/s");
    }

    #[test]
    fn decayed_rate_settles_on_constant_input() {
        let mut meter = DecayedRate::new(10);
        assert_eq!(meter.rate(), 0.0);
        for _ in 0..5 {
            meter.sample(1000, Duration::from_secs(1));
        }
        assert!((meter.rate() - 1000.0).abs() < 1e-6, "rate {}", meter.rate());
    }

    #[test]
    fn short_horizon_reacts_faster_than_long() {
        let mut short = DecayedRate::new(10);
        let mut long = DecayedRate::new(900);
        for _ in 0..3 {
            short.sample(1000, Duration::from_secs(1));
            long.sample(1000, Duration::from_secs(1));
        }
        // The rate quintuples; the 10s meter should chase it, the 15m
        // meter should barely move.
        for _ in 0..3 {
            short.sample(5000, Duration::from_secs(1));
            long.sample(5000, Duration::from_secs(1));
        }
        assert!(short.rate() > 1800.0, "short {}", short.rate());
        assert!(long.rate() < 1100.0, "long {}", long.rate());
        assert!(short.rate() > long.rate());
    }

    #[test]
    fn zero_elapsed_samples_are_ignored() {
        let mut meter = DecayedRate::new(10);
        meter.sample(1000, Duration::from_secs(1));
        meter.sample(u64::MAX, Duration::ZERO);
        assert!((meter.rate() - 1000.0).abs() < 1e-6);
    }
}
