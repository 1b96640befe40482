//! Upstream pools: state, health, and multiplexing strategies.

pub mod getwork;
pub mod messages;
pub mod ring;
pub mod strategy;
pub mod stratum;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::device::DeviceSet;
use crate::options::Options;
use crate::queue::ThreadQueue;
use crate::staging::StagingQueue;
use crate::submit::SubmitItem;
use crate::sync::WriteBiasedLock;
use crate::work::{target_from_pdiff, PoolId, Work};

use self::ring::ClientRing;
use self::strategy::{quota_gcd, Strategy};

/// Consecutive getwork failures before a pool is marked idle.
pub const GETFAIL_THRESHOLD: u32 = 5;
/// Consecutive rejects (with zero accepts) before a pool is quarantined.
pub const SEQ_REJECT_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEnable {
    Disabled,
    Enabled,
    /// Every share bounced; needs a successful probe before reuse.
    Rejecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolProtocol {
    None,
    Getwork,
    Gbt,
}

/// Stratum-mutable state; every field lives under the pool's data lock.
#[derive(Debug)]
pub struct StratumWork {
    pub job_id: String,
    pub clean: bool,
    pub coinbase: Vec<u8>,
    pub nonce2_offset: usize,
    pub merkle_branch: Vec<[u8; 32]>,
    /// Version plus previous block hash, the fixed 36-byte header prefix.
    pub header1: [u8; 36],
    pub diffbits: [u8; 4],
    pub ntime: u32,
    pub tv_received: Option<Instant>,
    /// Share target derived from `mining.set_difficulty`.
    pub target: [u8; 32],
    pub transparency_probed: bool,

    pub nonce1: String,
    pub nonce2: u64,
    pub nonce2_size: usize,
    pub sessionid: Option<String>,
}

impl Default for StratumWork {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            clean: false,
            coinbase: Vec::new(),
            nonce2_offset: 0,
            merkle_branch: Vec::new(),
            header1: [0u8; 36],
            diffbits: [0u8; 4],
            ntime: 0,
            tv_received: None,
            target: target_from_pdiff(1.0),
            transparency_probed: false,
            nonce1: String::new(),
            nonce2: 0,
            nonce2_size: 4,
            sessionid: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolDiffs {
    pub diff1: f64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub last_share_diff: f64,
    pub best_diff: f64,
}

/// Minimum share difficulty the pool accepts, with the matching target.
#[derive(Debug, Clone)]
pub struct MinDiff {
    pub diff: f64,
    pub target: [u8; 32],
}

impl Default for MinDiff {
    fn default() -> Self {
        Self {
            diff: 1.0,
            target: target_from_pdiff(1.0),
        }
    }
}

/// Duplicate-share guard: one network submit per (job, nonce2, ntime,
/// nonce) tuple, bounded memory.
pub struct ShareLog {
    seen: std::collections::HashSet<ShareKey>,
    order: std::collections::VecDeque<ShareKey>,
    cap: usize,
}

pub type ShareKey = ([u8; 32], String, Vec<u8>, u32, u32);

impl ShareLog {
    fn new(cap: usize) -> Self {
        Self {
            seen: Default::default(),
            order: Default::default(),
            cap,
        }
    }

    pub fn key_for(work: &Work, nonce: u32) -> ShareKey {
        (
            work.midstate,
            work.job_id.clone(),
            work.nonce2.clone(),
            work.ntime(),
            nonce,
        )
    }

    /// False when this share was already sent.
    pub fn record(&mut self, key: ShareKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

pub struct PoolConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub prio: usize,
    pub quota: u64,
}

pub struct Pool {
    pub id: PoolId,
    pub url: String,
    pub user: String,
    pub pass: String,
    pub prio: AtomicUsize,
    pub quota: AtomicU64,
    pub quota_used: AtomicU64,

    pub enabled: Mutex<PoolEnable>,
    pub idle: AtomicBool,
    pub lagging: AtomicBool,
    pub probed: AtomicBool,
    pub removed: AtomicBool,
    pub submit_old: AtomicBool,
    pub proto: Mutex<PoolProtocol>,
    pub lp_url: Mutex<Option<String>>,

    pub has_stratum: AtomicBool,
    pub stratum_active: AtomicBool,
    pub stratum: Mutex<Option<stratum::StratumClient>>,

    /// Bumped whenever staged work from this pool must be thrown away.
    pub work_restart_id: AtomicU32,
    /// Prefix of the previous-block hash the current work builds on.
    pub block_id: AtomicU32,

    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub solved: AtomicU64,
    pub stale_shares: AtomicU64,
    pub discarded_work: AtomicU64,
    pub getwork_requested: AtomicU64,
    pub works_generated: AtomicU64,
    pub seq_rejects: AtomicU32,
    pub seq_getfails: AtomicU32,
    pub getfail_occasions: AtomicU64,
    pub remotefail_occasions: AtomicU64,

    pub diffs: Mutex<PoolDiffs>,
    pub min_diff: Mutex<MinDiff>,

    pub swork: WriteBiasedLock<StratumWork>,
    pub submit_q: ThreadQueue<SubmitItem>,
    /// Long-poll results waiting for the generator.
    pub getwork_q: ThreadQueue<Work>,
    pub ring: ClientRing,
    pub share_log: Mutex<ShareLog>,
    pub last_work: Mutex<Option<Work>>,

    pub last_work_time: Mutex<Option<Instant>>,
    pub last_share_time: Mutex<Option<Instant>>,
    pub tv_idle: Mutex<Option<Instant>>,
    pub admin_msg: Mutex<Option<String>>,
    pub started: Instant,
}

impl Pool {
    pub fn new(id: PoolId, cfg: PoolConfig, ring_capacity: usize) -> Self {
        let has_stratum = cfg.url.starts_with("stratum+tcp://");
        Self {
            id,
            url: cfg.url,
            user: cfg.user,
            pass: cfg.pass,
            prio: AtomicUsize::new(cfg.prio),
            quota: AtomicU64::new(cfg.quota.max(1)),
            quota_used: AtomicU64::new(0),
            enabled: Mutex::new(PoolEnable::Enabled),
            idle: AtomicBool::new(true),
            lagging: AtomicBool::new(false),
            probed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            submit_old: AtomicBool::new(false),
            proto: Mutex::new(if has_stratum {
                PoolProtocol::None
            } else {
                PoolProtocol::Getwork
            }),
            lp_url: Mutex::new(None),
            has_stratum: AtomicBool::new(has_stratum),
            stratum_active: AtomicBool::new(false),
            stratum: Mutex::new(None),
            work_restart_id: AtomicU32::new(0),
            block_id: AtomicU32::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            solved: AtomicU64::new(0),
            stale_shares: AtomicU64::new(0),
            discarded_work: AtomicU64::new(0),
            getwork_requested: AtomicU64::new(0),
            works_generated: AtomicU64::new(0),
            seq_rejects: AtomicU32::new(0),
            seq_getfails: AtomicU32::new(0),
            getfail_occasions: AtomicU64::new(0),
            remotefail_occasions: AtomicU64::new(0),
            diffs: Mutex::new(PoolDiffs::default()),
            min_diff: Mutex::new(MinDiff::default()),
            swork: WriteBiasedLock::new(StratumWork::default()),
            submit_q: ThreadQueue::new(),
            getwork_q: ThreadQueue::new(),
            ring: ClientRing::new(ring_capacity),
            share_log: Mutex::new(ShareLog::new(4096)),
            last_work: Mutex::new(None),
            last_work_time: Mutex::new(None),
            last_share_time: Mutex::new(None),
            tv_idle: Mutex::new(Some(Instant::now())),
            admin_msg: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Stratum host:port, with the scheme stripped.
    pub fn stratum_host(&self) -> &str {
        self.url
            .strip_prefix("stratum+tcp://")
            .or_else(|| self.url.strip_prefix("tcp://"))
            .unwrap_or(&self.url)
    }

    pub fn enabled_state(&self) -> PoolEnable {
        *self.enabled.lock()
    }

    /// Usable by a strategy right now.
    pub fn is_alive(&self) -> bool {
        self.enabled_state() == PoolEnable::Enabled
            && !self.idle.load(Ordering::Relaxed)
            && !self.removed.load(Ordering::Relaxed)
    }

    pub fn set_min_diff(&self, diff: f64) {
        let mut md = self.min_diff.lock();
        md.diff = diff;
        md.target = target_from_pdiff(diff);
    }

    pub fn min_target(&self) -> [u8; 32] {
        self.min_diff.lock().target
    }

    /// A work source succeeded: clear failure streaks, revive the pool.
    pub fn work_succeeded(&self) -> bool {
        self.seq_getfails.store(0, Ordering::Relaxed);
        self.lagging.store(false, Ordering::Relaxed);
        self.probed.store(true, Ordering::Relaxed);
        *self.last_work_time.lock() = Some(Instant::now());
        let was_idle = self.idle.swap(false, Ordering::Relaxed);
        if was_idle {
            *self.tv_idle.lock() = None;
            info!("pool {} alive: {}", self.id.0, self.url);
        }
        was_idle
    }

    /// A work fetch failed; returns true when this crossed the idle
    /// threshold and the caller should consider switching pools.
    pub fn work_failed(&self) -> bool {
        let fails = self.seq_getfails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= GETFAIL_THRESHOLD && !self.idle.swap(true, Ordering::Relaxed) {
            self.getfail_occasions.fetch_add(1, Ordering::Relaxed);
            *self.tv_idle.lock() = Some(Instant::now());
            warn!(
                "pool {} not responding after {} failures, marking idle: {}",
                self.id.0, fails, self.url
            );
            return true;
        }
        false
    }

    pub fn share_accepted(&self, diff: f64) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.seq_rejects.store(0, Ordering::Relaxed);
        *self.last_share_time.lock() = Some(Instant::now());
        let mut d = self.diffs.lock();
        d.diff_accepted += diff;
        // An accept clears share-reject quarantine.
        let mut enabled = self.enabled.lock();
        if *enabled == PoolEnable::Rejecting {
            info!("pool {} accepting shares again", self.id.0);
            *enabled = PoolEnable::Enabled;
        }
    }

    /// Returns true when the pool just entered the Rejecting state.
    pub fn share_rejected(&self, diff: f64) -> bool {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let seq = self.seq_rejects.fetch_add(1, Ordering::Relaxed) + 1;
        self.diffs.lock().diff_rejected += diff;
        if seq >= SEQ_REJECT_THRESHOLD && self.accepted.load(Ordering::Relaxed) == 0 {
            let mut enabled = self.enabled.lock();
            if *enabled == PoolEnable::Enabled {
                warn!(
                    "pool {} rejected {} consecutive shares with none accepted, quarantining",
                    self.id.0, seq
                );
                *enabled = PoolEnable::Rejecting;
                return true;
            }
        }
        false
    }

    pub fn share_stale(&self, diff: f64) {
        self.stale_shares.fetch_add(1, Ordering::Relaxed);
        self.diffs.lock().diff_stale += diff;
    }

    /// Accepted shares per minute over the pool's lifetime.
    pub fn utility(&self) -> f64 {
        let mins = self.started.elapsed().as_secs_f64() / 60.0;
        if mins <= 0.0 {
            return 0.0;
        }
        self.accepted.load(Ordering::Relaxed) as f64 / mins
    }

    pub fn bump_work_restart(&self) -> u32 {
        self.work_restart_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct ControlState {
    current: usize,
    rr_cursor: usize,
    last_rotate: Instant,
}

/// Append-only pool arena plus the strategy state guarded by the control
/// lock.
pub struct PoolSet {
    pools: RwLock<Vec<Arc<Pool>>>,
    control: WriteBiasedLock<ControlState>,
    quota_gcd: AtomicU64,
    opts: Options,
}

impl PoolSet {
    pub fn new(opts: Options) -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            control: WriteBiasedLock::new(ControlState {
                current: 0,
                rr_cursor: 0,
                last_rotate: Instant::now(),
            }),
            quota_gcd: AtomicU64::new(1),
            opts,
        }
    }

    pub fn add_pool(&self, cfg: PoolConfig) -> Arc<Pool> {
        let mut pools = self.pools.write();
        let id = PoolId(pools.len());
        let pool = Arc::new(Pool::new(id, cfg, self.opts.client_ring_capacity));
        info!(
            "added pool {} prio {} quota {}: {}",
            id.0,
            pool.prio.load(Ordering::Relaxed),
            pool.quota.load(Ordering::Relaxed),
            pool.url
        );
        pools.push(Arc::clone(&pool));
        drop(pools);
        self.adjust_quota_gcd();
        pool
    }

    pub fn remove_pool(&self, id: PoolId) {
        if let Some(pool) = self.get(id) {
            pool.removed.store(true, Ordering::Relaxed);
            *pool.enabled.lock() = PoolEnable::Disabled;
            pool.submit_q.freeze();
            pool.getwork_q.freeze();
            info!("removed pool {}: {}", id.0, pool.url);
        }
        self.adjust_quota_gcd();
    }

    pub fn get(&self, id: PoolId) -> Option<Arc<Pool>> {
        self.pools.read().get(id.0).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Pool>> {
        self.pools.read().clone()
    }

    pub fn count(&self) -> usize {
        self.pools.read().len()
    }

    /// Moves a pool to a new failover priority, then re-validates.
    pub fn prioritize(&self, id: PoolId, prio: usize) {
        if let Some(pool) = self.get(id) {
            pool.prio.store(prio, Ordering::Relaxed);
        }
        self.validate_pool_priorities();
    }

    /// Ensures failover priorities are unique: duplicates are pushed down
    /// in registration order, the way a user would expect ties to break.
    pub fn validate_pool_priorities(&self) {
        let pools = self.pools.read().clone();
        let mut live: Vec<&Arc<Pool>> = pools
            .iter()
            .filter(|p| !p.removed.load(Ordering::Relaxed))
            .collect();
        live.sort_by_key(|p| (p.prio.load(Ordering::Relaxed), p.id.0));
        let mut prev: Option<usize> = None;
        for pool in live {
            let mut prio = pool.prio.load(Ordering::Relaxed);
            if let Some(prev) = prev {
                if prio <= prev {
                    prio = prev + 1;
                    warn!(
                        "pool {} priority clashed, moved to {}",
                        pool.id.0, prio
                    );
                    pool.prio.store(prio, Ordering::Relaxed);
                }
            }
            prev = Some(prio);
        }
    }

    /// Recompute the quota GCD; called whenever the enabled set changes.
    pub fn adjust_quota_gcd(&self) {
        let quotas: Vec<u64> = self
            .pools
            .read()
            .iter()
            .filter(|p| !p.removed.load(Ordering::Relaxed))
            .map(|p| p.quota.load(Ordering::Relaxed))
            .collect();
        self.quota_gcd.store(quota_gcd(quotas), Ordering::Relaxed);
    }

    pub fn current(&self) -> Option<Arc<Pool>> {
        let idx = self.control.read().current;
        self.get(PoolId(idx))
    }

    /// Lowest-prio alive pool; falls back to a quarantined pool (as a
    /// probe), and as a last resort to an idle-but-enabled pool so that a
    /// farm with every upstream down keeps retrying instead of stalling.
    fn failover_pick(&self, pools: &[Arc<Pool>]) -> Option<usize> {
        pools
            .iter()
            .filter(|p| p.is_alive())
            .min_by_key(|p| p.prio.load(Ordering::Relaxed))
            .map(|p| p.id.0)
            .or_else(|| {
                // Nothing healthy: a Rejecting pool gets re-probed rather
                // than stalling the farm.
                pools
                    .iter()
                    .filter(|p| {
                        !p.removed.load(Ordering::Relaxed)
                            && p.enabled_state() == PoolEnable::Rejecting
                            && !p.idle.load(Ordering::Relaxed)
                    })
                    .min_by_key(|p| p.prio.load(Ordering::Relaxed))
                    .map(|p| p.id.0)
            })
            .or_else(|| {
                pools
                    .iter()
                    .filter(|p| {
                        !p.removed.load(Ordering::Relaxed)
                            && p.enabled_state() == PoolEnable::Enabled
                    })
                    .min_by_key(|p| p.prio.load(Ordering::Relaxed))
                    .map(|p| p.id.0)
            })
    }

    /// Picks the pool the next generated work should come from and charges
    /// its quota. The current pool is updated as a side effect.
    pub fn select_for_work(&self) -> Option<Arc<Pool>> {
        let pools = self.pools.read().clone();
        if pools.is_empty() {
            return None;
        }
        let strategy = if self.opts.failover_only {
            Strategy::Failover
        } else {
            self.opts.strategy
        };

        let mut control = self.control.write();
        let pick = match strategy {
            Strategy::Failover => self.failover_pick(&pools),
            Strategy::Rotate => {
                if control.last_rotate.elapsed() >= self.opts.rotate_period {
                    control.last_rotate = Instant::now();
                    control.rr_cursor = control.rr_cursor.wrapping_add(1);
                }
                Self::nth_alive(&pools, control.rr_cursor)
            }
            Strategy::RoundRobin => {
                let cursor = control.rr_cursor;
                control.rr_cursor = control.rr_cursor.wrapping_add(1);
                Self::nth_alive(&pools, cursor)
            }
            Strategy::LoadBalance | Strategy::Balance => {
                let gcd = self.quota_gcd.load(Ordering::Relaxed).max(1);
                pools
                    .iter()
                    .filter(|p| p.is_alive())
                    .min_by(|a, b| {
                        let score = |p: &Arc<Pool>| {
                            let quota = if strategy == Strategy::Balance {
                                1
                            } else {
                                p.quota.load(Ordering::Relaxed).max(1)
                            };
                            let gcd = if strategy == Strategy::Balance { 1 } else { gcd };
                            p.quota_used.load(Ordering::Relaxed) as f64 * gcd as f64
                                / quota as f64
                        };
                        score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|p| p.id.0)
            }
        };
        let pick = pick.or_else(|| self.failover_pick(&pools))?;
        control.current = pick;
        drop(control);

        let pool = pools.get(pick).cloned()?;
        pool.quota_used.fetch_add(1, Ordering::Relaxed);
        Some(pool)
    }

    fn nth_alive(pools: &[Arc<Pool>], cursor: usize) -> Option<usize> {
        let alive: Vec<&Arc<Pool>> = pools.iter().filter(|p| p.is_alive()).collect();
        if alive.is_empty() {
            return None;
        }
        Some(alive[cursor % alive.len()].id.0)
    }

    /// Makes `selected` (or the strategy's pick) current. Under the control
    /// write lock: drains foreign work from staging and every device's
    /// unqueued list, then signals all workers to restart.
    pub fn switch_pools(
        &self,
        selected: Option<PoolId>,
        devices: &DeviceSet,
        staging: &StagingQueue,
    ) -> Option<Arc<Pool>> {
        let pools = self.pools.read().clone();
        let mut control = self.control.write();
        let target = selected
            .map(|p| p.0)
            .or_else(|| self.failover_pick(&pools))?;
        let previous = control.current;
        control.current = target;
        let new_pool = pools.get(target).cloned()?;
        if previous == target {
            return Some(new_pool);
        }
        info!(
            "switching from pool {} to pool {}: {}",
            previous, target, new_pool.url
        );

        let keep = new_pool.id;
        let discarded = staging.discard_matching(|w| w.pool != keep && !w.mandatory);
        if discarded > 0 {
            for w_pool in &pools {
                // Attribution is approximate across mixed staging; charge
                // the pool that lost the current slot.
                if w_pool.id.0 == previous {
                    w_pool
                        .discarded_work
                        .fetch_add(discarded as u64, Ordering::Relaxed);
                }
            }
        }
        devices.drain_unqueued_matching(|w| w.pool != keep);
        devices.signal_restart_all();
        drop(control);
        Some(new_pool)
    }
}
