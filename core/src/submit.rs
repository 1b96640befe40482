//! Nonce validation, share accounting, and the per-pool submitter.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;

use crate::error::CoreError;
use crate::minerloop::ThreadCtx;
use crate::pool::{getwork, Pool, ShareLog};
use crate::queue::Pop;
use crate::run::Core;
use crate::work::{stale_work, GetworkMode, NonceTest, StaleCtx, Work};

/// A solved share travelling from a miner thread to the pool submitter.
pub struct SubmitItem {
    pub work: Work,
    pub nonce: u32,
    pub attempts: u32,
    pub created: Instant,
}

pub(crate) fn stale_ctx(core: &Core, pool: &Pool) -> StaleCtx {
    StaleCtx {
        scantime: core.opts.scantime,
        expiry: core.opts.expiry,
        block_id: pool.block_id.load(Ordering::Relaxed),
        restart_id: pool.work_restart_id.load(Ordering::Relaxed),
        submit_old: pool.submit_old.load(Ordering::Relaxed),
    }
}

/// Validates a nonce reported by a device and routes it onward.
///
/// Returns true when the share was handed to the submitter. `High` results
/// are counted but never leave the process; `Bad` results are hardware
/// errors.
pub fn submit_nonce(core: &Arc<Core>, thr: Option<&ThreadCtx>, work: &Work, nonce: u32) -> bool {
    let Some(pool) = core.pools.get(work.pool) else {
        return false;
    };
    let mut share = work.clone();
    if let Some(thr) = thr {
        share.thr_id = Some(thr.shared.thr_id);
        share.device_id = Some(thr.device.id);
    }
    let min_target = pool.min_target();

    match share.test_nonce(nonce, true, &min_target) {
        NonceTest::Bad => {
            inc_hw_errors(core, thr, &share);
            false
        }
        NonceTest::High => {
            // Met the floor but not the share target; stale-but-no-submit.
            core.stats.stale.fetch_add(1, Ordering::Relaxed);
            pool.share_stale(share.nonce_diff);
            if let Some(thr) = thr {
                thr.device.stale_shares.fetch_add(1, Ordering::Relaxed);
            }
            false
        }
        NonceTest::Good => {
            share.tv_work_found = Some(Instant::now());
            share.mined = true;

            {
                let mut diffs = core.stats.diffs.lock();
                diffs.diff1 += share.nonce_diff;
            }
            pool.diffs.lock().diff1 += share.nonce_diff;
            if let Some(thr) = thr {
                thr.device.diffs.lock().diff1 += share.nonce_diff;
                thr.device.report_valid_work();
            }
            if core.stats.note_share_diff(share.share_diff) {
                debug!("new best share: {:.3}", share.share_diff);
            }
            {
                let mut pd = pool.diffs.lock();
                pd.last_share_diff = share.share_diff;
                if share.share_diff > pd.best_diff {
                    pd.best_diff = share.share_diff;
                }
            }

            if share.hash_beats_block_target() {
                share.block = true;
                pool.solved.fetch_add(1, Ordering::Relaxed);
                core.stats.found_blocks.fetch_add(1, Ordering::Relaxed);
                let device = thr.map(|t| t.device.name.as_str()).unwrap_or("miner");
                core.stats.block_found_line(device);
            }

            if core.opts.benchmark || share.getwork_mode == GetworkMode::Benchmark {
                // Benchmark shares are accounted as accepted locally.
                core.stats.accepted.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            if !pool.submit_q.push(SubmitItem {
                work: share,
                nonce,
                attempts: 0,
                created: Instant::now(),
            }) {
                pool.discarded_work.fetch_add(1, Ordering::Relaxed);
                core.stats.discarded.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            true
        }
    }
}

/// Hardware-error bookkeeping for a nonce below the pool floor.
pub fn inc_hw_errors(core: &Arc<Core>, thr: Option<&ThreadCtx>, work: &Work) {
    core.stats.hw_errors.fetch_add(1, Ordering::Relaxed);
    core.stats.diffs.lock().bad_diff1 += work.nonce_diff;
    if let Some(thr) = thr {
        thr.device.hw_errors.fetch_add(1, Ordering::Relaxed);
        thr.device.diffs.lock().bad_diff1 += work.nonce_diff;
    }
}

/// Per-pool submitter thread: drains the pool's submit queue and talks the
/// pool's native submit protocol.
pub fn submitter_loop(core: Arc<Core>, pool: Arc<Pool>) {
    debug!("pool {} submitter running", pool.id.0);
    loop {
        match pool.submit_q.pop(Some(Duration::from_millis(500))) {
            Pop::Terminated => break,
            Pop::Timeout => {
                if core.is_shutdown() {
                    break;
                }
            }
            Pop::Item(item) => submit_one(&core, &pool, item),
        }
    }
    debug!("pool {} submitter exiting", pool.id.0);
}

fn submit_one(core: &Arc<Core>, pool: &Arc<Pool>, mut item: SubmitItem) {
    // One network submit per share, ever.
    let key = ShareLog::key_for(&item.work, item.nonce);
    if item.attempts == 0 && !pool.share_log.lock().record(key) {
        debug!("pool {} duplicate share suppressed", pool.id.0);
        return;
    }

    let ctx = stale_ctx(core, pool);
    let mut is_stale = item.work.stale || stale_work(&item.work, true, &ctx);
    if item.work.stratum && !ctx.submit_old {
        // A clean job replacement orphans everything mined on older jobs.
        let current_job = pool.swork.read().job_id.clone();
        if !current_job.is_empty() && current_job != item.work.job_id {
            is_stale = true;
        }
    }
    if is_stale && !ctx.submit_old {
        count_stale(core, pool, &item.work, "stale share discarded");
        return;
    }

    let result = send_share(core, pool, &item);
    match result {
        Ok((true, _)) => {
            core.stats.accepted.fetch_add(1, Ordering::Relaxed);
            pool.share_accepted(item.work.nonce_diff);
            let device = device_name(core, &item.work);
            if let Some(dev_id) = item.work.device_id {
                if let Some(dev) = core.devices.get(dev_id) {
                    dev.accepted.fetch_add(1, Ordering::Relaxed);
                    dev.diffs.lock().diff_accepted += item.work.nonce_diff;
                }
            }
            core.stats
                .share_accepted_line(&device, item.work.share_diff, &pool.url);
        }
        Ok((false, reason)) => {
            let reason = reason.unwrap_or_else(|| "rejected".into());
            core.stats.rejected.fetch_add(1, Ordering::Relaxed);
            pool.share_rejected(item.work.nonce_diff);
            let device = device_name(core, &item.work);
            if let Some(dev_id) = item.work.device_id {
                if let Some(dev) = core.devices.get(dev_id) {
                    dev.rejected.fetch_add(1, Ordering::Relaxed);
                    dev.diffs.lock().diff_rejected += item.work.nonce_diff;
                }
            }
            core.stats.share_rejected_line(&device, &reason, &pool.url);
        }
        Err(e) => {
            pool.remotefail_occasions.fetch_add(1, Ordering::Relaxed);
            if item.created.elapsed() > core.opts.expiry {
                count_stale(core, pool, &item.work, "share expired during retries");
                return;
            }
            item.attempts += 1;
            // Jittered exponential pause, then back onto the queue.
            let base = Duration::from_secs(1u64 << item.attempts.min(5));
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            let pause = base.mul_f64(jitter).min(core.opts.expiry);
            warn!(
                "pool {} share submit failed ({}), retry {} in {:.1}s",
                pool.id.0,
                e,
                item.attempts,
                pause.as_secs_f64()
            );
            std::thread::sleep(pause);
            if !pool.submit_q.push(item) {
                debug!("pool {} submit queue frozen, share dropped", pool.id.0);
            }
        }
    }
}

fn count_stale(core: &Arc<Core>, pool: &Arc<Pool>, work: &Work, why: &str) {
    core.stats.stale.fetch_add(1, Ordering::Relaxed);
    pool.share_stale(work.nonce_diff);
    if let Some(dev_id) = work.device_id {
        if let Some(dev) = core.devices.get(dev_id) {
            dev.stale_shares.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("pool {} {}", pool.id.0, why);
}

fn device_name(core: &Arc<Core>, work: &Work) -> String {
    work.device_id
        .and_then(|id| core.devices.get(id))
        .map(|d| format!("{} {}", d.name, d.id))
        .unwrap_or_else(|| "miner".into())
}

fn send_share(
    core: &Arc<Core>,
    pool: &Arc<Pool>,
    item: &SubmitItem,
) -> crate::error::Result<(bool, Option<String>)> {
    let work = &item.work;
    if work.stratum {
        let client = pool
            .stratum
            .lock()
            .clone()
            .ok_or_else(|| CoreError::Transient("stratum not connected".into()))?;
        if !client.is_connected() {
            return Err(CoreError::Transient("stratum socket down".into()));
        }
        let nonce2_hex = hex::encode(&work.nonce2);
        let ntime_hex = format!("{:08x}", work.ntime());
        let nonce_hex = format!("{:08x}", item.nonce);
        return core.rt.block_on(client.submit_share(
            &work.job_id,
            &nonce2_hex,
            &ntime_hex,
            &nonce_hex,
        ));
    }
    match work.getwork_mode {
        GetworkMode::Gbt => getwork::submit_gbt(pool, work),
        _ => getwork::submit_getwork(pool, work),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::pool::{PoolConfig, PoolSet};

    #[test]
    fn stale_ctx_reflects_pool_state() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = Core::new(Options::default(), rt.handle().clone());
        let pool = core.add_pool(PoolConfig {
            url: "stratum+tcp://p:1".into(),
            user: "u".into(),
            pass: "x".into(),
            prio: 0,
            quota: 1,
        });
        pool.block_id.store(9, Ordering::Relaxed);
        pool.bump_work_restart();
        pool.submit_old.store(true, Ordering::Relaxed);

        let ctx = stale_ctx(&core, &pool);
        assert_eq!(ctx.block_id, 9);
        assert_eq!(ctx.restart_id, 1);
        assert!(ctx.submit_old);
        assert_eq!(ctx.expiry, core.opts.expiry);
    }

    #[test]
    fn unknown_pool_refuses_submission() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = Core::new(Options::default(), rt.handle().clone());
        let work = Work::new(crate::work::PoolId(99));
        assert!(!submit_nonce(&core, None, &work, 1));
    }

    #[test]
    fn submit_drops_into_frozen_queue_as_discard() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let core = Core::new(Options::default(), rt.handle().clone());
        let pool = core.add_pool(PoolConfig {
            url: "stratum+tcp://p:1".into(),
            user: "u".into(),
            pass: "x".into(),
            prio: 0,
            quota: 1,
        });
        pool.submit_q.freeze();
        let mut work = Work::new(pool.id);
        work.target = [0xff; 32];
        assert!(!submit_nonce(&core, None, &work, 1));
        assert_eq!(core.stats.discarded.load(Ordering::Relaxed), 1);
    }
}
