//! Unit of mining input and the hash/target math around it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub type WorkId = u64;

/// Index into the append-only pool arena. Works carry this instead of a
/// pool reference so the object graph stays acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_work_id() -> WorkId {
    NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed)
}

/// SHA-256 initial state (FIPS 180-4).
pub const SHA256_INIT: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Difficulty-1 block target as a float (0xffff << 208).
pub const TRUEDIFFONE: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

/// Pool difficulty is quoted against a slightly easier target than block
/// difficulty.
pub const BDIFF_TO_PDIFF: f64 = 1.0000152587;

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Midstate after compressing the first 64 header bytes.
pub fn midstate(chunk: &[u8; 64]) -> [u8; 32] {
    let mut state = SHA256_INIT;
    let block = sha2::digest::generic_array::GenericArray::clone_from_slice(chunk);
    sha2::compress256(&mut state, &[block]);
    let mut out = [0u8; 32];
    for (i, word) in state.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Big-endian hash form used for all target comparisons: the double-SHA256
/// output reversed, so leading zero bytes mean high difficulty.
pub fn hash_to_be(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, b) in hash.iter().rev().enumerate() {
        out[i] = *b;
    }
    out
}

/// `hash ≤ target`, both big-endian 256-bit values.
pub fn hash_meets_target(hash_be: &[u8; 32], target: &[u8; 32]) -> bool {
    hash_be <= target
}

/// Serialize `truediffone / diff` as a 256-bit big-endian target.
pub fn target_from_bdiff(diff: f64) -> [u8; 32] {
    if diff <= 0.0 {
        return [0xff; 32];
    }
    let mut target = [0u8; 32];
    let mut v = TRUEDIFFONE / diff;
    for i in 0..32 {
        let scale = 2f64.powi((8 * (31 - i)) as i32);
        if v >= scale {
            let byte = (v / scale).min(255.0).floor();
            target[i] = byte as u8;
            v -= byte * scale;
        }
    }
    target
}

pub fn target_from_pdiff(diff: f64) -> [u8; 32] {
    target_from_bdiff(diff / BDIFF_TO_PDIFF)
}

/// Difficulty a big-endian hash (or target) corresponds to.
pub fn bdiff_from_be(value: &[u8; 32]) -> f64 {
    let mut v = 0f64;
    for &b in value {
        v = v * 256.0 + b as f64;
    }
    if v == 0.0 {
        f64::INFINITY
    } else {
        TRUEDIFFONE / v
    }
}

/// Expands compact difficulty bits (exponent + 3 mantissa bytes) into a
/// full 256-bit big-endian target.
pub fn target_from_compact(bits: &[u8; 4]) -> [u8; 32] {
    let exp = bits[0] as usize;
    let mantissa = [bits[1], bits[2], bits[3]];
    let mut target = [0u8; 32];
    if exp == 0 {
        return target;
    }
    for (i, m) in mantissa.iter().enumerate() {
        // Most significant mantissa byte sits at 32 - exp.
        let pos = 32usize.wrapping_sub(exp).wrapping_add(i);
        if pos < 32 {
            target[pos] = *m;
        }
    }
    target
}

/// Folds a coinbase hash through a merkle branch; the running hash is
/// always the left operand, as for a transaction at index zero.
pub fn merkle_root_from_branch(coinbase_hash: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    let mut root = coinbase_hash;
    let mut buf = [0u8; 64];
    for sibling in branch {
        buf[..32].copy_from_slice(&root);
        buf[32..].copy_from_slice(sibling);
        root = sha256d(&buf);
    }
    root
}

/// Merkle branch proving the coinbase slot against a transaction list
/// (coinbase excluded). Inverse companion of [`merkle_root_from_branch`].
pub fn merkle_branch_for_coinbase(tx_hashes: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branch = Vec::new();
    // Index 0 is the coinbase chain, concrete values elsewhere.
    let mut level: Vec<Option<[u8; 32]>> = std::iter::once(None)
        .chain(tx_hashes.iter().copied().map(Some))
        .collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap_or(&None);
            level.push(last);
        }
        if let Some(sibling) = level[1] {
            branch.push(sibling);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(match (pair[0], pair[1]) {
                (Some(a), Some(b)) => {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&a);
                    buf[32..].copy_from_slice(&b);
                    Some(sha256d(&buf))
                }
                // The coinbase chain propagates as the unknown slot.
                _ => None,
            });
        }
        level = next;
    }
    branch
}

/// Opaque per-work driver payload; drivers downcast via `as_any`.
pub trait DeviceWorkData: Send + Sync {
    fn clone_box(&self) -> Box<dyn DeviceWorkData>;
    fn as_any(&self) -> &dyn std::any::Any;
}

impl Clone for Box<dyn DeviceWorkData> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Where a work came from; tags statistics and submit formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetworkMode {
    Pool,
    Longpoll,
    Stratum,
    Gbt,
    Benchmark,
}

/// Block template shared by every work derived from it. The `Arc` replaces
/// the manual template refcount: the template is released when the last
/// derived work drops.
#[derive(Debug, Clone)]
pub struct Template {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub bits: [u8; 4],
    pub curtime: u32,
    pub height: u64,
    pub coinbase: Vec<u8>,
    pub nonce2_offset: usize,
    pub nonce2_size: usize,
    pub merkle_branch: Vec<[u8; 32]>,
    /// Raw transaction hex, in template order, for block submission.
    pub tx_data: Vec<String>,
    pub target: [u8; 32],
    pub longpoll_id: Option<String>,
    pub submit_old: bool,
    pub fetched: Instant,
}

#[derive(Clone)]
pub struct Work {
    pub id: WorkId,
    /// 80-byte header followed by SHA-256 padding for an 80-byte message.
    pub data: [u8; 128],
    pub midstate: [u8; 32],
    /// Share target this work is mined against (big-endian).
    pub target: [u8; 32],
    /// Best hash seen for this work, big-endian.
    pub hash: [u8; 32],
    pub share_diff: f64,
    /// Difficulty credited per valid nonce.
    pub nonce_diff: f64,
    pub work_difficulty: f64,

    pub rolls: u32,
    /// Device ceiling on ntime rolling.
    pub drv_rolllimit: u32,
    /// Seconds of rolling the server allows; zero means not rollable.
    pub rolltime: u32,

    pub nonce: u32,
    pub pool: PoolId,
    pub thr_id: Option<usize>,
    pub device_id: Option<usize>,

    pub tv_staged: Option<Instant>,
    pub tv_getwork: Option<Instant>,
    pub tv_getwork_reply: Option<Instant>,
    pub tv_cloned: Option<Instant>,
    pub tv_work_start: Option<Instant>,
    pub tv_work_found: Option<Instant>,

    pub mined: bool,
    pub clone_of_staged: bool,
    pub cloned: bool,
    pub longpoll: bool,
    pub stale: bool,
    pub mandatory: bool,
    pub block: bool,

    pub stratum: bool,
    pub job_id: String,
    pub nonce1: String,
    pub nonce2: Vec<u8>,

    /// Pool block/restart generation this work was built against.
    pub block_id: u32,
    pub restart_id: u32,

    pub getwork_mode: GetworkMode,
    pub tmpl: Option<Arc<Template>>,
    pub device_data: Option<Box<dyn DeviceWorkData>>,
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("job_id", &self.job_id)
            .field("rolls", &self.rolls)
            .field("stale", &self.stale)
            .field("stratum", &self.stratum)
            .finish()
    }
}

impl Work {
    pub fn new(pool: PoolId) -> Self {
        Self {
            id: next_work_id(),
            data: [0u8; 128],
            midstate: [0u8; 32],
            target: [0xff; 32],
            hash: [0xff; 32],
            share_diff: 0.0,
            nonce_diff: 1.0,
            work_difficulty: 1.0,
            rolls: 0,
            drv_rolllimit: 0,
            rolltime: 0,
            nonce: 0,
            pool,
            thr_id: None,
            device_id: None,
            tv_staged: None,
            tv_getwork: None,
            tv_getwork_reply: None,
            tv_cloned: None,
            tv_work_start: None,
            tv_work_found: None,
            mined: false,
            clone_of_staged: false,
            cloned: false,
            longpoll: false,
            stale: false,
            mandatory: false,
            block: false,
            stratum: false,
            job_id: String::new(),
            nonce1: String::new(),
            nonce2: Vec::new(),
            block_id: 0,
            restart_id: 0,
            getwork_mode: GetworkMode::Pool,
            tmpl: None,
            device_data: None,
        }
    }

    /// Deterministic poolless work for `--benchmark` smoke runs.
    pub fn benchmark() -> Self {
        let mut work = Work::new(PoolId(0));
        for (i, b) in work.data[..76].iter_mut().enumerate() {
            *b = i as u8;
        }
        work.finalize_header();
        work.recompute_midstate();
        work.target = target_from_pdiff(1.0);
        work.mandatory = true;
        work.getwork_mode = GetworkMode::Benchmark;
        work
    }

    /// Write the SHA-256 padding for the 80-byte header into bytes 80..128.
    pub fn finalize_header(&mut self) {
        self.data[80] = 0x80;
        for b in &mut self.data[81..120] {
            *b = 0;
        }
        // 80 bytes = 640 bits, big-endian in the trailing length field.
        self.data[120..128].copy_from_slice(&640u64.to_be_bytes());
    }

    pub fn recompute_midstate(&mut self) {
        let mut chunk = [0u8; 64];
        chunk.copy_from_slice(&self.data[..64]);
        self.midstate = midstate(&chunk);
    }

    pub fn ntime(&self) -> u32 {
        u32::from_be_bytes([self.data[68], self.data[69], self.data[70], self.data[71]])
    }

    pub fn set_ntime(&mut self, ntime: u32) {
        self.data[68..72].copy_from_slice(&ntime.to_be_bytes());
    }

    /// First data word of the previous-block hash, used to detect block
    /// changes cheaply.
    pub fn block_id_from_prev_hash(prev_hash: &[u8; 32]) -> u32 {
        u32::from_be_bytes([prev_hash[0], prev_hash[1], prev_hash[2], prev_hash[3]])
    }

    pub fn can_roll(&self) -> bool {
        self.rolltime > 0 && self.rolls < self.drv_rolllimit && !self.stale
    }

    /// Clone with ntime advanced by one second. Template sharing is an Arc
    /// bump; the copy gets a fresh identity and a clean nonce space.
    pub fn roll(&self) -> Work {
        let mut rolled = self.clone();
        rolled.id = next_work_id();
        rolled.set_ntime(self.ntime() + 1);
        rolled.rolls += 1;
        rolled.cloned = true;
        rolled.clone_of_staged = true;
        rolled.tv_cloned = Some(Instant::now());
        rolled.nonce = 0;
        rolled.mined = false;
        rolled.recompute_midstate();
        rolled
    }

    /// Plain copy under a fresh work id; used when a staged work is handed
    /// to more than one consumer.
    pub fn copy(&self) -> Work {
        let mut copy = self.clone();
        copy.id = next_work_id();
        copy.clone_of_staged = true;
        copy.tv_cloned = Some(Instant::now());
        copy
    }

    pub fn test_nonce(&mut self, nonce: u32, check_target: bool, min_target: &[u8; 32]) -> NonceTest {
        self.data[76..80].copy_from_slice(&nonce.to_le_bytes());
        self.nonce = nonce;
        let hash_be = hash_to_be(&sha256d(&self.data[..80]));
        self.hash = hash_be;
        self.share_diff = bdiff_from_be(&hash_be) * BDIFF_TO_PDIFF;

        if !check_target {
            return if hash_meets_target(&hash_be, min_target) {
                NonceTest::Good
            } else {
                NonceTest::High
            };
        }
        if hash_meets_target(&hash_be, &self.target) {
            NonceTest::Good
        } else if hash_meets_target(&hash_be, min_target) {
            NonceTest::High
        } else {
            NonceTest::Bad
        }
    }

    /// Network block target: the template's when present, otherwise
    /// expanded from the header's difficulty bits.
    pub fn block_target(&self) -> [u8; 32] {
        if let Some(tmpl) = &self.tmpl {
            return tmpl.target;
        }
        let mut bits = [0u8; 4];
        bits.copy_from_slice(&self.data[72..76]);
        target_from_compact(&bits)
    }

    /// Whether the best hash also beats the network block target.
    pub fn hash_beats_block_target(&self) -> bool {
        let target = self.block_target();
        target != [0u8; 32] && hash_meets_target(&self.hash, &target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTest {
    /// Meets the work target; submit it.
    Good,
    /// Valid hash, short of the target; counted, never submitted.
    High,
    /// Below even the pool floor; a hardware error.
    Bad,
}

/// Pool-side view needed to judge staleness without holding a pool lock.
#[derive(Debug, Clone, Copy)]
pub struct StaleCtx {
    pub scantime: Duration,
    pub expiry: Duration,
    pub block_id: u32,
    pub restart_id: u32,
    pub submit_old: bool,
}

/// Is `work` stale at instant `at`? Shares survive a work restart but not
/// a block change (unless the pool accepts old shares); unstarted work goes
/// stale on either.
pub fn stale_work_at(work: &Work, share: bool, at: Instant, ctx: &StaleCtx) -> bool {
    if work.mandatory {
        return false;
    }
    if work.block_id != ctx.block_id {
        return !(share && ctx.submit_old);
    }
    if !share && work.restart_id != ctx.restart_id {
        return true;
    }
    let limit = if share { ctx.expiry } else { ctx.scantime };
    let base = match work.tv_staged {
        Some(t) => t,
        None => return false,
    };
    at.checked_duration_since(base)
        .map_or(false, |age| age > limit)
}

pub fn stale_work(work: &Work, share: bool, ctx: &StaleCtx) -> bool {
    stale_work_at(work, share, Instant::now(), ctx)
}

/// Predicts staleness `ahead` from now; rolling uses this to stop extending
/// work that will die before the device finishes it.
pub fn stale_work_future(work: &Work, share: bool, ahead: Duration, ctx: &StaleCtx) -> bool {
    stale_work_at(work, share, Instant::now() + ahead, ctx)
}
