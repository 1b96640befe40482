use std::time::Duration;

use crate::pool::strategy::Strategy;

/// Already-parsed runtime options the coordinator consumes.
///
/// The binary builds this from CLI flags and the TOML config; the library
/// never looks at argv or files itself.
#[derive(Debug, Clone)]
pub struct Options {
    pub strategy: Strategy,
    /// Pool rotation period for the Rotate strategy.
    pub rotate_period: Duration,
    /// Target number of works kept staged ahead of the devices.
    pub queue_depth: usize,
    /// How long a work may mine before it is considered exhausted.
    pub scantime: Duration,
    /// Maximum age of a share still worth submitting (retry ceiling).
    pub expiry: Duration,
    pub cutoff_temp: f32,
    pub hysteresis: f32,
    /// Pause between failed getwork attempts against the same pool.
    pub fail_pause: Duration,
    /// Hashmeter reporting interval.
    pub log_interval: Duration,
    /// Only mine from the highest-priority alive pool, never load-balance.
    pub failover_only: bool,
    /// Reusable HTTP handles kept per pool.
    pub client_ring_capacity: usize,
    /// Mine deterministic benchmark work instead of pool work.
    pub benchmark: bool,
    /// Ask stratum pools for this share difficulty on connect.
    pub suggest_diff: Option<f64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            strategy: Strategy::Failover,
            rotate_period: Duration::from_secs(60 * 8),
            queue_depth: 1,
            scantime: Duration::from_secs(60),
            expiry: Duration::from_secs(120),
            cutoff_temp: 95.0,
            hysteresis: 3.0,
            fail_pause: Duration::from_secs(5),
            log_interval: Duration::from_secs(5),
            failover_only: false,
            client_ring_capacity: 2,
            benchmark: false,
            suggest_diff: None,
        }
    }
}

impl Options {
    /// Staged works per mining thread, never below one.
    pub fn staging_capacity(&self, mining_threads: usize) -> usize {
        (self.queue_depth.max(1)) * mining_threads.max(1) + 1
    }
}
