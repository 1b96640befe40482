//! TOML configuration for the miner binary.
//!
//! CLI flags win over the config file; the file supplies per-pool detail
//! the flags cannot express.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pools: Vec<PoolEntry>,

    #[serde(default)]
    pub mining: MiningSection,

    #[serde(default)]
    pub hardware: HardwareSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub pass: String,

    /// Failover priority; lower wins.
    #[serde(default)]
    pub prio: usize,

    /// Load-balance weight.
    #[serde(default = "default_quota")]
    pub quota: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningSection {
    /// failover, round-robin, rotate, load-balance, balance
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Works staged ahead of the devices, per mining thread.
    #[serde(default = "default_queue")]
    pub queue: usize,

    /// Seconds a work may mine before it is considered exhausted.
    #[serde(default = "default_scantime")]
    pub scantime: u64,

    /// Seconds before an unsubmitted share is abandoned.
    #[serde(default = "default_expiry")]
    pub expiry: u64,

    #[serde(default)]
    pub failover_only: bool,

    /// Minutes between switches under the rotate strategy.
    #[serde(default = "default_rotate")]
    pub rotate_period_mins: u64,

    /// Share difficulty to suggest to stratum pools.
    pub suggest_difficulty: Option<f64>,
}

impl Default for MiningSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            queue: default_queue(),
            scantime: default_scantime(),
            expiry: default_expiry(),
            failover_only: false,
            rotate_period_mins: default_rotate(),
            suggest_difficulty: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSection {
    /// 0 = one per CPU.
    #[serde(default)]
    pub cpu_threads: usize,

    #[serde(default = "default_cutoff")]
    pub cutoff_temp: f32,

    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            cpu_threads: 0,
            cutoff_temp: default_cutoff(),
            hysteresis: default_hysteresis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Seconds between hashmeter lines.
    #[serde(default = "default_log_interval")]
    pub interval: u64,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            interval: default_log_interval(),
        }
    }
}

fn default_quota() -> u64 {
    1
}
fn default_strategy() -> String {
    "failover".into()
}
fn default_queue() -> usize {
    1
}
fn default_scantime() -> u64 {
    60
}
fn default_expiry() -> u64 {
    120
}
fn default_rotate() -> u64 {
    8
}
fn default_cutoff() -> f32 {
    95.0
}
fn default_hysteresis() -> f32 {
    3.0
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_interval() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Default config location, if one exists.
    pub fn default_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("stope").join("miner.toml");
        path.exists().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[pools]]
url = "stratum+tcp://pool.example:3333"
user = "worker"

[mining]
strategy = "load-balance"
"#
        )
        .unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.pools.len(), 1);
        assert_eq!(cfg.pools[0].quota, 1);
        assert_eq!(cfg.mining.strategy, "load-balance");
        assert_eq!(cfg.mining.scantime, 60);
        assert_eq!(cfg.hardware.cutoff_temp, 95.0);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.pools.is_empty());
        assert_eq!(cfg.mining.queue, 1);
        assert_eq!(cfg.logging.level, "info");
    }
}
