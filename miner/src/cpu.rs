//! Bundled CPU driver: double-SHA256 over the header scratch, one legacy
//! scanhash loop per thread.

use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use sysinfo::Components;

use stope_core::error::Result;
use stope_core::work::{hash_meets_target, hash_to_be, sha256d, Work};
use stope_core::{Device, DeviceSpec, DriverBase, DriverKind, LegacyDriver, ThreadCtx};

/// Nonces hashed per scanhash call; small enough to notice restarts
/// quickly, large enough to amortize the loop overhead.
const BATCH: u32 = 1 << 16;

pub struct CpuDriver {
    components: Mutex<Components>,
}

impl CpuDriver {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Components::new_with_refreshed_list()),
        }
    }

    /// One device spanning all requested threads.
    pub fn spec(threads: usize) -> DeviceSpec {
        DeviceSpec {
            name: "CPU".into(),
            procs: threads.max(1),
            threads: threads.max(1),
            // ntime rolling is free on a CPU.
            rolllimit: 60,
            cutoff_temp: None,
            target_temp: None,
        }
    }

    pub fn kind() -> DriverKind {
        DriverKind::Legacy(std::sync::Arc::new(CpuDriver::new()))
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverBase for CpuDriver {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn thread_init(&self, thr: &ThreadCtx) -> Result<()> {
        debug!("cpu thread {} ready", thr.shared.thr_id);
        Ok(())
    }

    fn temperature(&self, _dev: &Device) -> Option<f32> {
        let mut components = self.components.lock();
        components.refresh();
        let mut hottest: Option<f32> = None;
        for c in components.list() {
            let label = c.label().to_ascii_lowercase();
            if label.contains("cpu") || label.contains("core") || label.contains("package") {
                let t = c.temperature();
                hottest = Some(hottest.map_or(t, |m| m.max(t)));
            }
        }
        hottest
    }
}

impl LegacyDriver for CpuDriver {
    fn can_limit_work(&self, _thr: &ThreadCtx) -> u32 {
        BATCH
    }

    fn scanhash(&self, thr: &ThreadCtx, work: &mut Work, max_nonce: u32) -> Result<u64> {
        let start = work.nonce;
        let span = max_nonce.min(BATCH);
        let end = start.saturating_add(span);
        let mut header = [0u8; 80];
        header.copy_from_slice(&work.data[..80]);

        let mut hashes = 0u64;
        for nonce in start..end {
            header[76..80].copy_from_slice(&nonce.to_le_bytes());
            let hash = hash_to_be(&sha256d(&header));
            hashes += 1;
            if hash_meets_target(&hash, &work.target) {
                thr.submit_nonce(work, nonce);
            }
            // Bail quickly when new work arrived mid-batch.
            if hashes % 4096 == 0 && thr.restart_pending() {
                break;
            }
        }
        work.nonce = start.saturating_add(hashes as u32);
        if hashes == 0 {
            // Fully exhausted; give the loop a beat to roll or refetch.
            work.nonce = u32::MAX;
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_sizes_to_thread_count() {
        let spec = CpuDriver::spec(4);
        assert_eq!(spec.threads, 4);
        assert_eq!(CpuDriver::spec(0).threads, 1);
    }

    #[test]
    fn driver_is_legacy_flavor() {
        assert_eq!(CpuDriver::kind().flavor(), "scanhash");
    }
}
