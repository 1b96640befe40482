//! Driver capability set.
//!
//! A driver implements exactly one of the three execution flavors and the
//! coordinator dispatches on the variant; there is no partially-populated
//! vtable and no downcasting between flavors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::Device;
use crate::error::Result;
use crate::minerloop::ThreadCtx;
use crate::work::Work;

/// Lifecycle and supervision hooks every flavor shares.
///
/// Guarantees from the framework: `thread_prepare`/`thread_init` run before
/// any work call, `thread_shutdown` runs exactly once if prepare succeeded,
/// and `watchdog` fires at most once per watchdog interval.
pub trait DriverBase: Send + Sync {
    fn name(&self) -> &'static str;

    fn thread_prepare(&self, _thr: &ThreadCtx) -> Result<()> {
        Ok(())
    }

    fn thread_init(&self, _thr: &ThreadCtx) -> Result<()> {
        Ok(())
    }

    fn thread_shutdown(&self, _thr: &ThreadCtx) {}

    fn watchdog(&self, _dev: &Device, _now: Instant) {}

    fn temperature(&self, _dev: &Device) -> Option<f32> {
        None
    }

    /// Attempt to bring a sick or errored device back.
    fn reinit(&self, _dev: &Device) -> Result<()> {
        Ok(())
    }
}

/// Synchronous scanhash shape: hash a work until exhausted or told to stop.
pub trait LegacyDriver: DriverBase {
    fn prepare_work(&self, _thr: &ThreadCtx, _work: &mut Work) -> Result<()> {
        Ok(())
    }

    /// Upper bound on nonces per scanhash call.
    fn can_limit_work(&self, _thr: &ThreadCtx) -> u32 {
        u32::MAX
    }

    /// Hashes up to `max_nonce` nonces, submitting solutions through the
    /// thread context. Returns the number of hashes attempted.
    fn scanhash(&self, thr: &ThreadCtx, work: &mut Work, max_nonce: u32) -> Result<u64>;
}

/// Cooperative job-based shape for hardware that hashes while the host
/// prepares the next job.
pub trait AsyncDriver: DriverBase {
    /// Stages `work` on the device; returns the expected job runtime so
    /// the loop can schedule result collection.
    fn job_prepare(&self, thr: &ThreadCtx, work: &Work, max_nonce: u32) -> Result<Duration>;

    /// Starts the prepared job. Called exactly once per (work, thread).
    fn job_start(&self, thr: &ThreadCtx) -> Result<()>;

    fn job_get_results(&self, thr: &ThreadCtx, work: &Work) -> Result<()>;

    /// Always paired with a prior `job_get_results` for the same work.
    /// Returns hashes done by that job.
    fn job_process_results(&self, thr: &ThreadCtx, work: &mut Work, stopping: bool)
        -> Result<u64>;

    /// Optional I/O poll cadence.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn poll(&self, _thr: &ThreadCtx) {}
}

/// Queue shape: the driver owns an internal queue and submits results from
/// its own I/O context.
pub trait QueueDriver: DriverBase {
    /// Offers a work; false means the internal queue is full and the
    /// framework should wait on the device condvar.
    fn queue_append(&self, thr: &ThreadCtx, work: &Work) -> bool;

    /// Drop everything queued on silicon; pool switch or new block.
    fn queue_flush(&self, dev: &Device);

    fn queue_full(&self, _dev: &Device) -> bool {
        false
    }
}

#[derive(Clone)]
pub enum DriverKind {
    Legacy(Arc<dyn LegacyDriver>),
    Async(Arc<dyn AsyncDriver>),
    Queue(Arc<dyn QueueDriver>),
}

impl DriverKind {
    pub fn base(&self) -> &dyn DriverBase {
        match self {
            DriverKind::Legacy(d) => d.as_ref(),
            DriverKind::Async(d) => d.as_ref(),
            DriverKind::Queue(d) => d.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.base().name()
    }

    pub fn flavor(&self) -> &'static str {
        match self {
            DriverKind::Legacy(_) => "scanhash",
            DriverKind::Async(_) => "async",
            DriverKind::Queue(_) => "queue",
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Inert scanhash driver for registry-level tests.
    pub struct NullDriver;

    impl DriverBase for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }
    }

    impl LegacyDriver for NullDriver {
        fn scanhash(&self, _thr: &ThreadCtx, _work: &mut Work, max_nonce: u32) -> Result<u64> {
            Ok(max_nonce as u64)
        }
    }

    #[test]
    fn flavor_dispatch() {
        let drv = DriverKind::Legacy(Arc::new(NullDriver));
        assert_eq!(drv.name(), "null");
        assert_eq!(drv.flavor(), "scanhash");
    }
}
