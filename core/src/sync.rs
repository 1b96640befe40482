//! Locking primitives shared across the coordinator.
//!
//! Lock order, outermost first: pool-set control lock > device registry
//! lock > per-pool stratum data lock > per-device queue lock > stats lock.
//! Locks are released in reverse order, and no lock other than a control
//! read may be held across a blocking network call.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Write-biased reader/writer lock.
///
/// An outer mutex serializes would-be writers so that a steady stream of
/// readers cannot starve a writer: a writer holds the mutex while it waits
/// for the rwlock, which blocks new readers from even beginning to acquire.
pub struct WriteBiasedLock<T> {
    outer: Mutex<()>,
    inner: RwLock<T>,
}

impl<T> WriteBiasedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            outer: Mutex::new(()),
            inner: RwLock::new(value),
        }
    }

    /// Plain read lock. Cannot be promoted.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let gate = self.outer.lock();
        let guard = self.inner.read();
        drop(gate);
        guard
    }

    /// Full write lock.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let gate = self.outer.lock();
        let guard = self.inner.write();
        WriteGuard {
            guard,
            _gate: gate,
        }
    }

    /// Intermediate hold: keeps other writers out without blocking running
    /// readers. Promote with [`IntermediateGuard::upgrade`] or demote with
    /// [`IntermediateGuard::downgrade`].
    pub fn intermediate(&self) -> IntermediateGuard<'_, T> {
        IntermediateGuard {
            lock: self,
            gate: self.outer.lock(),
        }
    }
}

/// Write guard; drops the rwlock before the writer gate.
pub struct WriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _gate: MutexGuard<'a, ()>,
}

impl<T> std::ops::Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct IntermediateGuard<'a, T> {
    lock: &'a WriteBiasedLock<T>,
    gate: MutexGuard<'a, ()>,
}

impl<'a, T> IntermediateGuard<'a, T> {
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let IntermediateGuard { lock, gate } = self;
        WriteGuard {
            guard: lock.inner.write(),
            _gate: gate,
        }
    }

    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let IntermediateGuard { lock, gate } = self;
        let guard = lock.inner.read();
        drop(gate);
        guard
    }
}

/// Wake-up channel for a worker thread.
///
/// Replaces the classic pipe/eventfd notifier pair: `wake` never blocks and
/// coalesces with an already-pending wake, `wait` parks the thread until a
/// wake or the timeout. Clones share the same channel.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn wake(&self) {
        let _ = self.tx.try_send(());
    }

    /// Returns true when woken, false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Raw receiver for `select!` loops.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn write_biased_lock_roundtrip() {
        let lock = WriteBiasedLock::new(1u32);
        assert_eq!(*lock.read(), 1);
        *lock.write() = 2;
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn intermediate_promotes_and_demotes() {
        let lock = WriteBiasedLock::new(vec![1, 2]);
        let i = lock.intermediate();
        let mut w = i.upgrade();
        w.push(3);
        drop(w);

        let i = lock.intermediate();
        let r = i.downgrade();
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn writer_wins_against_reader_stream() {
        let lock = Arc::new(WriteBiasedLock::new(0u64));
        let l2 = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            for _ in 0..100 {
                *l2.write() += 1;
            }
        });
        for _ in 0..100 {
            let _ = *lock.read();
        }
        writer.join().unwrap();
        assert_eq!(*lock.read(), 100);
    }

    #[test]
    fn notifier_coalesces_wakes() {
        let n = Notifier::new();
        n.wake();
        n.wake();
        assert!(n.wait(Duration::from_millis(10)));
        assert!(!n.wait(Duration::from_millis(10)));
    }
}
