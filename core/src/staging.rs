//! Process-wide staging queue between the work generator and the devices.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::queue::Pop;
use crate::work::Work;

struct State {
    works: VecDeque<Work>,
    frozen: bool,
}

pub struct StagingQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: AtomicUsize,
}

impl StagingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                works: VecDeque::new(),
                frozen: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Retargets the staging depth once the thread count is known.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages a work; fails when frozen (shutdown) so the generator can exit.
    pub fn push(&self, mut work: Work) -> bool {
        let mut state = self.state.lock();
        if state.frozen {
            return false;
        }
        work.tv_staged = Some(Instant::now());
        state.works.push_back(work);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Parks the generator until the queue drops below capacity, a
    /// consumer drains something, or the timeout passes. Returns false on
    /// freeze.
    pub fn wait_space(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.works.len() >= self.capacity() && !state.frozen {
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.frozen
    }

    pub fn pop(&self, deadline: Option<Duration>) -> Pop<Work> {
        let until = deadline.map(|d| Instant::now() + d);
        let mut state = self.state.lock();
        loop {
            if let Some(work) = state.works.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Pop::Item(work);
            }
            if state.frozen {
                return Pop::Terminated;
            }
            match until {
                Some(until) => {
                    if self.not_empty.wait_until(&mut state, until).timed_out() {
                        return match state.works.pop_front() {
                            Some(work) => {
                                drop(state);
                                self.not_full.notify_one();
                                Pop::Item(work)
                            }
                            None if state.frozen => Pop::Terminated,
                            None => Pop::Timeout,
                        };
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Drops staged works failing the predicate (block change, pool
    /// switch). Returns how many were discarded.
    pub fn discard_matching<F: FnMut(&Work) -> bool>(&self, mut stale: F) -> usize {
        let mut state = self.state.lock();
        let before = state.works.len();
        state.works.retain(|w| !stale(w));
        let dropped = before - state.works.len();
        drop(state);
        if dropped > 0 {
            self.not_full.notify_all();
        }
        dropped
    }

    /// Marks matching staged works stale in place instead of dropping them;
    /// consumers decide whether a stale work is still worth mining.
    pub fn mark_stale_matching<F: FnMut(&Work) -> bool>(&self, mut pred: F) -> usize {
        let mut state = self.state.lock();
        let mut marked = 0;
        for w in state.works.iter_mut() {
            if !w.stale && pred(w) {
                w.stale = true;
                marked += 1;
            }
        }
        marked
    }

    /// Shutdown: wake everyone, admit nothing further.
    pub fn freeze(&self) {
        self.state.lock().frozen = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::PoolId;

    fn staged(pool: usize) -> Work {
        Work::new(PoolId(pool))
    }

    #[test]
    fn fifo_and_capacity_signalling() {
        let q = StagingQueue::new(2);
        assert!(q.push(staged(0)));
        assert!(q.push(staged(0)));
        assert_eq!(q.len(), 2);
        // Full queue: wait_space times out but queue stays usable.
        assert!(q.wait_space(Duration::from_millis(10)));
        assert!(q.pop(Some(Duration::from_millis(10))).into_item().is_some());
        assert!(q.wait_space(Duration::from_millis(10)));
    }

    #[test]
    fn discard_matching_filters_by_pool() {
        let q = StagingQueue::new(8);
        for i in 0..4 {
            q.push(staged(i % 2));
        }
        let dropped = q.discard_matching(|w| w.pool == PoolId(1));
        assert_eq!(dropped, 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn freeze_terminates_consumers() {
        let q = StagingQueue::new(2);
        q.freeze();
        assert!(matches!(q.pop(Some(Duration::from_millis(5))), Pop::Terminated));
        assert!(!q.push(staged(0)));
    }
}
