//! Freeze/thaw thread queue used for the pool submit and getwork pipelines.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a [`ThreadQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    /// Deadline elapsed with the queue still empty.
    Timeout,
    /// Queue frozen and drained; the consumer should exit.
    Terminated,
}

impl<T> Pop<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Pop::Item(item) => Some(item),
            _ => None,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    frozen: bool,
}

/// Single-producer/multi-consumer FIFO with producer admission control.
///
/// `push` never blocks; while frozen it refuses new items so consumers can
/// drain and terminate deterministically during shutdown.
pub struct ThreadQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> ThreadQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                frozen: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Returns false when the queue is frozen; the caller drops or retries.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.frozen {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.cond.notify_one();
        true
    }

    /// Waits up to `deadline` for an item; `None` waits indefinitely.
    pub fn pop(&self, deadline: Option<Duration>) -> Pop<T> {
        let until = deadline.map(|d| Instant::now() + d);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Pop::Item(item);
            }
            if state.frozen {
                return Pop::Terminated;
            }
            match until {
                Some(until) => {
                    if self.cond.wait_until(&mut state, until).timed_out() {
                        return match state.items.pop_front() {
                            Some(item) => Pop::Item(item),
                            None if state.frozen => Pop::Terminated,
                            None => Pop::Timeout,
                        };
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Stops admitting items and wakes every consumer.
    pub fn freeze(&self) {
        self.state.lock().frozen = true;
        self.cond.notify_all();
    }

    pub fn thaw(&self) {
        self.state.lock().frozen = false;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_pop_fifo() {
        let q = ThreadQueue::new();
        assert!(q.push(1));
        assert!(q.push(2));
        assert_eq!(q.pop(Some(Duration::from_millis(1))), Pop::Item(1));
        assert_eq!(q.pop(Some(Duration::from_millis(1))), Pop::Item(2));
        assert_eq!(q.pop(Some(Duration::from_millis(1))), Pop::Timeout);
    }

    #[test]
    fn freeze_refuses_producers_and_terminates_consumers() {
        let q = ThreadQueue::new();
        assert!(q.push(1));
        q.freeze();
        assert!(!q.push(2));
        // Remaining items still drain before termination.
        assert_eq!(q.pop(Some(Duration::from_millis(1))), Pop::Item(1));
        assert_eq!(q.pop(Some(Duration::from_millis(1))), Pop::Terminated);
        q.thaw();
        assert!(q.push(3));
    }

    #[test]
    fn freeze_wakes_blocked_consumer() {
        let q = Arc::new(ThreadQueue::<u32>::new());
        let q2 = Arc::clone(&q);
        let consumer = std::thread::spawn(move || q2.pop(Some(Duration::from_secs(10))));
        std::thread::sleep(Duration::from_millis(50));
        q.freeze();
        assert_eq!(consumer.join().unwrap(), Pop::Terminated);
    }

    #[test]
    fn len_tracks_contents() {
        let q = ThreadQueue::new();
        assert!(q.is_empty());
        for i in 0..3 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
    }
}
