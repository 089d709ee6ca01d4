//! Timer pool: a min-heap of pending firings plus a side table of live
//! timers, so cancellation is a map removal rather than a heap search.
//! Grounded on muduo/annety's `TimerQueue` (heap of `Timer` sorted by
//! expiration, `cancelInLoop` guarding against a timer cancelling itself
//! mid-callback) adapted to a `BinaryHeap` since this crate has no
//! timerfd dependency by default — the loop's poll timeout is clamped to
//! the next expiration instead (spec.md §4.6 permits either backend).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

struct TimerEntry {
    id: TimerId,
    expiration: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapKey {
    expiration: Instant,
    seq: u64,
    id: TimerId,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest
        // expiration first; `seq` breaks ties in insertion order.
        other
            .expiration
            .cmp(&self.expiration)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimerPool {
    heap: BinaryHeap<HeapKey>,
    timers: HashMap<TimerId, TimerEntry>,
    next_seq: u64,
    next_id: u64,
    calling_expired: bool,
    cancelled_while_calling: HashSet<TimerId>,
}

impl TimerPool {
    pub fn new() -> Self {
        TimerPool::default()
    }

    pub fn add(
        &mut self,
        expiration: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.push(id, expiration);
        self.timers.insert(
            id,
            TimerEntry { id, expiration, interval, callback },
        );
        id
    }

    fn push(&mut self, id: TimerId, expiration: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapKey { expiration, seq, id });
    }

    /// Cancels a pending timer. Safe to call from within that timer's own
    /// callback (the common "one-shot that reschedules itself only
    /// sometimes" pattern): a repeating timer cancelled during its own
    /// firing is not re-armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.calling_expired {
            self.cancelled_while_calling.insert(id);
        }
        self.timers.remove(&id).is_some()
    }

    /// Next wake-up deadline, or `None` if the pool is empty. Lazily
    /// drops heap entries whose timer was already cancelled.
    pub fn next_expiration(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.timers.contains_key(&top.id) {
                return Some(top.expiration);
            }
            self.heap.pop();
        }
        None
    }

    /// Runs every timer whose expiration is `<= now`, reinserting
    /// repeating timers for their next firing unless the callback
    /// cancelled the timer itself.
    pub fn expire(&mut self, now: Instant, event_loop: &mut EventLoop) {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.expiration > now {
                break;
            }
            let top = self.heap.pop().unwrap();
            if let Some(entry) = self.timers.remove(&top.id) {
                due.push(entry);
            }
        }

        self.calling_expired = true;
        self.cancelled_while_calling.clear();
        for mut entry in due {
            (entry.callback)(event_loop);
            if let Some(interval) = entry.interval {
                if !self.cancelled_while_calling.contains(&entry.id) {
                    entry.expiration = now + interval;
                    self.push(entry.id, entry.expiration);
                    self.timers.insert(entry.id, entry);
                }
            }
        }
        self.calling_expired = false;
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_key_orders_earliest_first() {
        let now = Instant::now();
        let a = HeapKey { expiration: now, seq: 0, id: TimerId(0) };
        let b = HeapKey { expiration: now + Duration::from_secs(1), seq: 1, id: TimerId(1) };
        let mut heap = BinaryHeap::new();
        heap.push(b);
        heap.push(a);
        assert_eq!(heap.pop().unwrap().id, TimerId(0));
    }

    #[test]
    fn next_expiration_skips_cancelled_entries() {
        let mut pool = TimerPool::new();
        let now = Instant::now();
        let id = pool.add(now, None, Box::new(|_| {}));
        pool.add(now + Duration::from_secs(5), None, Box::new(|_| {}));
        pool.cancel(id);
        let next = pool.next_expiration().unwrap();
        assert!(next >= now + Duration::from_secs(5));
    }
}
