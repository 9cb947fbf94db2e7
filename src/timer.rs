//! Timer wheel: a `BinaryHeap` of deadlines plus a side table so timers can
//! be reset or cancelled in place.
//!
//! The four built-in per-handle timers (connect/close/keepalive/heartbeat)
//! from spec section 4.2 are represented as a `TimerKind` tag rather than a
//! stored closure — `Reactor::fire_due_timers` matches on the tag and
//! performs the built-in action directly against the owning handle, the
//! same way `hevent.c`'s `__keepalive_timeout_cb`/`__heartbeat_timer_cb`
//! are small free functions closing over nothing but the `hio_t*` in
//! `timer->privdata`. App-level timers created through
//! [`crate::Reactor::timer_add`] keep their callback in a side map owned by
//! the reactor, not in the wheel, for the same reason.
//!
//! Min-heap-with-lazy-deletion is a standard timer wheel idiom (see e.g.
//! the `BinaryHeap<Timeout>` deadline queue in the NTS-KE listener
//! reference); a monotonically increasing per-entry `version` distinguishes
//! a live heap entry from one made stale by `reset`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use mio::Token;

use crate::clock::Nanos;

pub type TimerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatCount {
    Once,
    Forever,
    Times(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    ConnectTimeout,
    CloseTimeout,
    Keepalive,
    Heartbeat,
    /// An application-level timer added via `Reactor::timer_add`; its
    /// callback lives outside the wheel.
    User,
}

struct Entry {
    deadline: Nanos,
    interval: Nanos,
    repeats_left: RepeatCount,
    owner: Option<Token>,
    kind: TimerKind,
    seq: u64,
    version: u64,
}

/// One firing of a timer, returned by [`TimerWheel::pop_due`] for the
/// reactor to act on.
pub struct FiredTimer {
    pub id: TimerId,
    pub kind: TimerKind,
    pub owner: Option<Token>,
}

type HeapKey = Reverse<(Nanos, u64, TimerId, u64)>;

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<HeapKey>,
    entries: HashMap<TimerId, Entry>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(
        &mut self,
        deadline: Nanos,
        interval: Nanos,
        repeat: RepeatCount,
        owner: Option<Token>,
        kind: TimerKind,
    ) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries.insert(id, Entry { deadline, interval, repeats_left: repeat, owner, kind, seq, version: 0 });
        self.heap.push(Reverse((deadline, seq, id, 0)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// True if `id` still names a live entry, used to decide whether a
    /// repeating app-level timer's callback should be reinstalled after
    /// firing (one-shot and cancelled timers answer false).
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Cancels every timer owned by `token` (used by `hio_done`'s
    /// equivalent when a handle closes).
    pub fn cancel_owned_by(&mut self, token: Token) {
        self.entries.retain(|_, e| e.owner != Some(token));
    }

    /// Adjusts an existing timer's deadline in place, per spec: "re-setting
    /// adjusts the deadline without deleting and re-adding."
    pub fn reset(&mut self, id: TimerId, new_deadline: Nanos) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.deadline = new_deadline;
            entry.version += 1;
            entry.seq = seq;
            self.heap.push(Reverse((new_deadline, seq, id, entry.version)));
        }
    }

    pub fn next_deadline(&mut self) -> Option<Nanos> {
        while let Some(&Reverse((deadline, _, id, version))) = self.heap.peek() {
            match self.entries.get(&id) {
                Some(e) if e.version == version => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Fires every timer due at or before `now`, in deadline order with
    /// ties broken by insertion order, requeuing repeaters.
    pub fn pop_due(&mut self, now: Nanos) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        loop {
            let Some(&Reverse((deadline, _, id, version))) = self.heap.peek() else { break };
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else { continue };
            if entry.version != version {
                continue;
            }

            fired.push(FiredTimer { id, kind: entry.kind, owner: entry.owner });

            let remaining = match entry.repeats_left {
                RepeatCount::Once => None,
                RepeatCount::Forever => Some(RepeatCount::Forever),
                RepeatCount::Times(n) if n > 1 => Some(RepeatCount::Times(n - 1)),
                RepeatCount::Times(_) => None,
            };

            match remaining {
                None => {
                    self.entries.remove(&id);
                }
                Some(next_repeat) => {
                    let next_deadline = now.saturating_add(entry.interval);
                    entry.repeats_left = next_repeat;
                    entry.deadline = next_deadline;
                    entry.version += 1;
                    self.next_seq += 1;
                    entry.seq = self.next_seq;
                    self.heap.push(Reverse((next_deadline, entry.seq, id, entry.version)));
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order_ties_by_insertion() {
        let mut wheel = TimerWheel::new();
        let a = wheel.add(Nanos(10), Nanos::ZERO, RepeatCount::Once, None, TimerKind::User);
        let b = wheel.add(Nanos(10), Nanos::ZERO, RepeatCount::Once, None, TimerKind::User);
        let c = wheel.add(Nanos(5), Nanos::ZERO, RepeatCount::Once, None, TimerKind::User);

        let fired = wheel.pop_due(Nanos(10));
        let ids: Vec<TimerId> = fired.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![c, a, b]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn repeating_timer_requeues() {
        let mut wheel = TimerWheel::new();
        wheel.add(Nanos(10), Nanos(10), RepeatCount::Forever, None, TimerKind::Heartbeat);

        let fired = wheel.pop_due(Nanos(10));
        assert_eq!(fired.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(Nanos(20)));

        let fired2 = wheel.pop_due(Nanos(20));
        assert_eq!(fired2.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(Nanos(30)));
    }

    #[test]
    fn reset_supersedes_stale_heap_entry() {
        let mut wheel = TimerWheel::new();
        let id = wheel.add(Nanos(100), Nanos::ZERO, RepeatCount::Once, None, TimerKind::Keepalive);
        wheel.reset(id, Nanos(200));

        // Firing at the original deadline must not trigger the stale entry.
        assert!(wheel.pop_due(Nanos(100)).is_empty());
        let fired = wheel.pop_due(Nanos(200));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
    }

    #[test]
    fn cancel_removes_entry_even_if_heap_entry_lingers() {
        let mut wheel = TimerWheel::new();
        let id = wheel.add(Nanos(5), Nanos::ZERO, RepeatCount::Once, None, TimerKind::ConnectTimeout);
        wheel.cancel(id);
        assert!(wheel.pop_due(Nanos(100)).is_empty());
    }

    #[test]
    fn times_n_stops_after_n_firings() {
        let mut wheel = TimerWheel::new();
        wheel.add(Nanos(10), Nanos(10), RepeatCount::Times(2), None, TimerKind::User);
        assert_eq!(wheel.pop_due(Nanos(10)).len(), 1);
        assert_eq!(wheel.pop_due(Nanos(20)).len(), 1);
        assert_eq!(wheel.pop_due(Nanos(30)).len(), 0);
        assert!(wheel.is_empty());
    }
}
