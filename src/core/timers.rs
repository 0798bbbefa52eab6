//! Timer queue backing `setTimeout` / `setInterval` inside one context.
//!
//! Timers fire in due order, ties broken by scheduling order. A fired entry
//! is handed out by value; intervals come back through [`TimerQueue::finish`]
//! unless they were cleared while their callback ran.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

pub type TimerId = u32;

/// Browsers treat delays above `i32::MAX` milliseconds as zero.
const MAX_DELAY_MS: f64 = i32::MAX as f64;

/// Converts a script-supplied delay in milliseconds to a duration.
pub fn clamp_delay(delay_ms: f64) -> Duration {
    if !delay_ms.is_finite() || delay_ms <= 0.0 || delay_ms > MAX_DELAY_MS {
        Duration::ZERO
    } else {
        Duration::from_millis(delay_ms as u64)
    }
}

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    due: Instant,
    seq: u64,
    interval: Option<Duration>,
}

/// A timer that is due, removed from the queue while its callback runs
#[derive(Debug)]
pub struct Fired<T> {
    pub id: TimerId,
    pub payload: T,
    interval: Option<Duration>,
}

#[derive(Debug)]
pub enum TimerPoll<T> {
    /// Nothing scheduled
    Idle,
    /// Next timer is due after this long
    Wait(Duration),
    Fire(Fired<T>),
}

#[derive(Debug)]
pub struct TimerQueue<T> {
    next_id: TimerId,
    next_seq: u64,
    order: BTreeMap<(Instant, u64), TimerId>,
    entries: HashMap<TimerId, Entry<T>>,
    firing: Option<TimerId>,
    firing_cleared: bool,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            order: BTreeMap::new(),
            entries: HashMap::new(),
            firing: None,
            firing_cleared: false,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, payload: T, delay: Duration, repeat: bool, now: Instant) -> TimerId {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.insert(id, payload, now + delay, repeat.then_some(delay));
        id
    }

    fn insert(&mut self, id: TimerId, payload: T, due: Instant, interval: Option<Duration>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((due, seq), id);
        self.entries.insert(
            id,
            Entry {
                payload,
                due,
                seq,
                interval,
            },
        );
    }

    /// Cancels a timer. Returns whether anything was cancelled.
    pub fn clear(&mut self, id: TimerId) -> bool {
        if self.firing == Some(id) {
            self.firing_cleared = true;
            return true;
        }
        match self.entries.remove(&id) {
            Some(entry) => {
                self.order.remove(&(entry.due, entry.seq));
                true
            }
            None => false,
        }
    }

    pub fn poll(&mut self, now: Instant) -> TimerPoll<T> {
        let Some((&(due, seq), &id)) = self.order.iter().next() else {
            return TimerPoll::Idle;
        };
        if due > now {
            return TimerPoll::Wait(due - now);
        }

        self.order.remove(&(due, seq));
        match self.entries.remove(&id) {
            Some(entry) => {
                self.firing = Some(id);
                self.firing_cleared = false;
                TimerPoll::Fire(Fired {
                    id,
                    payload: entry.payload,
                    interval: entry.interval,
                })
            }
            None => self.poll(now),
        }
    }

    /// Hands a fired timer back; intervals are re-armed relative to `now`.
    pub fn finish(&mut self, fired: Fired<T>, now: Instant) {
        let cleared = self.firing == Some(fired.id) && self.firing_cleared;
        self.firing = None;
        self.firing_cleared = false;

        if let (Some(interval), false) = (fired.interval, cleared) {
            let due = now + interval.max(Duration::from_millis(1));
            self.insert(fired.id, fired.payload, due, Some(interval));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
