//! Injected time source and the shared one-shot timer wheel.
//!
//! Nothing in the engine reads the wall clock directly. Components receive a
//! [`SharedClock`] at construction and acquire timers through the manager's
//! [`TimerWheel`], which keeps scheduling deterministic under test: a
//! [`ManualClock`] is advanced explicitly and `poll()` hands back exactly the
//! timers whose deadlines have passed, in deadline order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of "now" for every component in the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replay harnesses.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += Duration::milliseconds(ms);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Identifier for an armed one-shot timer. Never reused within a wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct TimerEntry<T> {
    deadline: DateTime<Utc>,
    delay: Duration,
    target: T,
}

/// One-shot timer service shared by every component under a manager.
///
/// Timers are armed with a target tag; `poll(now)` removes and returns every
/// expired entry ordered by deadline (ties broken by arm order). `reset`
/// re-arms an entry for its original delay, which is how the no-data
/// watchdog is fed.
#[derive(Debug)]
pub struct TimerWheel<T> {
    next_id: u64,
    entries: BTreeMap<TimerId, TimerEntry<T>>,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer `delay_ms` from `now`.
    pub fn arm(&mut self, target: T, delay_ms: u32, now: DateTime<Utc>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let delay = Duration::milliseconds(i64::from(delay_ms));
        self.entries.insert(
            id,
            TimerEntry {
                deadline: now + delay,
                delay,
                target,
            },
        );
        id
    }

    /// Cancel an armed timer. Unknown ids are ignored (already fired).
    pub fn disarm(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// Push an armed timer's deadline out by its original delay.
    /// Returns false if the timer is no longer armed.
    pub fn reset(&mut self, id: TimerId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = now + entry.delay;
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Earliest pending deadline, for the runtime loop's sleep.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Remove and return every timer whose deadline has passed, ordered by
    /// deadline (arm order breaks ties).
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<(TimerId, T)> {
        let expired: Vec<TimerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut fired: Vec<(TimerId, TimerEntry<T>)> = expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect();
        fired.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline).then(a.0.cmp(&b.0)));
        fired.into_iter().map(|(id, e)| (id, e.target)).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
