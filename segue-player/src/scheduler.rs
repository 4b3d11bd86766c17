//! Cooperative-loop scheduler
//!
//! Holds the engine's timers and deferred ("idle") work. Nothing here runs
//! on its own: the loop asks for due work once per iteration and executes
//! it on the loop thread, so handlers can freely touch engine state.
//!
//! Timers are keyed by class. Arming a key that is already armed replaces
//! the previous timer, which is how a new crossfade or fade cancels the one
//! before it.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

struct Timer<T> {
    deadline_ms: u64,
    period_ms: Option<u64>,
    /// Arm order, breaks deadline ties
    seq: u64,
    task: T,
}

pub struct Scheduler<K, T> {
    timers: HashMap<K, Timer<T>>,
    deferred: VecDeque<T>,
    next_seq: u64,
}

impl<K, T> Scheduler<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            deferred: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Arm a one-shot timer, replacing any timer with the same key
    pub fn arm_once(&mut self, key: K, now_ms: u64, delay_ms: u64, task: T) {
        self.insert(key, now_ms + delay_ms, None, task);
    }

    /// Arm a repeating timer, replacing any timer with the same key
    ///
    /// The first fire happens one period after `now_ms`. A zero period is
    /// treated as one millisecond.
    pub fn arm_repeating(&mut self, key: K, now_ms: u64, period_ms: u64, task: T) {
        let period = period_ms.max(1);
        self.insert(key, now_ms + period, Some(period), task);
    }

    fn insert(&mut self, key: K, deadline_ms: u64, period_ms: Option<u64>, task: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert(
            key,
            Timer {
                deadline_ms,
                period_ms,
                seq,
                task,
            },
        );
    }

    /// Cancel a timer; returns whether one was armed
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Deadline of an armed timer
    pub fn deadline(&self, key: &K) -> Option<u64> {
        self.timers.get(key).map(|t| t.deadline_ms)
    }

    /// Queue work for the next loop iteration
    pub fn defer(&mut self, task: T) {
        self.deferred.push_back(task);
    }

    /// Take the work deferred so far; anything deferred while it runs
    /// waits for the following iteration
    pub fn take_deferred(&mut self) -> Vec<T> {
        self.deferred.drain(..).collect()
    }

    /// Collect every timer fire due at `now_ms`, in deadline order
    ///
    /// One-shot timers are removed. A repeating timer that fell behind
    /// yields one fire per elapsed period.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<T> {
        let mut fires: Vec<(u64, u64, T)> = Vec::new();
        let mut expired: Vec<K> = Vec::new();

        for (key, timer) in self.timers.iter_mut() {
            while timer.deadline_ms <= now_ms {
                fires.push((timer.deadline_ms, timer.seq, timer.task.clone()));
                match timer.period_ms {
                    Some(period) => timer.deadline_ms += period,
                    None => {
                        expired.push(key.clone());
                        break;
                    }
                }
            }
        }

        for key in expired {
            self.timers.remove(&key);
        }

        fires.sort_by_key(|(deadline, seq, _)| (*deadline, *seq));
        fires.into_iter().map(|(_, _, task)| task).collect()
    }

    /// Drop every timer and all deferred work
    pub fn clear(&mut self) {
        self.timers.clear();
        self.deferred.clear();
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

impl<K, T> Default for Scheduler<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
