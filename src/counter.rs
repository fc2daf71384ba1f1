//! Cross-cycle cache of raw cumulative counters.
//!
//! Collectors feed each cycle's raw counter reading in and get back either a
//! delta against the previous cycle or, the first time a key is seen, the
//! neutral value for its reset policy. The store lives inside the
//! orchestrator and is lent out `&mut` to one collector at a time, so it
//! needs no locking.

use std::collections::HashMap;

/// What to do when a counter goes backwards (service restart, wrap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Report zero for the cycle in which the counter dropped.
    ClampToZero,
    /// Treat the new raw value as the delta, so a restart is not under-reported.
    ResyncToRaw,
}

impl ResetPolicy {
    /// Value reported before a baseline exists
    pub fn neutral(&self, raw: f64) -> f64 {
        match self {
            ResetPolicy::ClampToZero => 0.0,
            ResetPolicy::ResyncToRaw => raw,
        }
    }

    fn on_reset(&self, raw: f64) -> f64 {
        match self {
            ResetPolicy::ClampToZero => 0.0,
            ResetPolicy::ResyncToRaw => raw,
        }
    }
}

/// Result of feeding one raw reading into the store
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First sighting of the key; no delta can be computed yet.
    Baseline { neutral: f64 },
    /// Difference against the previous reading, reset policy already applied.
    Delta(f64),
}

impl Observation {
    pub fn delta(&self) -> Option<f64> {
        match self {
            Observation::Delta(d) => Some(*d),
            Observation::Baseline { .. } => None,
        }
    }

    pub fn value_or_neutral(&self) -> f64 {
        match self {
            Observation::Delta(d) => *d,
            Observation::Baseline { neutral } => *neutral,
        }
    }
}

#[derive(Debug, Default)]
pub struct CounterStore {
    values: HashMap<String, f64>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `raw` under `key` and report the change since the last cycle
    pub fn observe(&mut self, key: &str, raw: f64, policy: ResetPolicy) -> Observation {
        let previous = self.values.insert(key.to_string(), raw);
        match previous {
            None => Observation::Baseline { neutral: policy.neutral(raw) },
            Some(prev) => {
                let delta = raw - prev;
                if delta < 0.0 {
                    tracing::debug!(key, prev, raw, ?policy, "Counter went backwards");
                    Observation::Delta(policy.on_reset(raw))
                } else {
                    Observation::Delta(delta)
                }
            }
        }
    }

    /// Per-interval rate: delta divided by the interval, or the neutral
    /// value on the first sighting of `key`.
    pub fn rate(&mut self, key: &str, raw: f64, interval_secs: f64, policy: ResetPolicy) -> f64 {
        match self.observe(key, raw, policy) {
            Observation::Baseline { neutral } => neutral,
            Observation::Delta(delta) if interval_secs > 0.0 => delta / interval_secs,
            Observation::Delta(delta) => delta,
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn forget(&mut self, key: &str) -> Option<f64> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
