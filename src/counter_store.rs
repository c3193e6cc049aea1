use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::sweep::Sweep;

// One fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub window_start: u64,
    pub window_ms: u64,
}

impl CounterRecord {
    pub fn expires_at(&self) -> u64 {
        self.window_start.saturating_add(self.window_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at()
    }
}

// Key -> fixed-window counter map.
// Each key's read-modify-write happens under its DashMap shard lock, so
// concurrent increments of the same key never lose an update. Expired
// records are dropped lazily: on access, or by a `Sweep`.
#[derive(Debug)]
pub struct TimedCounterStore {
    records: DashMap<String, CounterRecord>,
    clock: SharedClock,
}

impl TimedCounterStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // Counts one event and returns the record as it stands afterwards.
    // Starts a fresh window (count 1) when the key is absent or its window
    // has elapsed. Panics on a zero-length window.
    pub fn increment_record(&self, key: &str, window_ms: u64) -> CounterRecord {
        assert!(window_ms > 0, "counter window must be positive (key {key:?})");
        let now = self.clock.now_ms();
        let mut record = self
            .records
            .entry(key.to_owned())
            .or_insert(CounterRecord {
                count: 0,
                window_start: now,
                window_ms,
            });

        if record.is_expired(now) {
            *record = CounterRecord {
                count: 0,
                window_start: now,
                window_ms,
            };
        }
        record.count += 1;
        *record
    }

    pub fn increment(&self, key: &str, window_ms: u64) -> u64 {
        self.increment_record(key, window_ms).count
    }

    // Takes one back from the window that started at `window_start`.
    // A newer window is left untouched.
    pub fn decrement_in_window(&self, key: &str, window_start: u64) -> Option<u64> {
        let now = self.clock.now_ms();
        let mut record = self.records.get_mut(key)?;
        if record.window_start != window_start || record.is_expired(now) {
            return None;
        }
        record.count = record.count.saturating_sub(1);
        Some(record.count)
    }

    // Current live record, dropping it if it has expired.
    pub fn record(&self, key: &str) -> Option<CounterRecord> {
        let now = self.clock.now_ms();
        let record = *self.records.get(key)?;
        if record.is_expired(now) {
            self.records.remove_if(key, |_, r| r.is_expired(now));
            return None;
        }
        Some(record)
    }

    pub fn peek(&self, key: &str) -> u64 {
        self.record(key).map_or(0, |r| r.count)
    }

    pub fn remaining_ms(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        self.record(key).map(|r| r.expires_at().saturating_sub(now))
    }

    pub fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Sweep for TimedCounterStore {
    fn name(&self) -> &'static str {
        "counters"
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now_ms));
        before.saturating_sub(self.records.len())
    }
}
