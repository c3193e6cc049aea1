use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::counter_store::TimedCounterStore;
use crate::sweep::Sweep;

// Cache entry with absolute expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }
}

// In-process stand-in for the remote backend. Values and counters live in
// separate maps; writing one kind under a key clears the other.
#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, CacheEntry>,
    counters: TimedCounterStore,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            values: DashMap::new(),
            counters: TimedCounterStore::new(clock.clone()),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.values.get(key).map(|e| e.value().clone()) {
            if entry.is_expired(now) {
                self.values.remove_if(key, |_, e| e.is_expired(now));
                return None;
            }
            return Some(entry.value);
        }
        self.counters.record(key).map(|r| r.count.to_string())
    }

    pub fn set(&self, key: &str, value: String, ttl_secs: u64) {
        let now = self.clock.now_ms();
        let expires_at = (ttl_secs > 0).then(|| now.saturating_add(ttl_secs.saturating_mul(1000)));
        self.counters.reset(key);
        self.values
            .insert(key.to_owned(), CacheEntry { value, expires_at });
    }

    pub fn delete(&self, key: &str) {
        self.values.remove(key);
        self.counters.reset(key);
    }

    // Expiry is fixed by the increment that creates the counter.
    pub fn incr(&self, key: &str, ttl_secs: u64) -> u64 {
        self.values.remove(key);
        self.counters.increment(key, ttl_secs.saturating_mul(1000))
    }

    // Seconds left, `-1` for no expiry, `-2` for a missing key.
    pub fn ttl(&self, key: &str) -> i64 {
        let now = self.clock.now_ms();
        if let Some(entry) = self.values.get(key).map(|e| e.value().clone()) {
            return match entry.expires_at {
                None => -1,
                Some(at) if now < at => crate::clock::secs_until(now, at) as i64,
                Some(_) => -2,
            };
        }
        match self.counters.remaining_ms(key) {
            Some(ms) => crate::clock::secs_until(0, ms) as i64,
            None => -2,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sweep for MemoryStore {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let before = self.values.len();
        self.values.retain(|_, e| !e.is_expired(now_ms));
        before.saturating_sub(self.values.len()) + self.counters.sweep(now_ms)
    }
}
