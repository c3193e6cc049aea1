use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

use crate::clock::SharedClock;
use crate::sweep::Sweep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspicionSettings {
    pub block_threshold: u32,
    pub block_duration: Duration,
    pub idle_eviction: Duration,
}

impl Default for SuspicionSettings {
    fn default() -> Self {
        Self {
            block_threshold: 10,
            block_duration: Duration::from_secs(60 * 60),
            idle_eviction: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspicionEntry {
    pub ip: String,
    pub count: u32,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub blocked: bool,
    pub reasons: BTreeSet<String>,
}

impl SuspicionEntry {
    fn new(ip: &str, now_ms: u64) -> Self {
        Self {
            ip: ip.to_string(),
            count: 0,
            first_seen_at: now_ms,
            last_seen_at: now_ms,
            blocked: false,
            reasons: BTreeSet::new(),
        }
    }

    fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_at)
    }
}

#[derive(Debug)]
pub struct SuspicionLedger {
    entries: DashMap<String, SuspicionEntry>,
    settings: SuspicionSettings,
    clock: SharedClock,
}

impl SuspicionLedger {
    pub fn new(settings: SuspicionSettings, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &SuspicionSettings {
        &self.settings
    }

    fn block_expired(&self, entry: &SuspicionEntry, now_ms: u64) -> bool {
        entry.blocked && entry.idle_ms(now_ms) > self.settings.block_duration.as_millis() as u64
    }

    fn unblock_if_expired(&self, entry: &mut SuspicionEntry, now_ms: u64) {
        if self.block_expired(entry, now_ms) {
            entry.blocked = false;
            entry.count = 0;
            entry.reasons.clear();
        }
    }

    // Records one suspicious event and returns whether the IP is now blocked.
    pub fn mark_suspicious(&self, ip: &str, reason: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entry = self
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| SuspicionEntry::new(ip, now));

        self.unblock_if_expired(&mut entry, now);
        entry.count += 1;
        if !entry.reasons.contains(reason) {
            entry.reasons.insert(reason.to_string());
        }
        entry.last_seen_at = now;

        if !entry.blocked && entry.count >= self.settings.block_threshold {
            entry.blocked = true;
            warn!(ip, count = entry.count, reasons = ?entry.reasons, "ip blocked");
        }
        entry.blocked
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.entry(ip).is_some_and(|e| e.blocked)
    }

    // Snapshot of one IP, after applying any pending unblock.
    pub fn entry(&self, ip: &str) -> Option<SuspicionEntry> {
        let now = self.clock.now_ms();
        let mut entry = self.entries.get_mut(ip)?;
        self.unblock_if_expired(&mut entry, now);
        Some(entry.clone())
    }

    pub fn count(&self, ip: &str) -> u32 {
        self.entry(ip).map_or(0, |e| e.count)
    }

    pub fn clear(&self, ip: &str) {
        self.entries.remove(ip);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn blocked_count(&self) -> usize {
        self.entries.iter().filter(|e| e.blocked).count()
    }
}

impl Sweep for SuspicionLedger {
    fn name(&self) -> &'static str {
        "suspicion"
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let idle_limit = self.settings.idle_eviction.as_millis() as u64;
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for ip in keys {
            if let Some(mut entry) = self.entries.get_mut(&ip) {
                self.unblock_if_expired(&mut entry, now_ms);
            }
            let evicted = self
                .entries
                .remove_if(&ip, |_, e| !e.blocked && e.idle_ms(now_ms) > idle_limit);
            if evicted.is_some() {
                removed += 1;
            }
        }
        crate::metrics::SUSPICIOUS_IPS.set(self.entries.len() as f64);
        removed
    }
}
